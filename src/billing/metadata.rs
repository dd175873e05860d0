use serde_json::{Map, Value};

use super::BillingError;

/// Metadata stored for a transaction that was created without any.
pub fn normalize(metadata: &Value) -> Result<Value, BillingError> {
    match metadata {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(metadata.clone()),
        other => Err(BillingError::InvalidMetadata(format!(
            "metadata must be a JSON object, got {other}"
        ))),
    }
}

/// Overlays the top-level keys of `update` onto `existing`. Keys absent from
/// `update` are kept; nested objects are replaced, not merged.
pub fn merge(existing: &str, update: &Value) -> Result<String, BillingError> {
    let mut merged: Map<String, Value> = serde_json::from_str(existing).map_err(|err| {
        BillingError::InvalidMetadata(format!("stored metadata is not a JSON object: {err}"))
    })?;

    if let Value::Object(update) = normalize(update)? {
        merged.extend(update);
    }

    Ok(serde_json::to_string(&merged)?)
}
