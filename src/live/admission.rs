//! Blind-increment admission control.
//!
//! The counter is incremented first and checked afterwards, so the common
//! path costs one round trip. When the new total is over the limit the same
//! delta is subtracted from the same key and the call fails. Two racing
//! callers can both push the counter past the limit before either rollback
//! lands; callers must not treat this as hard enforcement.

use async_trait::async_trait;

use super::{LimitedResource, LiveAccountingError, Result};

/// Raw atomic counter primitives.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64>;

    async fn decr_by(&self, key: &[u8], delta: i64) -> Result<i64>;
}

pub async fn add_up_to_limit<S>(
    store: &S,
    key: &[u8],
    resource: LimitedResource,
    delta: i64,
    limit: i64,
) -> Result<()>
where
    S: CounterStore + ?Sized,
{
    let total = store.incr_by(key, delta).await?;
    if total <= limit {
        return Ok(());
    }

    store.decr_by(key, delta).await?;
    tracing::debug!(%resource, delta, limit, total, "usage over limit, increment rolled back");

    Err(LiveAccountingError::ProjectLimitExceeded {
        resource,
        delta,
        limit,
    })
}
