//! Balance arithmetic for ledger inserts, kept free of any store access.
//!
//! [`PreparedInsert`] is computed once per insert call. Each commit attempt
//! then reads the current balances and calls [`BalanceDeltas::plan`], so a
//! retried attempt always works from a fresh read.

use std::collections::BTreeMap;

use super::{BillingError, Currency, Transaction, UserId, metadata};

/// A transaction converted to storage units, ready to be written.
#[derive(Clone, Debug)]
pub(crate) struct PreparedTransaction {
    pub user_id: UserId,
    pub amount_micro: i64,
    pub currency: &'static str,
    pub description: String,
    pub source: String,
    pub status: &'static str,
    pub kind: &'static str,
    pub metadata_json: String,
    pub timestamp_micros: i64,
}

impl PreparedTransaction {
    fn new(tx: &Transaction) -> Result<Self, BillingError> {
        let amount = tx.amount.convert_truncating(Currency::UsDollarsMicro)?;
        Ok(Self {
            user_id: tx.user_id,
            amount_micro: amount.base_units(),
            currency: amount.currency().symbol(),
            description: tx.description.clone(),
            source: tx.source.clone(),
            status: tx.status.as_str(),
            kind: tx.kind.as_str(),
            metadata_json: serde_json::to_string(&metadata::normalize(&tx.metadata)?)?,
            timestamp_micros: tx.timestamp.timestamp_micros(),
        })
    }
}

/// Net balance change per user, in micro-dollars.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct BalanceDeltas(BTreeMap<UserId, i64>);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BalanceUpdate {
    pub user_id: UserId,
    pub old_balance: i64,
    pub new_balance: i64,
}

impl BalanceDeltas {
    fn add(&mut self, user_id: UserId, amount_micro: i64) -> Result<(), BillingError> {
        let delta = self.0.entry(user_id).or_insert(0);
        *delta = delta.checked_add(amount_micro).ok_or_else(|| {
            BillingError::InvalidAmount(format!("balance delta for user {user_id} overflows"))
        })?;
        Ok(())
    }

    /// Applies the deltas to the balances returned by `current_balance`.
    /// Fails with `InsufficientFunds` if any user would end up negative.
    pub fn plan<F>(&self, mut current_balance: F) -> Result<Vec<BalanceUpdate>, BillingError>
    where
        F: FnMut(&UserId) -> Result<i64, BillingError>,
    {
        let mut updates = Vec::with_capacity(self.0.len());
        for (user_id, delta) in &self.0 {
            let old_balance = current_balance(user_id)?;
            let new_balance = old_balance.checked_add(*delta).ok_or_else(|| {
                BillingError::InvalidAmount(format!("balance for user {user_id} overflows"))
            })?;
            if new_balance < 0 {
                return Err(BillingError::InsufficientFunds { user_id: *user_id });
            }
            updates.push(BalanceUpdate {
                user_id: *user_id,
                old_balance,
                new_balance,
            });
        }
        Ok(updates)
    }
}

/// Rows to insert, primary first, and the balance deltas they imply.
#[derive(Clone, Debug)]
pub(crate) struct PreparedInsert {
    pub rows: Vec<PreparedTransaction>,
    pub deltas: BalanceDeltas,
}

impl PreparedInsert {
    pub fn new(primary: &Transaction, supplemental: &[Transaction]) -> Result<Self, BillingError> {
        let mut rows = Vec::with_capacity(1 + supplemental.len());
        let mut deltas = BalanceDeltas::default();
        for tx in std::iter::once(primary).chain(supplemental) {
            let row = PreparedTransaction::new(tx)?;
            deltas.add(row.user_id, row.amount_micro)?;
            rows.push(row);
        }
        Ok(Self { rows, deltas })
    }
}
