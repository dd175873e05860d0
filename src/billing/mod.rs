//! Billing transaction ledger with per-user running balances.

mod balance;
pub mod currency;
pub mod metadata;
#[cfg(feature = "ledger-sqlite")]
mod sqlite_db;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use currency::{Amount, Currency};
#[cfg(feature = "ledger-sqlite")]
pub use sqlite_db::SqliteBillingDb;

pub type UserId = uuid::Uuid;

/// Most supplemental transactions a single insert accepts. Inserts are for
/// small groups that must commit together, not bulk loads.
pub const SUPPLEMENTAL_TX_LIMIT: usize = 5;

/// Attempts made when a concurrent writer changes a balance mid-insert.
pub const MAX_INSERT_ATTEMPTS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Cancelled,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BillingError::InvalidStoredValue(format!(
                "unknown transaction status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Credit,
    Debit,
    Unknown,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for TransactionType {
    type Err = BillingError;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "credit" => Ok(Self::Credit),
            "debit" => Ok(Self::Debit),
            "unknown" => Ok(Self::Unknown),
            other => Err(BillingError::InvalidStoredValue(format!(
                "unknown transaction type {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monetary balance adjustment.
///
/// `id` and `created_at` are assigned by the store; whatever the caller puts
/// there is ignored on insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: UserId,
    pub amount: Amount,
    pub description: String,
    pub source: String,
    pub status: TransactionStatus,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: UserId,
        amount: Amount,
        source: impl Into<String>,
        kind: TransactionType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            amount,
            description: String::new(),
            source: source.into(),
            status: TransactionStatus::Pending,
            kind,
            metadata: serde_json::Value::Null,
            timestamp,
            created_at: timestamp,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("cannot insert more than {limit} supplemental transactions (tried {tried})")]
    TooManySupplemental { limit: usize, tried: usize },
    #[error("insufficient funds for user {user_id}")]
    InsufficientFunds { user_id: UserId },
    #[error("no transactions in the database")]
    NoTransactions,
    #[error("transaction {0} not found")]
    TransactionNotFound(i64),
    #[error("unable to insert billing transaction after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid stored value: {0}")]
    InvalidStoredValue(String),
    #[cfg(feature = "ledger-sqlite")]
    #[error("billing store {op} failed{}: {source}", user_suffix(.user_id))]
    Store {
        op: &'static str,
        user_id: Option<UserId>,
        #[source]
        source: rusqlite::Error,
    },
    #[error("billing store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BillingError {
    /// True when a write lost a race against a concurrent balance update.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            #[cfg(feature = "ledger-sqlite")]
            Self::Store {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => err.code == rusqlite::ErrorCode::ConstraintViolation,
            _ => false,
        }
    }
}

#[cfg(feature = "ledger-sqlite")]
fn user_suffix(user_id: &Option<UserId>) -> String {
    user_id
        .map(|user_id| format!(" (user={user_id})"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, BillingError>;

/// Durable storage of billing transactions and balances.
#[async_trait]
pub trait TransactionsDb: Send + Sync {
    /// Records `primary` and up to [`SUPPLEMENTAL_TX_LIMIT`] related
    /// transactions atomically, adjusting each affected balance. Returns the
    /// assigned ids, primary first.
    async fn insert(&self, primary: &Transaction, supplemental: &[Transaction])
    -> Result<Vec<i64>>;

    async fn update_status(&self, tx_id: i64, status: TransactionStatus) -> Result<()>;

    /// Merges the top-level keys of `metadata` into the stored document.
    async fn update_metadata(&self, tx_id: i64, metadata: &serde_json::Value) -> Result<()>;

    /// Business timestamp and metadata of the newest transaction with the
    /// given source and type, by creation time.
    async fn last_transaction(
        &self,
        source: &str,
        kind: TransactionType,
    ) -> Result<(DateTime<Utc>, serde_json::Value)>;

    async fn list(&self, user_id: UserId) -> Result<Vec<Transaction>>;

    async fn list_source(&self, user_id: UserId, source: &str) -> Result<Vec<Transaction>>;

    /// Zero for users without a balance row.
    async fn get_balance(&self, user_id: UserId) -> Result<Amount>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    pub database_path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl BillingConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_type_round_trip_through_storage_strings() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Cancelled,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        for kind in [
            TransactionType::Credit,
            TransactionType::Debit,
            TransactionType::Unknown,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionType>().unwrap(), kind);
        }
        assert!("refunded".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn transaction_serializes_kind_as_type() {
        let tx = Transaction::new(
            UserId::nil(),
            Currency::UsDollarsMicro.zero(),
            "storjscan",
            TransactionType::Debit,
            Utc::now(),
        );
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["type"], "debit");
        assert_eq!(value["status"], "pending");
    }
}
