//! Per-project live usage counters and a per-user billing ledger.
//!
//! [`live`] keeps fast, approximate storage/segment/bandwidth counters in a
//! shared cache and admits uploads against project limits. [`billing`]
//! records monetary transactions and keeps running balances consistent under
//! concurrent writers.

pub mod billing;
pub mod config;
pub mod live;
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use billing::{
    Amount, BillingConfig, BillingError, Currency, Transaction, TransactionStatus,
    TransactionType, TransactionsDb, UserId,
};
#[cfg(feature = "ledger-sqlite")]
pub use billing::SqliteBillingDb;
pub use config::{AccountingConfig, ConfigError};
pub use live::{
    LimitedResource, LiveAccounting, LiveAccountingConfig, LiveAccountingError, OpenOutcome,
    ProjectId, Usage,
};
