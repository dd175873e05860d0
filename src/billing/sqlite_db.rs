use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::balance::{BalanceUpdate, PreparedInsert};
use super::{
    Amount, BillingConfig, BillingError, Currency, MAX_INSERT_ATTEMPTS, Result,
    SUPPLEMENTAL_TX_LIMIT, Transaction, TransactionStatus, TransactionType, TransactionsDb, UserId,
    metadata,
};

const TRANSACTION_COLUMNS: &str = "id, user_id, amount, currency, description, source, status, \
     type, metadata, timestamp, created_at";

/// Billing ledger backed by a SQLite file. Every call opens its own
/// connection on the blocking pool.
#[derive(Clone, Debug)]
pub struct SqliteBillingDb {
    path: PathBuf,
    busy_timeout: Duration,
}

trait StoreContext<T> {
    fn context(self, op: &'static str) -> Result<T>;

    fn context_for(self, op: &'static str, user_id: &UserId) -> Result<T>;
}

impl<T> StoreContext<T> for std::result::Result<T, rusqlite::Error> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|source| BillingError::Store {
            op,
            user_id: None,
            source,
        })
    }

    fn context_for(self, op: &'static str, user_id: &UserId) -> Result<T> {
        self.map_err(|source| BillingError::Store {
            op,
            user_id: Some(*user_id),
            source,
        })
    }
}

impl SqliteBillingDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Builds the store from config and creates the schema if needed.
    pub async fn open(config: &BillingConfig) -> Result<Self> {
        let db = Self::new(&config.database_path)
            .with_busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        self.with_connection(|conn| init_schema(conn)).await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = open_connection(&path, busy_timeout)?;
            f(&mut conn)
        })
        .await?
    }

    async fn query_transactions(
        &self,
        user_id: UserId,
        source: Option<String>,
    ) -> Result<Vec<Transaction>> {
        self.with_connection(move |conn| {
            let (filter, source) = match source {
                Some(source) => ("user_id = ?1 AND source = ?2", Some(source)),
                None => ("user_id = ?1 AND ?2 IS NULL", None),
            };
            let sql = format!(
                "SELECT {TRANSACTION_COLUMNS} FROM billing_transactions
                 WHERE {filter}
                 ORDER BY timestamp DESC, id DESC"
            );
            let mut stmt = conn.prepare(&sql).context("prepare list")?;
            let rows = stmt
                .query_map(
                    rusqlite::params![user_id.as_bytes().as_slice(), source],
                    StoredRow::read,
                )
                .context_for("list", &user_id)?;
            let mut transactions = Vec::new();
            for row in rows {
                transactions.push(row.context_for("list", &user_id)?.into_transaction()?);
            }
            Ok(transactions)
        })
        .await
    }
}

#[async_trait]
impl TransactionsDb for SqliteBillingDb {
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %primary.user_id), err)]
    async fn insert(
        &self,
        primary: &Transaction,
        supplemental: &[Transaction],
    ) -> Result<Vec<i64>> {
        if supplemental.len() > SUPPLEMENTAL_TX_LIMIT {
            return Err(BillingError::TooManySupplemental {
                limit: SUPPLEMENTAL_TX_LIMIT,
                tried: supplemental.len(),
            });
        }

        let prepared = PreparedInsert::new(primary, supplemental)?;
        self.with_connection(move |conn| retry_on_conflict(|_| try_insert(conn, &prepared)))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn update_status(&self, tx_id: i64, status: TransactionStatus) -> Result<()> {
        self.with_connection(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE billing_transactions SET status = ?2 WHERE id = ?1",
                    rusqlite::params![tx_id, status.as_str()],
                )
                .context("update status")?;
            if changed == 0 {
                return Err(BillingError::TransactionNotFound(tx_id));
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, metadata), err)]
    async fn update_metadata(&self, tx_id: i64, metadata: &serde_json::Value) -> Result<()> {
        let update = metadata::normalize(metadata)?;
        self.with_connection(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("begin update metadata")?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM billing_transactions WHERE id = ?1",
                    rusqlite::params![tx_id],
                    |row| row.get(0),
                )
                .optional()
                .context("read metadata")?;
            let Some(existing) = existing else {
                return Err(BillingError::TransactionNotFound(tx_id));
            };

            let merged = metadata::merge(&existing, &update)?;
            tx.execute(
                "UPDATE billing_transactions SET metadata = ?2 WHERE id = ?1",
                rusqlite::params![tx_id, merged],
            )
            .context("write metadata")?;
            tx.commit().context("commit update metadata")?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn last_transaction(
        &self,
        source: &str,
        kind: TransactionType,
    ) -> Result<(DateTime<Utc>, serde_json::Value)> {
        let source = source.to_string();
        self.with_connection(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT timestamp, metadata FROM billing_transactions
                     WHERE source = ?1 AND type = ?2
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1",
                    rusqlite::params![source, kind.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("last transaction")?;
            let Some((timestamp, metadata)) = row else {
                return Err(BillingError::NoTransactions);
            };
            Ok((micros_to_datetime(timestamp)?, serde_json::from_str(&metadata)?))
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn list(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        self.query_transactions(user_id, None).await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn list_source(&self, user_id: UserId, source: &str) -> Result<Vec<Transaction>> {
        self.query_transactions(user_id, Some(source.to_string()))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn get_balance(&self, user_id: UserId) -> Result<Amount> {
        self.with_connection(move |conn| {
            let balance = read_balance(conn, &user_id)?;
            Ok(Amount::from_base_units(balance, Currency::UsDollarsMicro))
        })
        .await
    }
}

/// Runs `attempt` until it stops failing with a balance conflict, giving up
/// after [`MAX_INSERT_ATTEMPTS`] conflicts. `attempt` receives the 1-based
/// attempt number.
fn retry_on_conflict<T>(mut attempt: impl FnMut(usize) -> Result<T>) -> Result<T> {
    for n in 1..=MAX_INSERT_ATTEMPTS {
        match attempt(n) {
            Err(err) if err.is_constraint_violation() => {
                tracing::debug!(attempt = n, error = %err, "balance changed concurrently, retrying");
            }
            other => return other,
        }
    }
    Err(BillingError::RetriesExhausted {
        attempts: MAX_INSERT_ATTEMPTS,
    })
}

/// One commit attempt. The balances are read and written inside a single
/// immediate transaction, so a conflict only surfaces when the balance rows
/// change between [`plan_balances`] and [`write_insert`].
fn try_insert(conn: &mut rusqlite::Connection, prepared: &PreparedInsert) -> Result<Vec<i64>> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin insert")?;
    let updates = plan_balances(&tx, prepared)?;
    let ids = write_insert(&tx, prepared, &updates)?;
    tx.commit().context("commit insert")?;
    Ok(ids)
}

fn plan_balances(
    conn: &rusqlite::Connection,
    prepared: &PreparedInsert,
) -> Result<Vec<BalanceUpdate>> {
    prepared
        .deltas
        .plan(|user_id| read_balance(conn, user_id))
}

/// Swaps every balance and inserts the rows. A stale `updates` entry fails
/// with a constraint violation and the caller's transaction rolls back.
fn write_insert(
    conn: &rusqlite::Connection,
    prepared: &PreparedInsert,
    updates: &[BalanceUpdate],
) -> Result<Vec<i64>> {
    for update in updates {
        swap_balance(conn, update)?;
    }

    let created_at = Utc::now().timestamp_micros();
    let mut ids = Vec::with_capacity(prepared.rows.len());
    for row in &prepared.rows {
        conn.execute(
            "INSERT INTO billing_transactions
             (user_id, amount, currency, description, source, status, type, metadata, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                row.user_id.as_bytes().as_slice(),
                row.amount_micro,
                row.currency,
                row.description,
                row.source,
                row.status,
                row.kind,
                row.metadata_json,
                row.timestamp_micros,
                created_at,
            ],
        )
        .context_for("insert transaction", &row.user_id)?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

fn read_balance(conn: &rusqlite::Connection, user_id: &UserId) -> Result<i64> {
    let balance: Option<i64> = conn
        .query_row(
            "SELECT balance FROM billing_balances WHERE user_id = ?1",
            rusqlite::params![user_id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()
        .context_for("read balance", user_id)?;
    Ok(balance.unwrap_or(0))
}

// Compare-and-swap on the balance row. When no row matches the old value we
// try to create one; if a row already exists the primary key rejects it.
fn swap_balance(conn: &rusqlite::Connection, update: &BalanceUpdate) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE billing_balances SET balance = ?3 WHERE user_id = ?1 AND balance = ?2",
            rusqlite::params![
                update.user_id.as_bytes().as_slice(),
                update.old_balance,
                update.new_balance
            ],
        )
        .context_for("update balance", &update.user_id)?;
    if changed == 0 {
        conn.execute(
            "INSERT INTO billing_balances (user_id, balance) VALUES (?1, ?2)",
            rusqlite::params![update.user_id.as_bytes().as_slice(), update.new_balance],
        )
        .context_for("insert balance", &update.user_id)?;
    }
    Ok(())
}

struct StoredRow {
    id: i64,
    user_id: Vec<u8>,
    amount: i64,
    currency: String,
    description: String,
    source: String,
    status: String,
    kind: String,
    metadata: String,
    timestamp: i64,
    created_at: i64,
}

impl StoredRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            amount: row.get(2)?,
            currency: row.get(3)?,
            description: row.get(4)?,
            source: row.get(5)?,
            status: row.get(6)?,
            kind: row.get(7)?,
            metadata: row.get(8)?,
            timestamp: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_transaction(self) -> Result<Transaction> {
        let user_id = UserId::from_slice(&self.user_id).map_err(|err| {
            BillingError::InvalidStoredValue(format!("user id of transaction {}: {err}", self.id))
        })?;
        Ok(Transaction {
            id: self.id,
            user_id,
            amount: Amount::from_base_units(self.amount, self.currency.parse()?),
            description: self.description,
            source: self.source,
            status: self.status.parse()?,
            kind: self.kind.parse()?,
            metadata: serde_json::from_str(&self.metadata)?,
            timestamp: micros_to_datetime(self.timestamp)?,
            created_at: micros_to_datetime(self.created_at)?,
        })
    }
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
        BillingError::InvalidStoredValue(format!("timestamp {micros} out of range"))
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS billing_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id BLOB NOT NULL,
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            description TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            type TEXT NOT NULL,
            metadata TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS billing_transactions_user_id_timestamp
            ON billing_transactions (user_id, timestamp);

        CREATE INDEX IF NOT EXISTS billing_transactions_source_type_created_at
            ON billing_transactions (source, type, created_at);

        CREATE TABLE IF NOT EXISTS billing_balances (
            user_id BLOB PRIMARY KEY NOT NULL,
            balance INTEGER NOT NULL
        );",
    )
    .context("init schema")
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path).context("open")?;
    conn.busy_timeout(busy_timeout).context("busy timeout")?;
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}
