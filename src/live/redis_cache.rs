use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;

use super::admission::{self, CounterStore};
use super::keys::{self, display_key};
use super::{
    LimitedResource, LiveAccounting, LiveAccountingError, ProjectId, Result, Usage,
    collect_projects, parse_counter, ttl_seconds,
};

// Sets the key only when absent; the TTL is attached only if the set happened.
const INSERT_IF_ABSENT_SCRIPT: &str = r#"
local inserted = redis.call("SETNX", KEYS[1], ARGV[1])
if tonumber(inserted) == 1 then
  redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return inserted
"#;

// A post-increment value equal to the increment means this call created the
// key, so it is the only caller that attaches the TTL.
const INCREMENT_WITH_FIRST_TTL_SCRIPT: &str = r#"
local current = redis.call("INCRBY", KEYS[1], ARGV[1])
if tonumber(current) == tonumber(ARGV[1]) then
  redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return current
"#;

#[derive(Clone, Debug)]
pub struct RedisLiveAccounting {
    client: redis::Client,
    batch_size: usize,
    slot: Arc<RwLock<ConnectionSlot>>,
}

/// The shared connection. It is opened on first use, reopened after the
/// transport drops, and released by `close`.
enum ConnectionSlot {
    Idle,
    Ready(MultiplexedConnection),
    Closed,
}

impl fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Ready(_) => f.write_str("Ready"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

impl RedisLiveAccounting {
    /// Parses `address` and pings the server.
    ///
    /// A malformed address fails with `InvalidArgument`. A failed ping still
    /// returns the handle, paired with the `SystemOrNet` error.
    pub async fn open(
        address: &str,
        batch_size: usize,
    ) -> Result<(Self, Option<LiveAccountingError>)> {
        let client = redis::Client::open(address).map_err(|err| {
            LiveAccountingError::InvalidArgument(format!("invalid redis address: {err}"))
        })?;

        let cache = Self {
            client,
            batch_size: batch_size.max(1),
            slot: Arc::new(RwLock::new(ConnectionSlot::Idle)),
        };

        let ping_error = cache.ping().await.err();
        if let Some(err) = &ping_error {
            tracing::warn!(error = %err, "live accounting cache unreachable at startup");
        }
        Ok((cache, ping_error))
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection("ping").await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| self.failure("ping", None, err))?;
        Ok(())
    }

    async fn connection(&self, op: &'static str) -> Result<MultiplexedConnection> {
        {
            let slot = self.slot.read().await;
            match &*slot {
                ConnectionSlot::Ready(conn) => return Ok(conn.clone()),
                ConnectionSlot::Closed => return Err(closed(op)),
                ConnectionSlot::Idle => {}
            }
        }

        let mut slot = self.slot.write().await;
        match &*slot {
            ConnectionSlot::Ready(conn) => return Ok(conn.clone()),
            ConnectionSlot::Closed => return Err(closed(op)),
            ConnectionSlot::Idle => {}
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| LiveAccountingError::system(op, err))?;
        tracing::debug!("live accounting connection established");
        *slot = ConnectionSlot::Ready(conn.clone());
        Ok(conn)
    }

    /// Maps a command error. A dropped transport releases the shared
    /// connection so the next call reconnects.
    fn failure(
        &self,
        op: &'static str,
        key: Option<&[u8]>,
        err: redis::RedisError,
    ) -> LiveAccountingError {
        if err.is_io_error() || err.is_connection_dropped() {
            if let Ok(mut slot) = self.slot.try_write() {
                if matches!(*slot, ConnectionSlot::Ready(_)) {
                    *slot = ConnectionSlot::Idle;
                }
            }
        }
        match key {
            Some(key) => LiveAccountingError::system_at(op, key, err),
            None => LiveAccountingError::system(op, err),
        }
    }

    async fn get_int64(&self, key: &[u8]) -> Result<i64> {
        let mut conn = self.connection("get").await?;
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|err| self.failure("get", Some(key), err))?;

        let Some(value) = value else {
            return Err(LiveAccountingError::KeyNotFound {
                key: display_key(key),
            });
        };
        parse_counter(Some(&value), key)
    }

    async fn mget(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(conn)
            .await
            .map_err(|err| self.failure("mget", keys.first().map(Vec::as_slice), err))?;
        Ok(values)
    }
}

fn closed(op: &'static str) -> LiveAccountingError {
    LiveAccountingError::system(op, "cache is closed")
}

/// Reads the storage and segment counters of `projects`, one `fetch` call
/// per key kind for every `batch_size` projects. Missing counters are zero.
async fn fill_usage<F, Fut>(
    projects: BTreeSet<ProjectId>,
    batch_size: usize,
    mut fetch: F,
) -> Result<HashMap<ProjectId, Usage>>
where
    F: FnMut(&[Vec<u8>]) -> Fut,
    Fut: Future<Output = Result<Vec<Option<Vec<u8>>>>>,
{
    let projects: Vec<ProjectId> = projects.into_iter().collect();
    let mut totals = HashMap::with_capacity(projects.len());

    for batch in projects.chunks(batch_size.max(1)) {
        let segment_keys: Vec<Vec<u8>> = batch.iter().map(keys::segment_key).collect();
        let storage_keys: Vec<Vec<u8>> = batch.iter().map(keys::storage_key).collect();

        let segment_values = fetch(&segment_keys).await?;
        let storage_values = fetch(&storage_keys).await?;
        if segment_values.len() != batch.len() || storage_values.len() != batch.len() {
            return Err(LiveAccountingError::UnexpectedValue(format!(
                "mget returned {} and {} values for {} keys",
                segment_values.len(),
                storage_values.len(),
                batch.len()
            )));
        }

        for (i, project_id) in batch.iter().enumerate() {
            let usage = Usage {
                segments: parse_counter(segment_values[i].as_deref(), &segment_keys[i])?,
                storage: parse_counter(storage_values[i].as_deref(), &storage_keys[i])?,
            };
            totals.insert(*project_id, usage);
        }
    }

    Ok(totals)
}

#[async_trait]
impl CounterStore for RedisLiveAccounting {
    async fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        let mut conn = self.connection("incrby").await?;
        conn.incr(key, delta)
            .await
            .map_err(|err| self.failure("incrby", Some(key), err))
    }

    async fn decr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        let mut conn = self.connection("decrby").await?;
        conn.decr(key, delta)
            .await
            .map_err(|err| self.failure("decrby", Some(key), err))
    }
}

#[async_trait]
impl LiveAccounting for RedisLiveAccounting {
    async fn get_storage_usage(&self, project_id: ProjectId) -> Result<i64> {
        self.get_int64(&keys::storage_key(&project_id)).await
    }

    async fn get_bandwidth_usage(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<i64> {
        self.get_int64(&keys::bandwidth_key(&project_id, now)).await
    }

    async fn get_segment_usage(&self, project_id: ProjectId) -> Result<i64> {
        self.get_int64(&keys::segment_key(&project_id)).await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn insert_bandwidth_usage(
        &self,
        project_id: ProjectId,
        value: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = keys::bandwidth_key(&project_id, now);
        let mut conn = self.connection("eval").await?;
        let inserted: i64 = redis::Script::new(INSERT_IF_ABSENT_SCRIPT)
            .key(&key)
            .arg(value)
            .arg(ttl_seconds(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| self.failure("eval", Some(&key), err))?;
        Ok(inserted == 1)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn update_bandwidth_usage(
        &self,
        project_id: ProjectId,
        delta: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = keys::bandwidth_key(&project_id, now);
        let mut conn = self.connection("eval").await?;
        let _: i64 = redis::Script::new(INCREMENT_WITH_FIRST_TTL_SCRIPT)
            .key(&key)
            .arg(delta)
            .arg(ttl_seconds(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| self.failure("eval", Some(&key), err))?;
        Ok(())
    }

    async fn update_segment_usage(&self, project_id: ProjectId, delta: i64) -> Result<()> {
        self.incr_by(&keys::segment_key(&project_id), delta).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn add_segment_usage_up_to_limit(
        &self,
        project_id: ProjectId,
        delta: i64,
        limit: i64,
    ) -> Result<()> {
        let key = keys::segment_key(&project_id);
        admission::add_up_to_limit(self, &key, LimitedResource::Segments, delta, limit).await
    }

    async fn add_storage_usage(&self, project_id: ProjectId, delta: i64) -> Result<()> {
        self.incr_by(&keys::storage_key(&project_id), delta).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn add_storage_usage_up_to_limit(
        &self,
        project_id: ProjectId,
        delta: i64,
        limit: i64,
    ) -> Result<()> {
        let key = keys::storage_key(&project_id);
        admission::add_up_to_limit(self, &key, LimitedResource::Storage, delta, limit).await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn get_all_project_totals(&self) -> Result<HashMap<ProjectId, Usage>> {
        let mut conn = self.connection("scan").await?;

        let mut projects = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(self.batch_size)
                .query_async(&mut conn)
                .await
                .map_err(|err| self.failure("scan", None, err))?;
            projects.extend(collect_projects(page.iter().map(Vec::as_slice))?);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(projects = projects.len(), "scanned live accounting keyspace");
        fill_usage(projects, self.batch_size, |batch_keys| {
            let mut conn = conn.clone();
            let batch_keys = batch_keys.to_vec();
            async move { self.mget(&mut conn, &batch_keys).await }
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.slot.write().await;
        if matches!(*slot, ConnectionSlot::Closed) {
            return Err(LiveAccountingError::system("close", "cache already closed"));
        }
        *slot = ConnectionSlot::Closed;
        Ok(())
    }
}
