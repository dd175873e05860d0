use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::admission::{self, CounterStore};
use super::keys::{self, display_key};
use super::{
    LimitedResource, LiveAccounting, LiveAccountingError, ProjectId, Result, Usage,
    collect_projects, ttl_seconds,
};

#[derive(Clone, Copy, Debug)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-process live accounting with the same key layout and TTL rules as the
/// Redis backend. Counters do not survive the process.
#[derive(Clone, Debug, Default)]
pub struct MemoryLiveAccounting {
    entries: Arc<Mutex<Entries>>,
    closed: Arc<AtomicBool>,
}

impl MemoryLiveAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, op: &'static str) -> Result<MutexGuard<'_, Entries>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LiveAccountingError::system(op, "cache is closed"));
        }
        self.entries
            .lock()
            .map_err(|_| LiveAccountingError::system(op, "cache lock poisoned"))
    }

    fn get_int64(&self, key: &[u8]) -> Result<i64> {
        let mut entries = self.lock("get")?;
        purge_if_expired(&mut entries, key, Instant::now());
        entries
            .get(key)
            .map(|entry| entry.value)
            .ok_or_else(|| LiveAccountingError::KeyNotFound {
                key: display_key(key),
            })
    }

    fn incr(&self, op: &'static str, key: &[u8], delta: i64) -> Result<i64> {
        let mut entries = self.lock(op)?;
        purge_if_expired(&mut entries, key, Instant::now());
        let entry = entries.entry(key.to_vec()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        entry.value = entry.value.checked_add(delta).ok_or_else(|| {
            LiveAccountingError::system_at(op, key, "increment or decrement would overflow")
        })?;
        Ok(entry.value)
    }

    #[cfg(test)]
    fn expires_at(&self, key: &[u8]) -> Option<Instant> {
        let mut entries = self.lock("ttl").ok()?;
        purge_if_expired(&mut entries, key, Instant::now());
        let expires_at = entries.get(key)?.expires_at;
        expires_at
    }
}

type Entries = HashMap<Vec<u8>, Entry>;

// Expiry is applied lazily to the key being touched; only the full scan
// sweeps the whole map.
fn purge_if_expired(entries: &mut Entries, key: &[u8], now: Instant) {
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
}

#[async_trait]
impl CounterStore for MemoryLiveAccounting {
    async fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        self.incr("incrby", key, delta)
    }

    async fn decr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        let negated = delta.checked_neg().ok_or_else(|| {
            LiveAccountingError::system_at("decrby", key, "increment or decrement would overflow")
        })?;
        self.incr("decrby", key, negated)
    }
}

#[async_trait]
impl LiveAccounting for MemoryLiveAccounting {
    async fn get_storage_usage(&self, project_id: ProjectId) -> Result<i64> {
        self.get_int64(&keys::storage_key(&project_id))
    }

    async fn get_bandwidth_usage(&self, project_id: ProjectId, now: DateTime<Utc>) -> Result<i64> {
        self.get_int64(&keys::bandwidth_key(&project_id, now))
    }

    async fn get_segment_usage(&self, project_id: ProjectId) -> Result<i64> {
        self.get_int64(&keys::segment_key(&project_id))
    }

    async fn insert_bandwidth_usage(
        &self,
        project_id: ProjectId,
        value: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = keys::bandwidth_key(&project_id, now);
        let mut entries = self.lock("setnx")?;
        purge_if_expired(&mut entries, &key, Instant::now());
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds(ttl))),
            },
        );
        Ok(true)
    }

    async fn update_bandwidth_usage(
        &self,
        project_id: ProjectId,
        delta: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = keys::bandwidth_key(&project_id, now);
        let mut entries = self.lock("incrby")?;
        purge_if_expired(&mut entries, &key, Instant::now());
        let entry = entries.entry(key.clone()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        entry.value = entry.value.checked_add(delta).ok_or_else(|| {
            LiveAccountingError::system_at("incrby", &key, "increment or decrement would overflow")
        })?;
        if entry.value == delta {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds(ttl)));
        }
        Ok(())
    }

    async fn update_segment_usage(&self, project_id: ProjectId, delta: i64) -> Result<()> {
        self.incr("incrby", &keys::segment_key(&project_id), delta)?;
        Ok(())
    }

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
        self.incr("incrby", &keys::storage_key(&project_id), delta)?;
        Ok(())
    }

    async fn add_storage_usage_up_to_limit(
        &self,
        project_id: ProjectId,
        delta: i64,
        limit: i64,
    ) -> Result<()> {
        let key = keys::storage_key(&project_id);
        admission::add_up_to_limit(self, &key, LimitedResource::Storage, delta, limit).await
    }

    async fn get_all_project_totals(&self) -> Result<HashMap<ProjectId, Usage>> {
        let mut entries = self.lock("scan")?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        let projects = collect_projects(entries.keys().map(Vec::as_slice))?;

        let value_of = |key: Vec<u8>| entries.get(&key).map(|entry| entry.value).unwrap_or(0);
        Ok(projects
            .into_iter()
            .map(|project_id| {
                let usage = Usage {
                    storage: value_of(keys::storage_key(&project_id)),
                    segments: value_of(keys::segment_key(&project_id)),
                };
                (project_id, usage)
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(LiveAccountingError::system("close", "cache already closed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bandwidth_ttl_is_attached_by_first_increment_only() {
        let cache = MemoryLiveAccounting::new();
        let project_id = ProjectId::new_v4();
        let now = Utc::now();
        let key = keys::bandwidth_key(&project_id, now);
        let started = Instant::now();

        let mut handles = Vec::new();
        for i in 1..=16_u64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .update_bandwidth_usage(project_id, 10, Duration::from_secs(i * 100), now)
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("increment");
        }

        let deadline = cache.expires_at(&key).expect("ttl attached");
        assert!(deadline >= started + Duration::from_secs(100));
        assert!(deadline <= Instant::now() + Duration::from_secs(1600));
        assert_eq!(cache.get_bandwidth_usage(project_id, now).await.unwrap(), 160);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .update_bandwidth_usage(project_id, 1, Duration::from_secs(60_000), now)
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("increment");
        }

        assert_eq!(cache.expires_at(&key), Some(deadline));
        assert_eq!(cache.get_bandwidth_usage(project_id, now).await.unwrap(), 176);
    }

    #[tokio::test]
    async fn inserted_bandwidth_keeps_its_ttl_under_increments() {
        let cache = MemoryLiveAccounting::new();
        let project_id = ProjectId::new_v4();
        let now = Utc::now();
        let key = keys::bandwidth_key(&project_id, now);

        assert!(
            cache
                .insert_bandwidth_usage(project_id, 100, Duration::from_secs(60), now)
                .await
                .unwrap()
        );
        let deadline = cache.expires_at(&key).expect("ttl attached");

        cache
            .update_bandwidth_usage(project_id, 5, Duration::from_secs(3600), now)
            .await
            .unwrap();
        assert_eq!(cache.expires_at(&key), Some(deadline));
    }

    #[tokio::test]
    async fn storage_and_segment_counters_never_expire() {
        let cache = MemoryLiveAccounting::new();
        let project_id = ProjectId::new_v4();

        cache.add_storage_usage(project_id, 1).await.unwrap();
        cache.update_segment_usage(project_id, 1).await.unwrap();

        assert_eq!(cache.expires_at(&keys::storage_key(&project_id)), None);
        assert_eq!(cache.expires_at(&keys::segment_key(&project_id)), None);
    }

    #[tokio::test]
    async fn expired_counters_read_as_missing() {
        let cache = MemoryLiveAccounting::new();
        let project_id = ProjectId::new_v4();
        let now = Utc::now();
        let key = keys::bandwidth_key(&project_id, now);

        cache
            .insert_bandwidth_usage(project_id, 1, Duration::from_secs(60), now)
            .await
            .unwrap();
        cache
            .entries
            .lock()
            .unwrap()
            .get_mut(&key)
            .expect("entry")
            .expires_at = Some(Instant::now());

        let err = cache.get_bandwidth_usage(project_id, now).await.unwrap_err();
        assert!(matches!(err, LiveAccountingError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn expired_bandwidth_is_recreated_with_a_fresh_ttl() {
        let cache = MemoryLiveAccounting::new();
        let project_id = ProjectId::new_v4();
        let now = Utc::now();
        let key = keys::bandwidth_key(&project_id, now);

        cache
            .update_bandwidth_usage(project_id, 7, Duration::from_secs(60), now)
            .await
            .unwrap();
        cache
            .entries
            .lock()
            .unwrap()
            .get_mut(&key)
            .expect("entry")
            .expires_at = Some(Instant::now());

        cache
            .update_bandwidth_usage(project_id, 3, Duration::from_secs(600), now)
            .await
            .unwrap();
        assert_eq!(cache.get_bandwidth_usage(project_id, now).await.unwrap(), 3);
        let deadline = cache.expires_at(&key).expect("ttl attached");
        assert!(deadline > Instant::now() + Duration::from_secs(500));
    }

    #[tokio::test]
    async fn project_totals_sweep_expired_entries() {
        let cache = MemoryLiveAccounting::new();
        let project_id = ProjectId::new_v4();
        let now = Utc::now();
        let key = keys::bandwidth_key(&project_id, now);

        cache
            .insert_bandwidth_usage(project_id, 1, Duration::from_secs(60), now)
            .await
            .unwrap();
        cache.add_storage_usage(project_id, 5).await.unwrap();
        cache
            .entries
            .lock()
            .unwrap()
            .get_mut(&key)
            .expect("entry")
            .expires_at = Some(Instant::now());

        let totals = cache.get_all_project_totals().await.expect("totals");
        assert_eq!(totals[&project_id].storage, 5);
        assert!(!cache.entries.lock().unwrap().contains_key(&key));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let cache = MemoryLiveAccounting::new();
        cache.close().await.expect("close");

        let err = cache.get_storage_usage(ProjectId::new_v4()).await.unwrap_err();
        assert!(matches!(err, LiveAccountingError::SystemOrNet { .. }));
        assert!(cache.close().await.is_err());
    }
}
