use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tenant_accounting::live::{self, LiveAccounting, LiveAccountingConfig, LiveAccountingError};
use tenant_accounting::{AccountingConfig, LimitedResource, ProjectId, Usage};

async fn memory_cache() -> Arc<dyn LiveAccounting> {
    let config = LiveAccountingConfig::default();
    let outcome = live::open(&config).await.expect("open");
    Arc::from(outcome.into_result().expect("ping"))
}

#[tokio::test]
async fn open_from_toml_config_selects_memory_backend() {
    let config = AccountingConfig::from_toml_str(
        r#"
[live]
storage_backend = "memory://"
batch_size = 3
"#,
    )
    .expect("parse toml");
    let outcome = live::open(&config.live).await.expect("open");
    assert!(outcome.ping_error.is_none());

    let cache = outcome.cache;
    cache
        .add_storage_usage(ProjectId::new_v4(), 1)
        .await
        .expect("add");
}

#[tokio::test]
async fn concurrent_storage_increments_sum_regardless_of_order() {
    let cache = memory_cache().await;
    let project_id = ProjectId::new_v4();

    let mut handles = Vec::new();
    for delta in [100_i64, -40, 7, 33, -1, 1] {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            cache.add_storage_usage(project_id, delta).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("add");
    }

    assert_eq!(cache.get_storage_usage(project_id).await.unwrap(), 100);
}

#[tokio::test]
async fn reads_of_unknown_projects_are_key_not_found() {
    let cache = memory_cache().await;
    let project_id = ProjectId::new_v4();

    for result in [
        cache.get_storage_usage(project_id).await,
        cache.get_segment_usage(project_id).await,
        cache.get_bandwidth_usage(project_id, Utc::now()).await,
    ] {
        assert!(matches!(
            result,
            Err(LiveAccountingError::KeyNotFound { .. })
        ));
    }
}

#[tokio::test]
async fn admission_rolls_back_overage_and_keeps_earlier_usage() {
    let cache = memory_cache().await;
    let project_id = ProjectId::new_v4();

    cache
        .add_segment_usage_up_to_limit(project_id, 8, 10)
        .await
        .expect("within limit");

    let err = cache
        .add_segment_usage_up_to_limit(project_id, 3, 10)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LiveAccountingError::ProjectLimitExceeded {
            resource: LimitedResource::Segments,
            delta: 3,
            limit: 10,
        }
    ));
    assert_eq!(cache.get_segment_usage(project_id).await.unwrap(), 8);

    cache
        .add_segment_usage_up_to_limit(project_id, 2, 10)
        .await
        .expect("exactly at limit");
    assert_eq!(cache.get_segment_usage(project_id).await.unwrap(), 10);
}

#[tokio::test]
async fn concurrent_admission_never_leaves_usage_over_limit() {
    let cache = memory_cache().await;
    let project_id = ProjectId::new_v4();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            cache
                .add_storage_usage_up_to_limit(project_id, 10, 95)
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(()) => admitted += 1,
            Err(err) => assert!(err.is_limit_exceeded(), "{err}"),
        }
    }

    let usage = cache.get_storage_usage(project_id).await.unwrap();
    assert!(usage <= 95, "usage={usage}");
    assert_eq!(usage, admitted * 10);
}

#[tokio::test]
async fn insert_bandwidth_has_a_single_winner() {
    let cache = memory_cache().await;
    let project_id = ProjectId::new_v4();
    let now = Utc::now();

    let mut handles = Vec::new();
    for value in 1..=32_i64 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            let inserted = cache
                .insert_bandwidth_usage(project_id, value, Duration::from_secs(600), now)
                .await
                .expect("insert");
            (value, inserted)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (value, inserted) = handle.await.expect("join");
        if inserted {
            winners.push(value);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(
        cache.get_bandwidth_usage(project_id, now).await.unwrap(),
        winners[0]
    );

    cache
        .update_bandwidth_usage(project_id, 5, Duration::from_secs(600), now)
        .await
        .expect("update");
    assert_eq!(
        cache.get_bandwidth_usage(project_id, now).await.unwrap(),
        winners[0] + 5
    );
}

#[tokio::test]
async fn project_totals_fill_missing_counters_with_zero() {
    let cache = memory_cache().await;
    let now = Utc::now();
    let storage_only = ProjectId::new_v4();
    let segments_only = ProjectId::new_v4();
    let both = ProjectId::new_v4();
    let bandwidth_only = ProjectId::new_v4();

    cache.add_storage_usage(storage_only, 100).await.unwrap();
    cache.update_segment_usage(segments_only, 4).await.unwrap();
    cache.add_storage_usage(both, 50).await.unwrap();
    cache.update_segment_usage(both, 2).await.unwrap();
    cache
        .update_bandwidth_usage(bandwidth_only, 9, Duration::from_secs(600), now)
        .await
        .unwrap();

    let totals = cache.get_all_project_totals().await.expect("totals");
    assert_eq!(totals.len(), 3);
    assert_eq!(
        totals[&storage_only],
        Usage {
            storage: 100,
            segments: 0
        }
    );
    assert_eq!(
        totals[&segments_only],
        Usage {
            storage: 0,
            segments: 4
        }
    );
    assert_eq!(
        totals[&both],
        Usage {
            storage: 50,
            segments: 2
        }
    );
}

#[tokio::test]
async fn closed_cache_rejects_further_use() {
    let cache = memory_cache().await;
    cache.close().await.expect("close");

    let err = cache
        .add_storage_usage(ProjectId::new_v4(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, LiveAccountingError::SystemOrNet { .. }));
}

#[tokio::test]
async fn slow_callers_can_bound_operations_with_a_timeout() {
    let cache = memory_cache().await;
    let project_id = ProjectId::new_v4();

    tokio::time::timeout(
        Duration::from_secs(5),
        cache.add_storage_usage(project_id, 3),
    )
    .await
    .expect("completes in time")
    .expect("add");
    assert_eq!(cache.get_storage_usage(project_id).await.unwrap(), 3);
}
