// tests/persistence_tests.rs

mod common;

use common::{add_tested_key, file_backed_pool};
use keypool_proxy::{
    config::{EnvironmentConfig, PoolConfigPatch},
    error::AppError,
    monitoring::TokenUsageStore,
    storage::{JsonFileStore, KeyStatus, PoolGroup, PoolStore},
    KeyPoolManager,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn reopen(dir: &TempDir) -> keypool_proxy::Result<KeyPoolManager> {
    let store: Arc<dyn PoolStore> = Arc::new(JsonFileStore::new(dir.path().join("key_pool.json")));
    KeyPoolManager::load(store, Arc::new(TokenUsageStore::new()), &EnvironmentConfig::default()).await
}

#[tokio::test]
async fn test_missing_file_is_created_on_load() {
    let dir = TempDir::new().unwrap();
    let (_pool, store) = file_backed_pool(&dir).await;

    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
    assert_eq!(raw["keys"], serde_json::json!([]));
    assert_eq!(raw["stats"]["total"], 0);
    assert_eq!(raw["config"]["algorithm"], "round-robin");
    assert!(raw["poolGroups"].is_array());
}

#[tokio::test]
async fn test_state_round_trips_through_the_pool_file() {
    let dir = TempDir::new().unwrap();
    let (pool, _) = file_backed_pool(&dir).await;

    pool.create_pool_group(PoolGroup {
        id: "primary".into(),
        name: "Primary".into(),
        priority: 1,
        description: "paid keys".into(),
    })
    .await
    .unwrap();
    let a = add_tested_key(&pool, "fk-persist-a").await;
    let b = pool.add_key("fk-persist-b", "spare", Some("primary")).await.unwrap();
    pool.ban_key(&b.id, Some("chargeback")).await.unwrap();
    pool.update_config(&PoolConfigPatch {
        algorithm: Some("least-used".into()),
        ..Default::default()
    })
    .await
    .unwrap();
    pool.next_key().unwrap();
    pool.record_outcome(&a.id, true, None).await.unwrap();
    pool.flush().await.unwrap();

    let reloaded = reopen(&dir).await.unwrap();
    assert_eq!(reloaded.get_keys(1, 100, None).items, pool.get_keys(1, 100, None).items);
    assert_eq!(reloaded.pool_groups(), pool.pool_groups());
    assert_eq!(reloaded.config(), pool.config());

    let b = reloaded.get_key(&b.id).unwrap();
    assert_eq!(b.status, KeyStatus::Banned);
    assert_eq!(b.banned_reason.as_deref(), Some("chargeback"));
    assert_eq!(reloaded.get_key(&a.id).unwrap().usage_count, 1);
}

#[tokio::test]
async fn test_corrupt_file_recovers_from_backup() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = file_backed_pool(&dir).await;
    let first = pool.add_key("fk-backup-a", "", None).await.unwrap();
    pool.add_key("fk-backup-b", "", None).await.unwrap();
    assert!(store.backup_path().exists());
    assert!(!store.temp_path().exists());

    std::fs::write(store.path(), b"{ not json").unwrap();

    // В .bak лежит состояние до последней записи.
    let recovered = reopen(&dir).await.unwrap();
    assert_eq!(recovered.stats().total, 1);
    assert_eq!(recovered.get_key(&first.id).unwrap().key, "fk-backup-a");
}

#[tokio::test]
async fn test_corrupt_file_without_backup_fails_to_load() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("key_pool.json"), b"[1, 2").unwrap();

    match reopen(&dir).await {
        Err(AppError::Persistence { message, .. }) => assert!(message.contains("no usable backup")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("corrupt pool file must not load"),
    }
}

#[tokio::test]
async fn test_older_pool_files_load_with_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("key_pool.json"),
        r#"{
            "keys": [{
                "id": "key_legacy",
                "key": "fk-legacy",
                "status": "active",
                "created_at": "2024-01-01T00:00:00Z"
            }],
            "config": { "retry": { "maxRetries": 1 } }
        }"#,
    )
    .unwrap();

    let pool = reopen(&dir).await.unwrap();
    let key = pool.get_key("key_legacy").unwrap();
    assert_eq!(key.usage_count, 0);
    assert!(key.pool_group.is_none());
    let config = pool.config();
    assert_eq!(config.retry.max_retries, 1);
    assert_eq!(config.retry.retry_delay_ms, 1000);
    assert_eq!(config.auto_ban.error_threshold, 5);
}

#[tokio::test]
async fn test_flusher_writes_usage_and_flushes_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let (pool, _) = file_backed_pool(&dir).await;
    let pool = Arc::new(pool);
    let key = add_tested_key(&pool, "fk-flusher").await;

    let cancel = CancellationToken::new();
    let flusher = pool.spawn_flusher(Duration::from_secs(60), cancel.clone());

    pool.next_key().unwrap();
    pool.next_key().unwrap();
    assert!(pool.is_dirty());
    assert_eq!(reopen(&dir).await.unwrap().get_key(&key.id).unwrap().usage_count, 0);

    cancel.cancel();
    flusher.await.unwrap();
    assert!(!pool.is_dirty());
    assert_eq!(reopen(&dir).await.unwrap().get_key(&key.id).unwrap().usage_count, 2);
}
