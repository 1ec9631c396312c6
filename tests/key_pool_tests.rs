// tests/key_pool_tests.rs

mod common;

use chrono::Utc;
use common::{add_tested_key, add_tested_key_in, memory_pool};
use keypool_proxy::{
    config::{
        pool::{MultiTierPatch, QuotaPatch},
        EnvironmentConfig, PoolConfigPatch,
    },
    error::{AppError, ExhaustionReason},
    monitoring::{TokenUsage, TokenUsageStore},
    storage::{InMemoryStore, KeyRecord, KeyStatus, PoolGroup, PoolSnapshot, Provider, TestResult},
    KeyPoolManager,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn algorithm(name: &str) -> PoolConfigPatch {
    PoolConfigPatch {
        algorithm: Some(name.to_string()),
        ..Default::default()
    }
}

fn group(id: &str, priority: u32) -> PoolGroup {
    PoolGroup {
        id: id.to_string(),
        name: id.to_uppercase(),
        priority,
        description: String::new(),
    }
}

fn tested_record(id: &str, credential: &str) -> KeyRecord {
    let mut record = KeyRecord::new(id.to_string(), credential.to_string(), Provider::Factory, Utc::now());
    record.last_test_result = TestResult::Success;
    record
}

async fn pool_from_snapshot(snapshot: PoolSnapshot, tokens: Arc<TokenUsageStore>) -> KeyPoolManager {
    KeyPoolManager::load(
        Arc::new(InMemoryStore::with_snapshot(snapshot)),
        tokens,
        &EnvironmentConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_selection_only_returns_eligible_keys() {
    let (pool, _) = memory_pool().await;
    let good = add_tested_key(&pool, "fk-eligible").await;
    let disabled = add_tested_key(&pool, "fk-disabled").await;
    pool.toggle_status(&disabled.id, KeyStatus::Disabled).await.unwrap();
    pool.add_key("fk-never-tested", "", None).await.unwrap();

    for name in ["round-robin", "random", "least-used", "weighted-score", "time-window"] {
        pool.update_config(&algorithm(name)).await.unwrap();
        for _ in 0..5 {
            assert_eq!(pool.next_key().unwrap().id, good.id, "algorithm {name}");
        }
    }
}

#[tokio::test]
async fn test_least_used_balances_usage() {
    let (pool, _) = memory_pool().await;
    pool.update_config(&algorithm("least-used")).await.unwrap();
    let a = add_tested_key(&pool, "fk-least-a").await;
    let b = add_tested_key(&pool, "fk-least-b").await;

    for _ in 0..6 {
        pool.next_key().unwrap();
    }
    assert_eq!(pool.get_key(&a.id).unwrap().usage_count, 3);
    assert_eq!(pool.get_key(&b.id).unwrap().usage_count, 3);
}

#[tokio::test]
async fn test_single_key_weighted_score() {
    let (pool, _) = memory_pool().await;
    pool.update_config(&algorithm("weighted-score")).await.unwrap();
    let only = add_tested_key(&pool, "fk-weighted-only").await;

    let selected = pool.next_key().unwrap();
    assert_eq!(selected.id, only.id);
    assert_eq!(selected.algorithm.as_str(), "weighted-score");
}

#[tokio::test]
async fn test_quota_aware_skips_capped_keys() {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let mut capped = tested_record("key_capped", "fk-capped");
    capped.daily_usage.insert(today, 10);
    let fresh = tested_record("key_fresh", "fk-fresh");

    let mut snapshot = PoolSnapshot {
        keys: vec![capped, fresh],
        ..Default::default()
    };
    snapshot.config.algorithm = "quota-aware".parse().unwrap();
    snapshot.config.quota.per_key_daily_limit = 10;
    let pool = pool_from_snapshot(snapshot, Arc::new(TokenUsageStore::new())).await;

    for _ in 0..3 {
        assert_eq!(pool.next_key().unwrap().id, "key_fresh");
    }

    let patch = PoolConfigPatch {
        quota: Some(QuotaPatch {
            per_key_daily_limit: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };
    pool.update_config(&patch).await.unwrap();
    let err = pool.next_key().unwrap_err();
    assert!(matches!(
        err,
        AppError::PoolExhausted(ExhaustionReason::QuotaExceeded { candidates: 2 })
    ));
}

#[tokio::test]
async fn test_least_token_used_follows_snapshot() {
    let tokens = Arc::new(TokenUsageStore::new());
    let snapshot = PoolSnapshot {
        keys: vec![
            tested_record("key_heavy", "fk-heavy"),
            tested_record("key_light", "fk-light"),
        ],
        ..Default::default()
    };
    let pool = pool_from_snapshot(snapshot, tokens.clone()).await;
    pool.update_config(&algorithm("least-token-used")).await.unwrap();

    // Без данных о токенах берётся первый кандидат.
    assert_eq!(pool.next_key().unwrap().id, "key_heavy");

    tokens.replace(HashMap::from([
        (
            "key_heavy".to_string(),
            TokenUsage {
                used: 900,
                remaining: 100,
                allowance: 1000,
            },
        ),
        (
            "key_light".to_string(),
            TokenUsage {
                used: 10,
                remaining: 990,
                allowance: 1000,
            },
        ),
    ]));
    assert_eq!(pool.next_key().unwrap().id, "key_light");
}

#[tokio::test]
async fn test_tiers_fall_back_by_priority() {
    let (pool, _) = memory_pool().await;
    pool.create_pool_group(group("primary", 1)).await.unwrap();
    pool.create_pool_group(group("backup", 2)).await.unwrap();
    let primary = add_tested_key_in(&pool, "fk-tier-primary", "primary").await;
    let backup = add_tested_key_in(&pool, "fk-tier-backup", "backup").await;
    add_tested_key(&pool, "fk-tier-default").await;

    let patch = PoolConfigPatch {
        multi_tier: Some(MultiTierPatch {
            enabled: Some(true),
            auto_fallback: Some(true),
        }),
        ..Default::default()
    };
    pool.update_config(&patch).await.unwrap();

    let selected = pool.next_key().unwrap();
    assert_eq!(selected.id, primary.id);
    assert_eq!(selected.tier.as_deref(), Some("primary"));

    pool.ban_key(&primary.id, None).await.unwrap();
    let selected = pool.next_key().unwrap();
    assert_eq!(selected.id, backup.id);
    assert_eq!(selected.tier.as_deref(), Some("backup"));

    pool.toggle_status(&backup.id, KeyStatus::Disabled).await.unwrap();
    assert_eq!(pool.next_key().unwrap().tier.as_deref(), Some("default"));
}

#[tokio::test]
async fn test_tiers_without_fallback_stop_at_first_group() {
    let (pool, _) = memory_pool().await;
    pool.create_pool_group(group("primary", 1)).await.unwrap();
    add_tested_key(&pool, "fk-only-default").await;

    let patch = PoolConfigPatch {
        multi_tier: Some(MultiTierPatch {
            enabled: Some(true),
            auto_fallback: Some(false),
        }),
        ..Default::default()
    };
    pool.update_config(&patch).await.unwrap();

    match pool.next_key() {
        Err(AppError::PoolExhausted(ExhaustionReason::TierEmpty { group })) => assert_eq!(group, "primary"),
        other => panic!("expected an empty tier, got {other:?}"),
    }
}

#[tokio::test]
async fn test_toggle_status_is_idempotent() {
    let (pool, store) = memory_pool().await;
    let key = add_tested_key(&pool, "fk-toggle").await;

    let first = pool.toggle_status(&key.id, KeyStatus::Disabled).await.unwrap();
    let second = pool.toggle_status(&key.id, KeyStatus::Disabled).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        store.stored().unwrap().keys[0].status,
        KeyStatus::Disabled
    );
}

#[tokio::test]
async fn test_rotation_cursor_survives_reload() {
    let (pool, store) = memory_pool().await;
    add_tested_key(&pool, "fk-cursor-a").await;
    let b = add_tested_key(&pool, "fk-cursor-b").await;

    pool.next_key().unwrap();
    pool.flush().await.unwrap();

    let reloaded = pool_from_snapshot(store.stored().unwrap(), Arc::new(TokenUsageStore::new())).await;
    assert_eq!(reloaded.next_key().unwrap().id, b.id);
}

#[tokio::test]
async fn test_env_overrides_win_over_persisted_config() {
    let mut snapshot = PoolSnapshot::default();
    snapshot.config.retry.max_retries = 2;
    let env = EnvironmentConfig::from_lookup(|name| match name {
        "KEY_POOL_ALGORITHM" => Some("random".to_string()),
        "KEY_POOL_RETRY_MAX" => Some("7".to_string()),
        "KEY_POOL_BAN_401" => Some("true".to_string()),
        _ => None,
    });

    let pool = KeyPoolManager::load(
        Arc::new(InMemoryStore::with_snapshot(snapshot)),
        Arc::new(TokenUsageStore::new()),
        &env,
    )
    .await
    .unwrap();
    let config = pool.config();
    assert_eq!(config.algorithm.as_str(), "random");
    assert_eq!(config.retry.max_retries, 7);
    assert!(config.auto_ban.ban_401);
}

#[tokio::test]
async fn test_env_overrides_are_validated() {
    let env = EnvironmentConfig::from_lookup(|name| (name == "KEY_POOL_RETRY_MAX").then(|| "50".to_string()));
    let result = KeyPoolManager::load(
        Arc::new(InMemoryStore::new()),
        Arc::new(TokenUsageStore::new()),
        &env,
    )
    .await;
    assert!(matches!(result, Err(AppError::Validation { .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_outcome_counters_stay_consistent(outcomes in prop::collection::vec(any::<bool>(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let record = runtime.block_on(async {
            let (pool, _) = memory_pool().await;
            let key = add_tested_key(&pool, "fk-prop-counter").await;
            for success in &outcomes {
                pool.record_outcome(&key.id, *success, Some("upstream 500".to_string())).await.unwrap();
            }
            pool.get_key(&key.id).unwrap()
        });

        prop_assert_eq!(record.total_requests, outcomes.len() as u64);
        prop_assert!(record.success_requests <= record.total_requests);
        prop_assert!((0.0..=1.0).contains(&record.success_rate));
        let trailing_failures = outcomes.iter().rev().take_while(|s| !**s).count() as u32;
        prop_assert_eq!(record.consecutive_errors, trailing_failures);
    }

    #[test]
    fn prop_round_robin_is_fair(key_count in 1usize..6, rounds in 1usize..5) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let usage = runtime.block_on(async {
            let (pool, _) = memory_pool().await;
            let mut ids = Vec::new();
            for i in 0..key_count {
                ids.push(add_tested_key(&pool, &format!("fk-fair-{i}")).await.id);
            }
            for _ in 0..key_count * rounds {
                pool.next_key().unwrap();
            }
            ids.iter().map(|id| pool.get_key(id).unwrap().usage_count).collect::<Vec<_>>()
        });

        prop_assert!(usage.iter().all(|&u| u == rounds as u64));
    }
}
