// src/key_manager.rs

use crate::config::{
    pool::{AutoBanPolicy, RetryPolicy},
    Algorithm, ConfigValidator, EnvironmentConfig, PoolConfig, PoolConfigPatch,
};
use crate::core::{filter_by_tier, strategy_for, QuotaWarning, ScoreCache, SelectionContext, UsageDelta};
use crate::error::{AppError, ExhaustionReason, Result};
use crate::metrics;
use crate::monitoring::token_usage::{TokenSnapshot, TokenUsageProvider};
use crate::storage::{
    KeyRecord, KeyStatus, PersistedStats, PoolGroup, PoolGroupStats, PoolSnapshot, PoolStats,
    PoolStore, Provider, TestResult, UsageSample, DEFAULT_POOL_GROUP,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_BAN_REASON: &str = "Payment Required - No Credits";
const DEFAULT_NOTES_MAX_LENGTH: usize = 1000;
const DAILY_USAGE_RETENTION_DAYS: usize = 31;
const MAX_HISTORY_SAMPLES: usize = 10_000;

/// The key handed to a request handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedKey {
    pub id: String,
    pub key: String,
    pub algorithm: Algorithm,
    /// Tier the key came from when multi-tier selection is on.
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub success: usize,
    pub duplicate: usize,
    pub invalid: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPage {
    pub items: Vec<KeyRecord>,
    pub pagination: Pagination,
}

/// Everything the health probe needs to test one key.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub id: String,
    pub key: String,
    pub retry: RetryPolicy,
    pub auto_ban: AutoBanPolicy,
    pub timeout: Duration,
}

/// Classified result of a health probe.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    Passed,
    Banned { reason: String, detail: String },
    Disabled { detail: String },
}

/// In-memory pool state. Only ever touched under the manager's lock.
struct PoolInner {
    keys: Vec<KeyRecord>,
    groups: Vec<PoolGroup>,
    config: PoolConfig,
    rotation_index: usize,
    scores: ScoreCache,
    rng: StdRng,
    /// Key id to the day its quota warning was last logged.
    quota_warned: HashMap<String, String>,
}

impl PoolInner {
    fn from_snapshot(snapshot: PoolSnapshot) -> Self {
        Self {
            keys: snapshot.keys,
            groups: snapshot.pool_groups,
            config: snapshot.config,
            rotation_index: snapshot.stats.last_rotation_index,
            scores: ScoreCache::new(),
            rng: StdRng::from_entropy(),
            quota_warned: HashMap::new(),
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            keys: self.keys.clone(),
            stats: PersistedStats {
                counts: PoolStats::from_keys(&self.keys),
                last_rotation_index: self.rotation_index,
            },
            pool_groups: self.groups.clone(),
            config: self.config.clone(),
        }
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.keys
            .iter()
            .position(|k| k.id == id)
            .ok_or_else(|| AppError::not_found("Key", id))
    }

    fn key_mut(&mut self, id: &str) -> Result<&mut KeyRecord> {
        let index = self.position(id)?;
        Ok(&mut self.keys[index])
    }

    fn group_exists(&self, group: &str) -> bool {
        group == DEFAULT_POOL_GROUP || self.groups.iter().any(|g| g.id == group)
    }

    /// Validates and builds a record without inserting it.
    fn build_record(
        &self,
        credential: &str,
        notes: &str,
        pool_group: Option<&str>,
        notes_max_length: usize,
        now: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AppError::validation("key", "Key cannot be empty"));
        }
        let provider = Provider::detect(credential).ok_or_else(|| {
            AppError::validation(
                "key",
                "Invalid key format: expected a 'fk-', 'sk-ant-' or 'sk-' prefix",
            )
        })?;
        if self.keys.iter().any(|k| k.key == credential) {
            return Err(AppError::DuplicateKey("Key already exists".to_string()));
        }
        check_notes(notes, notes_max_length)?;
        let pool_group = match pool_group.map(str::trim).filter(|g| !g.is_empty()) {
            Some(group) if !self.group_exists(group) => {
                return Err(AppError::not_found("Pool group", group));
            }
            other => other.map(str::to_string),
        };

        let mut record = KeyRecord::new(
            format!("key_{}", Uuid::new_v4().simple()),
            credential.to_string(),
            provider,
            now,
        );
        record.notes = notes.to_string();
        record.pool_group = pool_group;
        Ok(record)
    }

    fn exhaustion_reason(&self) -> ExhaustionReason {
        if self.keys.is_empty() {
            return ExhaustionReason::EmptyPool;
        }
        let active: Vec<&KeyRecord> = self
            .keys
            .iter()
            .filter(|k| k.status == KeyStatus::Active)
            .collect();
        ExhaustionReason::NoneEligible {
            total: self.keys.len(),
            active: active.len(),
            untested: active
                .iter()
                .filter(|k| k.last_test_result == TestResult::Untested)
                .count(),
        }
    }

    /// Picks a key and commits its bookkeeping in one step.
    fn select(&mut self, tokens: &TokenSnapshot, now: DateTime<Utc>) -> Result<(SelectedKey, Vec<QuotaWarning>)> {
        let algorithm = self.config.algorithm;
        let (id, tier, delta) = {
            let eligible: Vec<&KeyRecord> = self.keys.iter().filter(|k| k.is_eligible()).collect();
            if eligible.is_empty() {
                return Err(AppError::PoolExhausted(self.exhaustion_reason()));
            }

            let (candidates, tier) = if self.config.multi_tier.enabled {
                let tier = filter_by_tier(&eligible, &self.groups, &self.config.multi_tier)?;
                (tier.keys, Some(tier.group))
            } else {
                (eligible, None)
            };

            let ctx = SelectionContext {
                now,
                rotation_index: self.rotation_index,
                config: &self.config,
                tokens,
                scores: &self.scores,
            };
            let selection = strategy_for(algorithm).select(&candidates, &ctx, &mut self.rng)?;
            (
                candidates[selection.index].id.clone(),
                tier,
                selection.delta,
            )
        };

        let warnings = self.commit_selection(&id, delta, now)?;
        let key = self.keys[self.position(&id)?].key.clone();
        Ok((
            SelectedKey {
                id,
                key,
                algorithm,
                tier,
            },
            warnings,
        ))
    }

    /// The single place where a selection changes pool state.
    fn commit_selection(
        &mut self,
        id: &str,
        delta: UsageDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<QuotaWarning>> {
        if let Some(index) = delta.rotation_index {
            self.rotation_index = index;
        }
        for (key_id, score) in delta.refreshed_scores {
            self.scores.insert(key_id, score, now);
        }
        self.scores.invalidate(id);

        let window_start = now - ChronoDuration::hours(i64::from(self.config.time_window_hours));
        let today = now.format("%Y-%m-%d").to_string();
        let key = self.key_mut(id)?;
        key.usage_count += 1;
        key.last_used_at = Some(now);
        *key.daily_usage.entry(today.clone()).or_insert(0) += 1;
        while key.daily_usage.len() > DAILY_USAGE_RETENTION_DAYS {
            let Some(oldest) = key.daily_usage.keys().next().cloned() else {
                break;
            };
            key.daily_usage.remove(&oldest);
        }
        key.usage_history.push(UsageSample {
            timestamp: now,
            tokens_used: 0,
        });
        key.usage_history.retain(|s| s.timestamp >= window_start);
        if key.usage_history.len() > MAX_HISTORY_SAMPLES {
            let excess = key.usage_history.len() - MAX_HISTORY_SAMPLES;
            key.usage_history.drain(..excess);
        }

        let mut fresh_warnings = Vec::new();
        for warning in delta.quota_warnings {
            if self.quota_warned.get(&warning.key_id) != Some(&today) {
                self.quota_warned.insert(warning.key_id.clone(), today.clone());
                fresh_warnings.push(warning);
            }
        }
        Ok(fresh_warnings)
    }

    fn sorted_groups(&self) -> Vec<PoolGroup> {
        let mut groups = self.groups.clone();
        groups.sort_by_key(|g| g.priority);
        groups
    }
}

fn check_notes(notes: &str, max: usize) -> Result<()> {
    let length = notes.chars().count();
    if length > max {
        return Err(AppError::validation(
            "notes",
            format!("Notes must be at most {max} characters, got {length}"),
        ));
    }
    Ok(())
}

/// Owner of the key pool: selection, lifecycle transitions and persistence.
///
/// Selection and its bookkeeping run synchronously under one lock, so two
/// concurrent requests never race on the same counters. Writes go through
/// `persist_now` (critical changes, awaited) or the debounced flusher (usage
/// bumps).
pub struct KeyPoolManager {
    inner: Mutex<PoolInner>,
    store: Arc<dyn PoolStore>,
    tokens: Arc<dyn TokenUsageProvider>,
    write_lock: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
    dirty_signal: Notify,
    notes_max_length: usize,
}

impl KeyPoolManager {
    /// Loads the pool from `store`, layering `env` over the persisted config.
    /// A store without data starts an empty pool and persists it right away.
    #[instrument(skip_all, name = "key_pool_init", fields(storage = %store.location()))]
    pub async fn load(
        store: Arc<dyn PoolStore>,
        tokens: Arc<dyn TokenUsageProvider>,
        env: &EnvironmentConfig,
    ) -> Result<Self> {
        let (snapshot, fresh) = match store.load().await? {
            Some(snapshot) => (snapshot, false),
            None => {
                info!("No stored key pool found, starting with an empty pool");
                (PoolSnapshot::default(), true)
            }
        };

        let mut inner = PoolInner::from_snapshot(snapshot);
        if env.has_overrides() {
            env.apply(&mut inner.config);
            info!("Applied KEY_POOL_* environment overrides");
        }
        ConfigValidator::validate_pool(&inner.config)?;

        let stats = PoolStats::from_keys(&inner.keys);
        info!(
            keys.total = stats.total,
            keys.active = stats.active,
            keys.disabled = stats.disabled,
            keys.banned = stats.banned,
            pool_groups = inner.groups.len(),
            algorithm = %inner.config.algorithm,
            "Key pool loaded"
        );

        let manager = Self {
            inner: Mutex::new(inner),
            store,
            tokens,
            write_lock: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            dirty_signal: Notify::new(),
            notes_max_length: DEFAULT_NOTES_MAX_LENGTH,
        };
        if fresh {
            manager.persist_now().await?;
        }
        metrics::record_pool_stats(&stats);
        Ok(manager)
    }

    pub fn with_notes_max_length(mut self, max: usize) -> Self {
        self.notes_max_length = max;
        self
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut PoolInner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    fn read<T>(&self, f: impl FnOnce(&PoolInner) -> T) -> T {
        let guard = self.inner.lock();
        f(&guard)
    }

    // --- Persistence ---

    /// Writes the current state through to the store and waits for it.
    async fn persist_now(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.dirty.store(false, Ordering::SeqCst);
        let snapshot = self.read(PoolInner::snapshot);
        metrics::record_pool_stats(&snapshot.stats.counts);
        if let Err(e) = self.store.save(&snapshot).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Schedules a debounced write.
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.dirty_signal.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Writes pending debounced changes, if any.
    pub async fn flush(&self) -> Result<()> {
        if self.is_dirty() {
            self.persist_now().await?;
        }
        Ok(())
    }

    /// Background task coalescing hot-path mutations into one write per
    /// `debounce` window. Flushes once more when `cancel` fires.
    pub fn spawn_flusher(self: &Arc<Self>, debounce: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.dirty_signal.notified() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(debounce) => {}
                }
                if let Err(e) = manager.flush().await {
                    error!(error = %e, "Debounced key pool write failed; will retry on next change");
                }
            }
            if let Err(e) = manager.flush().await {
                error!(error = %e, "Final key pool flush failed");
            } else {
                debug!("Key pool flusher stopped");
            }
        })
    }

    // --- CRUD ---

    #[instrument(skip(self, credential, notes), fields(pool_group = ?pool_group))]
    pub async fn add_key(
        &self,
        credential: &str,
        notes: &str,
        pool_group: Option<&str>,
    ) -> Result<KeyRecord> {
        let limit = self.notes_max_length;
        let record = self.with_inner(|inner| {
            let record = inner.build_record(credential, notes, pool_group, limit, Utc::now())?;
            inner.keys.push(record.clone());
            Ok(record)
        })?;
        info!(key.id = %record.id, key.preview = %record.preview(), provider = ?record.provider, "Key added");
        self.persist_now().await?;
        Ok(record)
    }

    /// Adds every valid, new credential. One bad line never aborts the batch.
    pub async fn import_keys(&self, credentials: &[String]) -> Result<ImportSummary> {
        let limit = self.notes_max_length;
        let summary = self.with_inner(|inner| {
            let now = Utc::now();
            let notes = format!("Imported at {}", now.to_rfc3339());
            let mut summary = ImportSummary::default();
            for (i, raw) in credentials.iter().enumerate() {
                if raw.trim().is_empty() {
                    summary.invalid += 1;
                    continue;
                }
                match inner.build_record(raw, &notes, None, limit, now) {
                    Ok(record) => {
                        inner.keys.push(record);
                        summary.success += 1;
                    }
                    Err(AppError::DuplicateKey(_)) => summary.duplicate += 1,
                    Err(_) => {
                        summary.invalid += 1;
                        summary.errors.push(format!("Line {}: Invalid key format", i + 1));
                    }
                }
            }
            Ok(summary)
        })?;

        info!(
            imported = summary.success,
            duplicates = summary.duplicate,
            invalid = summary.invalid,
            "Key import finished"
        );
        if summary.success > 0 {
            self.persist_now().await?;
        }
        Ok(summary)
    }

    pub async fn delete_key(&self, id: &str) -> Result<KeyRecord> {
        let removed = self.with_inner(|inner| {
            let index = inner.position(id)?;
            inner.scores.invalidate(id);
            inner.quota_warned.remove(id);
            Ok(inner.keys.remove(index))
        })?;
        info!(key.id = %id, key.preview = %removed.preview(), "Key deleted");
        self.persist_now().await?;
        Ok(removed)
    }

    /// Sets `status`. Leaving `banned` clears the ban metadata; re-activating
    /// resets the consecutive error streak.
    pub async fn toggle_status(&self, id: &str, status: KeyStatus) -> Result<KeyRecord> {
        let record = self.with_inner(|inner| {
            let key = inner.key_mut(id)?;
            let previous = key.status;
            key.set_status(status);
            if status == KeyStatus::Active && previous != KeyStatus::Active {
                key.consecutive_errors = 0;
            }
            Ok(key.clone())
        })?;
        info!(key.id = %id, status = %status, "Key status changed");
        self.persist_now().await?;
        Ok(record)
    }

    pub async fn update_notes(&self, id: &str, notes: &str) -> Result<KeyRecord> {
        check_notes(notes, self.notes_max_length)?;
        let record = self.with_inner(|inner| {
            let key = inner.key_mut(id)?;
            key.notes = notes.to_string();
            Ok(key.clone())
        })?;
        self.persist_now().await?;
        Ok(record)
    }

    /// Moves a key to `group`; `None` puts it back into the default tier.
    pub async fn assign_pool_group(&self, id: &str, group: Option<&str>) -> Result<KeyRecord> {
        let record = self.with_inner(|inner| {
            let group = group.map(str::trim).filter(|g| !g.is_empty());
            if let Some(g) = group {
                if !inner.group_exists(g) {
                    return Err(AppError::not_found("Pool group", g));
                }
            }
            let key = inner.key_mut(id)?;
            key.pool_group = group.map(str::to_string);
            Ok(key.clone())
        })?;
        self.persist_now().await?;
        Ok(record)
    }

    pub fn get_key(&self, id: &str) -> Result<KeyRecord> {
        self.read(|inner| inner.position(id).map(|i| inner.keys[i].clone()))
    }

    /// One page of keys (1-based), optionally filtered by status.
    pub fn get_keys(&self, page: usize, limit: usize, status: Option<KeyStatus>) -> KeyPage {
        let page = page.max(1);
        let limit = limit.clamp(1, 1000);
        self.read(|inner| {
            let filtered: Vec<&KeyRecord> = inner
                .keys
                .iter()
                .filter(|k| status.map_or(true, |s| k.status == s))
                .collect();
            let total = filtered.len();
            let items = filtered
                .into_iter()
                .skip((page - 1) * limit)
                .take(limit)
                .cloned()
                .collect();
            KeyPage {
                items,
                pagination: Pagination {
                    page,
                    limit,
                    total,
                    total_pages: total.div_ceil(limit),
                },
            }
        })
    }

    pub async fn delete_by_status(&self, status: KeyStatus) -> Result<usize> {
        let removed = self.with_inner(|inner| {
            let before = inner.keys.len();
            let doomed: HashSet<String> = inner
                .keys
                .iter()
                .filter(|k| k.status == status)
                .map(|k| k.id.clone())
                .collect();
            inner.keys.retain(|k| k.status != status);
            for id in &doomed {
                inner.scores.invalidate(id);
                inner.quota_warned.remove(id);
            }
            Ok(before - inner.keys.len())
        })?;
        info!(status = %status, removed, "Bulk delete by status");
        if removed > 0 {
            self.persist_now().await?;
        }
        Ok(removed)
    }

    /// Raw credentials, one per key, for operator backups.
    pub fn export_keys(&self, status: Option<KeyStatus>) -> Vec<String> {
        self.read(|inner| {
            inner
                .keys
                .iter()
                .filter(|k| status.map_or(true, |s| k.status == s))
                .map(|k| k.key.clone())
                .collect()
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.read(|inner| PoolStats::from_keys(&inner.keys))
    }

    // --- Hot path ---

    /// Selects the next key with the configured algorithm and bumps its usage.
    pub fn next_key(&self) -> Result<SelectedKey> {
        let tokens = self.tokens.snapshot();
        let (selected, warnings) = self.with_inner(|inner| inner.select(&tokens, Utc::now()))?;
        self.mark_dirty();

        for warning in &warnings {
            warn!(
                key.id = %warning.key_id,
                consumed = warning.consumed,
                "Key is approaching its quota limit"
            );
        }
        metrics::record_selection(selected.algorithm);
        debug!(
            event = "key_selected",
            key.id = %selected.id,
            key.preview = %crate::storage::preview_key(&selected.key),
            algorithm = %selected.algorithm,
            tier = ?selected.tier,
            "API key selected for request"
        );
        Ok(selected)
    }

    /// Records how a request made with key `id` ended.
    ///
    /// Crossing the auto-ban error threshold disables the key and is written
    /// through immediately; everything else is debounced.
    pub async fn record_outcome(&self, id: &str, success: bool, detail: Option<String>) -> Result<()> {
        let disabled = self.with_inner(|inner| {
            let policy = inner.config.auto_ban.clone();
            inner.scores.invalidate(id);
            let key = inner.key_mut(id)?;
            key.record_outcome(success, detail);
            if !success
                && policy.enabled
                && key.status == KeyStatus::Active
                && key.consecutive_errors >= policy.error_threshold
            {
                key.status = KeyStatus::Disabled;
                key.last_error = Some(format!(
                    "Disabled after {} consecutive errors",
                    key.consecutive_errors
                ));
                return Ok(Some(key.consecutive_errors));
            }
            Ok(None)
        })?;

        match disabled {
            Some(streak) => {
                warn!(key.id = %id, consecutive_errors = streak, "Key disabled by error threshold");
                metrics::record_disable("error_threshold");
                self.persist_now().await
            }
            None => {
                self.mark_dirty();
                Ok(())
            }
        }
    }

    /// Adds `tokens` to the newest time-window sample of key `id`.
    pub fn record_token_usage(&self, id: &str, tokens: u64) -> Result<()> {
        self.with_inner(|inner| {
            let key = inner.key_mut(id)?;
            match key.usage_history.last_mut() {
                Some(sample) => sample.tokens_used += tokens,
                None => key.usage_history.push(UsageSample {
                    timestamp: Utc::now(),
                    tokens_used: tokens,
                }),
            }
            Ok(())
        })?;
        self.mark_dirty();
        Ok(())
    }

    // --- Critical transitions ---

    /// Bans key `id`. Written through before returning.
    pub async fn ban_key(&self, id: &str, reason: Option<&str>) -> Result<KeyRecord> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_BAN_REASON);
        let record = self.with_inner(|inner| {
            inner.scores.invalidate(id);
            let key = inner.key_mut(id)?;
            key.ban(reason, Utc::now());
            Ok(key.clone())
        })?;
        warn!(key.id = %id, key.preview = %record.preview(), reason, "Key banned");
        metrics::record_ban();
        self.persist_now().await?;
        Ok(record)
    }

    /// Disables key `id` with `reason` recorded as its last error.
    pub async fn disable_key(&self, id: &str, reason: &str) -> Result<KeyRecord> {
        let record = self.with_inner(|inner| {
            let key = inner.key_mut(id)?;
            key.status = KeyStatus::Disabled;
            key.last_error = Some(reason.to_string());
            Ok(key.clone())
        })?;
        warn!(key.id = %id, key.preview = %record.preview(), reason, "Key disabled");
        metrics::record_disable("upstream_rejection");
        self.persist_now().await?;
        Ok(record)
    }

    // --- Health probe support ---

    pub fn probe_target(&self, id: &str) -> Result<ProbeTarget> {
        self.read(|inner| {
            let key = &inner.keys[inner.position(id)?];
            Ok(ProbeTarget {
                id: key.id.clone(),
                key: key.key.clone(),
                retry: inner.config.retry.clone(),
                auto_ban: inner.config.auto_ban.clone(),
                timeout: inner.config.performance.request_timeout(),
            })
        })
    }

    /// Ids of every key a bulk test should cover (everything not banned).
    pub fn testable_key_ids(&self) -> Vec<String> {
        self.read(|inner| {
            inner
                .keys
                .iter()
                .filter(|k| k.status != KeyStatus::Banned)
                .map(|k| k.id.clone())
                .collect()
        })
    }

    /// Applies a probe verdict. Written through before returning.
    pub async fn apply_test_outcome(&self, id: &str, outcome: TestOutcome) -> Result<KeyRecord> {
        let now = Utc::now();
        let record = self.with_inner(|inner| {
            inner.scores.invalidate(id);
            let key = inner.key_mut(id)?;
            key.last_test_at = Some(now);
            match &outcome {
                TestOutcome::Passed => {
                    key.last_test_result = TestResult::Success;
                    key.last_error = None;
                    key.consecutive_errors = 0;
                }
                TestOutcome::Banned { reason, detail } => {
                    key.last_test_result = TestResult::Failed;
                    key.error_count = key.error_count.saturating_add(1);
                    key.last_error = Some(detail.clone());
                    key.ban(reason.clone(), now);
                }
                TestOutcome::Disabled { detail } => {
                    key.last_test_result = TestResult::Failed;
                    key.error_count = key.error_count.saturating_add(1);
                    key.last_error = Some(detail.clone());
                    key.status = KeyStatus::Disabled;
                }
            }
            Ok(key.clone())
        })?;
        self.persist_now().await?;
        Ok(record)
    }

    // --- Config ---

    pub fn config(&self) -> PoolConfig {
        self.read(|inner| inner.config.clone())
    }

    /// Merges `patch` into the live config. Nothing changes unless the merged
    /// result validates.
    pub async fn update_config(&self, patch: &PoolConfigPatch) -> Result<PoolConfig> {
        let config = self.with_inner(|inner| {
            let next = inner.config.merged(patch)?;
            ConfigValidator::validate_pool(&next)?;
            if next.algorithm != inner.config.algorithm {
                info!(from = %inner.config.algorithm, to = %next.algorithm, "Selection algorithm changed");
            }
            inner.config = next.clone();
            inner.scores.clear();
            Ok(next)
        })?;
        self.persist_now().await?;
        Ok(config)
    }

    pub async fn reset_config(&self) -> Result<PoolConfig> {
        self.with_inner(|inner| {
            inner.config = PoolConfig::default();
            inner.scores.clear();
            Ok(())
        })?;
        info!("Pool config reset to defaults");
        self.persist_now().await?;
        Ok(PoolConfig::default())
    }

    // --- Pool groups ---

    pub fn pool_groups(&self) -> Vec<PoolGroup> {
        self.read(PoolInner::sorted_groups)
    }

    pub async fn create_pool_group(&self, group: PoolGroup) -> Result<PoolGroup> {
        group.validate()?;
        if group.id == DEFAULT_POOL_GROUP {
            return Err(AppError::validation(
                "id",
                "'default' is reserved for keys without a group",
            ));
        }
        let created = self.with_inner(|inner| {
            if inner.groups.iter().any(|g| g.id == group.id) {
                return Err(AppError::DuplicateKey(format!(
                    "Pool group '{}' already exists",
                    group.id
                )));
            }
            inner.groups.push(group.clone());
            Ok(group)
        })?;
        info!(pool_group = %created.id, priority = created.priority, "Pool group created");
        self.persist_now().await?;
        Ok(created)
    }

    /// Removes group `id`; its keys move to the default tier. Returns how many moved.
    pub async fn delete_pool_group(&self, id: &str) -> Result<usize> {
        let moved = self.with_inner(|inner| {
            let index = inner
                .groups
                .iter()
                .position(|g| g.id == id)
                .ok_or_else(|| AppError::not_found("Pool group", id))?;
            inner.groups.remove(index);
            let mut moved = 0;
            for key in inner.keys.iter_mut().filter(|k| k.pool_group.as_deref() == Some(id)) {
                key.pool_group = Some(DEFAULT_POOL_GROUP.to_string());
                moved += 1;
            }
            Ok(moved)
        })?;
        info!(pool_group = %id, moved_keys = moved, "Pool group deleted");
        self.persist_now().await?;
        Ok(moved)
    }

    /// Status counts per group, by priority, with the implicit default tier last.
    pub fn pool_group_stats(&self) -> Vec<PoolGroupStats> {
        self.read(|inner| {
            let groups = inner.sorted_groups();
            let known: HashSet<&str> = groups.iter().map(|g| g.id.as_str()).collect();

            let mut out: Vec<PoolGroupStats> = groups
                .iter()
                .map(|g| {
                    let s = PoolStats::from_keys(inner.keys.iter().filter(|k| k.group_id() == g.id));
                    PoolGroupStats {
                        id: g.id.clone(),
                        name: g.name.clone(),
                        priority: g.priority,
                        total: s.total,
                        active: s.active,
                        disabled: s.disabled,
                        banned: s.banned,
                    }
                })
                .collect();

            let s = PoolStats::from_keys(inner.keys.iter().filter(|k| !known.contains(k.group_id())));
            let lowest = groups.iter().map(|g| g.priority).max().unwrap_or(0);
            out.push(PoolGroupStats {
                id: DEFAULT_POOL_GROUP.to_string(),
                name: "Default".to_string(),
                priority: lowest.saturating_add(1),
                total: s.total,
                active: s.active,
                disabled: s.disabled,
                banned: s.banned,
            });
            out
        })
    }
}
