// src/core/key_rotation.rs

use crate::config::{Algorithm, PoolConfig};
use crate::core::scoring::{composite_score, ScoreCache};
use crate::error::{AppError, ExhaustionReason, Result};
use crate::monitoring::token_usage::{TokenSnapshot, TokenUsage};
use crate::storage::KeyRecord;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{Rng, RngCore};
use std::cmp::Ordering;
use tracing::debug;

/// Read-only view of everything a strategy may consult.
pub struct SelectionContext<'a> {
    pub now: DateTime<Utc>,
    pub rotation_index: usize,
    pub config: &'a PoolConfig,
    pub tokens: &'a TokenSnapshot,
    pub scores: &'a ScoreCache,
}

impl SelectionContext<'_> {
    pub fn today(&self) -> String {
        self.now.format("%Y-%m-%d").to_string()
    }
}

/// A key crossed the configured quota warning fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWarning {
    pub key_id: String,
    pub consumed: f64,
}

/// Bookkeeping a strategy asks the manager to commit alongside the pick.
/// The per-request usage bump itself is not part of it; the manager applies
/// that once for every selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageDelta {
    pub rotation_index: Option<usize>,
    pub refreshed_scores: Vec<(String, f64)>,
    pub quota_warnings: Vec<QuotaWarning>,
}

/// Index into the candidate slice plus the delta to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub delta: UsageDelta,
}

impl Selection {
    fn at(index: usize) -> Self {
        Self {
            index,
            delta: UsageDelta::default(),
        }
    }
}

/// Strategy for selecting the next key.
///
/// Implementations are pure: they read the candidates and the context and
/// never touch the records. Runs synchronously under the pool lock.
pub trait KeyRotationStrategy: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Selection>;
}

fn ensure_candidates(candidates: &[&KeyRecord]) -> Result<()> {
    if candidates.is_empty() {
        return Err(AppError::PoolExhausted(ExhaustionReason::NoCandidates));
    }
    Ok(())
}

/// Round-robin key selection strategy
pub struct RoundRobinStrategy;

impl KeyRotationStrategy for RoundRobinStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::RoundRobin
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        let len = candidates.len();
        let index = ctx.rotation_index % len;
        Ok(Selection {
            index,
            delta: UsageDelta {
                rotation_index: Some((index + 1) % len),
                ..Default::default()
            },
        })
    }
}

pub struct RandomStrategy;

impl KeyRotationStrategy for RandomStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Random
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        _ctx: &SelectionContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        let draw: f64 = rng.gen();
        let index = ((draw * candidates.len() as f64).floor() as usize).min(candidates.len() - 1);
        Ok(Selection::at(index))
    }
}

pub struct LeastUsedStrategy;

impl KeyRotationStrategy for LeastUsedStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeastUsed
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        _ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        let mut best = 0;
        for (i, key) in candidates.iter().enumerate().skip(1) {
            if key.usage_count < candidates[best].usage_count {
                best = i;
            }
        }
        Ok(Selection::at(best))
    }
}

pub struct WeightedScoreStrategy;

impl KeyRotationStrategy for WeightedScoreStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::WeightedScore
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        if candidates.len() == 1 {
            return Ok(Selection::at(0));
        }

        let ttl = ctx.config.score_cache_ttl();
        let mut refreshed = Vec::new();
        let weights: Vec<f64> = candidates
            .iter()
            .map(|key| {
                let score = ctx.scores.get(&key.id, ctx.now, ttl).unwrap_or_else(|| {
                    let fresh = composite_score(key, ctx.now);
                    refreshed.push((key.id.clone(), fresh));
                    fresh
                });
                score.max(1.0)
            })
            .collect();

        let draw: f64 = rng.gen();
        let index = pick_weighted(&weights, draw);
        debug!(
            algorithm = "weighted-score",
            draw,
            selected_weight = weights[index],
            total_candidates = candidates.len(),
            "Weighted draw"
        );
        Ok(Selection {
            index,
            delta: UsageDelta {
                refreshed_scores: refreshed,
                ..Default::default()
            },
        })
    }
}

/// Cumulative-probability pick: the first index whose running share of the
/// total weight exceeds `draw`. Floating-point sums that stop short of 1.0
/// fall through to the last index.
pub fn pick_weighted(weights: &[f64], draw: f64) -> usize {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || total <= 0.0 {
        return 0;
    }
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w / total;
        if draw < cumulative {
            return i;
        }
    }
    weights.len() - 1
}

pub struct LeastTokenUsedStrategy;

impl KeyRotationStrategy for LeastTokenUsedStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeastTokenUsed
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        if ctx.tokens.is_empty() {
            return Ok(Selection::at(0));
        }
        // Keys without data rank after every key with data.
        let index = best_index(candidates, |a, b| {
            let used = |k: &KeyRecord| ctx.tokens.get(&k.id).map_or(u64::MAX, |u| u.used);
            used(a).cmp(&used(b))
        });
        Ok(Selection::at(index))
    }
}

pub struct MaxRemainingStrategy;

impl KeyRotationStrategy for MaxRemainingStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::MaxRemaining
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        if ctx.tokens.is_empty() {
            return Ok(Selection::at(0));
        }
        let index = best_index(candidates, |a, b| {
            let remaining = |k: &KeyRecord| ctx.tokens.get(&k.id).map(|u| u.remaining);
            // Descending; `None` sorts below any value.
            remaining(b).cmp(&remaining(a))
        });
        Ok(Selection::at(index))
    }
}

pub struct WeightedUsageStrategy;

impl WeightedUsageStrategy {
    fn score(key: &KeyRecord, usage: Option<&TokenUsage>) -> f64 {
        let (remaining_ratio, used_ratio) = match usage {
            Some(u) if u.allowance > 0 => (
                u.remaining as f64 / u.allowance as f64,
                u.used as f64 / u.allowance as f64,
            ),
            _ => (0.0, 1.0),
        };
        let success_rate = if key.total_requests > 0 {
            key.success_requests as f64 / key.total_requests as f64
        } else {
            1.0
        };
        remaining_ratio.clamp(0.0, 1.0) * 100.0 * 0.4
            + (1.0 - used_ratio.clamp(0.0, 1.0)) * 100.0 * 0.3
            + success_rate * 100.0 * 0.3
    }
}

impl KeyRotationStrategy for WeightedUsageStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::WeightedUsage
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        if ctx.tokens.is_empty() {
            return Ok(Selection::at(0));
        }
        let scores: Vec<f64> = candidates
            .iter()
            .map(|k| Self::score(k, ctx.tokens.get(&k.id)))
            .collect();
        let mut best = 0;
        for (i, s) in scores.iter().enumerate().skip(1) {
            if *s > scores[best] {
                best = i;
            }
        }
        Ok(Selection::at(best))
    }
}

pub struct QuotaAwareStrategy;

impl KeyRotationStrategy for QuotaAwareStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::QuotaAware
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        let quota = &ctx.config.quota;
        let today = ctx.today();
        let mut warnings = Vec::new();

        let available: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, key)| {
                let daily = key.daily_used(&today);
                let usage = ctx.tokens.get(&key.id);
                if daily >= quota.per_key_daily_limit {
                    return false;
                }
                if let Some(u) = usage {
                    if u.used >= quota.per_key_monthly_limit || u.remaining == 0 {
                        return false;
                    }
                }

                let consumed = match usage {
                    Some(u) if u.allowance > 0 => u.used as f64 / u.allowance as f64,
                    _ => daily as f64 / quota.per_key_daily_limit as f64,
                };
                if consumed >= quota.warning_threshold {
                    warnings.push(QuotaWarning {
                        key_id: key.id.clone(),
                        consumed,
                    });
                }
                true
            })
            .map(|(i, _)| i)
            .collect();

        if available.is_empty() {
            return Err(AppError::PoolExhausted(ExhaustionReason::QuotaExceeded {
                candidates: candidates.len(),
            }));
        }

        let remaining = |i: usize| ctx.tokens.get(&candidates[i].id).map(|u| u.remaining);
        let mut best = available[0];
        for &i in &available[1..] {
            if remaining(i) > remaining(best) {
                best = i;
            }
        }

        Ok(Selection {
            index: best,
            delta: UsageDelta {
                quota_warnings: warnings,
                ..Default::default()
            },
        })
    }
}

pub struct TimeWindowStrategy;

impl KeyRotationStrategy for TimeWindowStrategy {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TimeWindow
    }

    fn select(
        &self,
        candidates: &[&KeyRecord],
        ctx: &SelectionContext<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<Selection> {
        ensure_candidates(candidates)?;
        let since = ctx.now - ChronoDuration::hours(i64::from(ctx.config.time_window_hours));
        let load = |k: &KeyRecord| {
            let samples = k.usage_history.iter().filter(|s| s.timestamp >= since).count();
            (k.window_tokens(since), samples)
        };
        let index = best_index(candidates, |a, b| load(a).cmp(&load(b)));
        Ok(Selection::at(index))
    }
}

/// First index that is minimal under `cmp`; earlier candidates win ties.
fn best_index<F>(candidates: &[&KeyRecord], cmp: F) -> usize
where
    F: Fn(&KeyRecord, &KeyRecord) -> Ordering,
{
    let mut best = 0;
    for i in 1..candidates.len() {
        if cmp(candidates[i], candidates[best]) == Ordering::Less {
            best = i;
        }
    }
    best
}

/// Maps the configured algorithm to its strategy.
pub fn strategy_for(algorithm: Algorithm) -> &'static dyn KeyRotationStrategy {
    match algorithm {
        Algorithm::RoundRobin => &RoundRobinStrategy,
        Algorithm::Random => &RandomStrategy,
        Algorithm::LeastUsed => &LeastUsedStrategy,
        Algorithm::WeightedScore => &WeightedScoreStrategy,
        Algorithm::LeastTokenUsed => &LeastTokenUsedStrategy,
        Algorithm::MaxRemaining => &MaxRemainingStrategy,
        Algorithm::WeightedUsage => &WeightedUsageStrategy,
        Algorithm::QuotaAware => &QuotaAwareStrategy,
        Algorithm::TimeWindow => &TimeWindowStrategy,
    }
}
