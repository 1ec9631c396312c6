// src/core/tiers.rs

use crate::config::pool::MultiTierPolicy;
use crate::error::{AppError, ExhaustionReason, Result};
use crate::storage::{KeyRecord, PoolGroup, DEFAULT_POOL_GROUP};
use std::collections::HashSet;
use tracing::trace;

/// Candidates that survived tier filtering, with the tier they came from.
#[derive(Debug)]
pub struct Tier<'a> {
    pub group: String,
    pub keys: Vec<&'a KeyRecord>,
}

/// Narrows `eligible` to the highest-priority tier that has keys.
///
/// Groups are consulted by ascending priority. Keys whose group is missing,
/// `default`, or not a defined group form the implicit default tier, tried last.
/// Without auto-fallback only the first tier is consulted.
pub fn filter_by_tier<'a>(
    eligible: &[&'a KeyRecord],
    groups: &[PoolGroup],
    policy: &MultiTierPolicy,
) -> Result<Tier<'a>> {
    let mut ordered: Vec<&PoolGroup> = groups.iter().collect();
    ordered.sort_by_key(|g| g.priority);
    let known: HashSet<&str> = groups.iter().map(|g| g.id.as_str()).collect();

    for group in &ordered {
        let keys: Vec<&KeyRecord> = eligible
            .iter()
            .copied()
            .filter(|k| k.group_id() == group.id)
            .collect();
        trace!(group = %group.id, priority = group.priority, candidates = keys.len(), "Tier scan");
        if !keys.is_empty() {
            return Ok(Tier {
                group: group.id.clone(),
                keys,
            });
        }
        if !policy.auto_fallback {
            return Err(AppError::PoolExhausted(ExhaustionReason::TierEmpty {
                group: group.id.clone(),
            }));
        }
    }

    let keys: Vec<&KeyRecord> = eligible
        .iter()
        .copied()
        .filter(|k| !known.contains(k.group_id()))
        .collect();
    if keys.is_empty() {
        return Err(AppError::PoolExhausted(ExhaustionReason::TierEmpty {
            group: DEFAULT_POOL_GROUP.to_string(),
        }));
    }
    Ok(Tier {
        group: DEFAULT_POOL_GROUP.to_string(),
        keys,
    })
}
