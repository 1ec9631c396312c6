// src/storage/pool_group.rs

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

pub const DEFAULT_POOL_GROUP: &str = "default";

static POOL_GROUP_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9-]+$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// A named priority tier. Lower `priority` is consulted first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PoolGroup {
    #[validate(regex(
        path = *POOL_GROUP_ID,
        message = "Pool group id may only contain lowercase letters, digits and dashes"
    ))]
    pub id: String,
    #[validate(length(min = 1, max = 64, message = "Pool group name must be 1-64 characters"))]
    pub name: String,
    #[validate(range(min = 1, max = 100, message = "Priority must be between 1 and 100"))]
    pub priority: u32,
    #[serde(default)]
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: String,
}

/// Per-group status counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolGroupStats {
    pub id: String,
    pub name: String,
    pub priority: u32,
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
    pub banned: usize,
}
