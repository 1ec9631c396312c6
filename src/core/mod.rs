// src/core/mod.rs

pub mod key_rotation;
pub mod scoring;
pub mod tiers;

pub use key_rotation::{
    pick_weighted, strategy_for, KeyRotationStrategy, QuotaWarning, Selection, SelectionContext,
    UsageDelta,
};
pub use scoring::{composite_score, ScoreCache};
pub use tiers::{filter_by_tier, Tier};
