// src/monitoring/mod.rs

pub mod key_health;
pub mod token_usage;

pub use key_health::{HttpProbe, KeyHealthProbe, KeyTestReport, ProbeResponse, TestAllSummary, UpstreamProbe};
pub use token_usage::{TokenSnapshot, TokenUsage, TokenUsageProvider, TokenUsageStore};
