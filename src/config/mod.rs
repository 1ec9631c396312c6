// src/config/mod.rs

pub mod app;
pub mod environment;
pub mod loader;
pub mod pool;
pub mod validation;

pub use app::{AppConfig, LimitsConfig, ServerConfig, StorageConfig, UpstreamConfig};
pub use environment::EnvironmentConfig;
pub use loader::load_config;
pub use pool::{Algorithm, PoolConfig, PoolConfigPatch};
pub use validation::ConfigValidator;
