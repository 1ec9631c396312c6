// src/middleware/mod.rs

pub mod admin_auth;
pub mod request_size_limit;

pub use admin_auth::admin_auth_middleware;
pub use request_size_limit::request_size_limit_middleware;
