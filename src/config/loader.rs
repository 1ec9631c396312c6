// src/config/loader.rs

use crate::config::{AppConfig, ConfigValidator};
use crate::error::{AppError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Load configuration from file or environment variables
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let mut config = if config_path.exists() {
        info!("Loading configuration from file: {}", config_path.display());
        load_from_file(config_path)?
    } else {
        info!("Configuration file not found, using defaults");
        AppConfig::default()
    };

    // Override with environment variables
    override_with_env(&mut config);

    // Validate the final configuration
    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(config_path).map_err(|e| {
        AppError::Config(format!(
            "Failed to read config file {}: {e}",
            config_path.display()
        ))
    })?;

    // An empty file is a valid "all defaults" config.
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    Ok(serde_yaml::from_str(&content)?)
}

fn override_with_env(config: &mut AppConfig) {
    if let Ok(host) = std::env::var("KEYPOOL_HOST") {
        info!("Overriding server host from environment variable: {}", host);
        config.server.host = host;
    }

    if let Ok(port_str) = std::env::var("PORT") {
        if let Ok(port) = port_str.parse::<u16>() {
            info!("Overriding server port from environment variable: {}", port);
            config.server.port = port;
        } else {
            warn!("Invalid PORT environment variable: {}", port_str);
        }
    }

    if let Ok(token) = std::env::var("ADMIN_KEY") {
        info!("Overriding admin token from environment variable");
        config.server.admin_token = Some(token);
    }

    if let Ok(path) = std::env::var("KEY_POOL_FILE") {
        info!("Overriding key pool path from environment variable: {}", path);
        config.storage.key_pool_path = PathBuf::from(path);
    }

    if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
        info!("Overriding upstream base URL from environment variable: {}", url);
        config.upstream.base_url = url;
    }

    if let Ok(limit_str) = std::env::var("NOTES_MAX_LENGTH") {
        if let Ok(limit) = limit_str.parse::<usize>() {
            info!("Overriding notes limit from environment: {}", limit);
            config.limits.notes_max_length = limit;
        } else {
            warn!("Invalid NOTES_MAX_LENGTH environment variable: {}", limit_str);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/keypool/config.yaml")).unwrap();
        assert_eq!(config.storage.debounce_ms, 1000);
        assert_eq!(config.limits.notes_max_length, 1000);
    }

    #[test]
    #[serial]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9090\nstorage:\n  key_pool_path: /tmp/pool.json\n"
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.key_pool_path, PathBuf::from("/tmp/pool.json"));
        assert_eq!(config.storage.write_retries, 3);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 9090\n").unwrap();
        std::env::set_var("PORT", "9191");
        std::env::set_var("KEY_POOL_FILE", "/tmp/other.json");
        let config = load_config(file.path());
        std::env::remove_var("PORT");
        std::env::remove_var("KEY_POOL_FILE");
        let config = config.unwrap();
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.storage.key_pool_path, PathBuf::from("/tmp/other.json"));
    }

    #[test]
    #[serial]
    fn test_malformed_yaml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server: [not, a, map").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
