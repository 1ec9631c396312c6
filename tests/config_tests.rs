// tests/config_tests.rs

use keypool_proxy::{config::AppConfig, error::AppError, setup_configuration};
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn yaml_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file
}

fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    for (name, value) in vars {
        std::env::set_var(name, value);
    }
    let result = f();
    for (name, _) in vars {
        std::env::remove_var(name);
    }
    result
}

#[test]
#[serial]
fn test_full_config_file() {
    let file = yaml_file(
        r#"
server:
  host: 127.0.0.1
  port: 8088
  admin_token: operator-secret
  request_body_limit_bytes: 2048
storage:
  key_pool_path: /var/lib/keypool/pool.json
  debounce_ms: 250
  token_usage_path: /var/lib/keypool/usage.json
upstream:
  base_url: https://upstream.example.com/v1
  probe_url: https://upstream.example.com/v1/messages
limits:
  notes_max_length: 200
"#,
    );

    let config = setup_configuration(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 8088);
    assert_eq!(config.server.admin_token.as_deref(), Some("operator-secret"));
    assert_eq!(config.storage.debounce_ms, 250);
    assert_eq!(
        config.storage.token_usage_path,
        Some(PathBuf::from("/var/lib/keypool/usage.json"))
    );
    assert_eq!(config.limits.notes_max_length, 200);
}

#[test]
#[serial]
fn test_empty_file_is_all_defaults() {
    let file = yaml_file("");
    let config = setup_configuration(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(config, AppConfig::default());
}

#[test]
#[serial]
fn test_environment_overrides() {
    let file = yaml_file("server:\n  port: 9000\n");
    let config = with_env(
        &[
            ("KEYPOOL_HOST", "10.0.0.1"),
            ("ADMIN_KEY", "from-env-token"),
            ("UPSTREAM_BASE_URL", "http://localhost:9999/v1"),
            ("NOTES_MAX_LENGTH", "not-a-number"),
        ],
        || setup_configuration(Some(file.path().to_path_buf())),
    )
    .unwrap();

    assert_eq!(config.server.host, "10.0.0.1");
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.server.admin_token.as_deref(), Some("from-env-token"));
    assert_eq!(config.upstream.base_url, "http://localhost:9999/v1");
    assert_eq!(config.limits.notes_max_length, 1000);
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    let cases = [
        ("server:\n  port: 0\n", "server.port"),
        ("upstream:\n  base_url: ftp://files.example.com\n", "upstream.base_url"),
        ("storage:\n  write_retries: 0\n", "storage.write_retries"),
        ("limits:\n  notes_max_length: 0\n", "limits.notes_max_length"),
    ];
    for (yaml, expected_field) in cases {
        let file = yaml_file(yaml);
        match setup_configuration(Some(file.path().to_path_buf())) {
            Err(AppError::Validation { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("{expected_field}: expected a validation error, got {other:?}"),
        }
    }
}

#[test]
#[serial]
fn test_unparseable_yaml_is_an_error() {
    let file = yaml_file("server: [1, 2");
    assert!(matches!(
        setup_configuration(Some(file.path().to_path_buf())),
        Err(AppError::YamlParsing(_))
    ));
}
