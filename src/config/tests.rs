use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::load_config_from;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.max_connections, 1000);
    assert!(settings.server.data_dir.is_none());
    assert_eq!(settings.messaging.uri, "ws://127.0.0.1:8080");
    assert_eq!(
        settings.messaging.operation_timeout(),
        Duration::from_secs(5)
    );
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    temp_env::with_vars_unset(
        ["SALESBUS_SERVER__PORT", "SALESBUS_MESSAGING__URI"],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.server.port, 8080);
            assert_eq!(cfg.messaging.uri, "ws://127.0.0.1:8080");
        },
    );
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("salesbus.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000
        data_dir = "/var/lib/salesbus"

        [messaging]
        uri = "ws://broker.internal:9000"
        rpc_timeout_ms = 2500
    "#;
    fs::write(&path, toml).expect("write config file");

    temp_env::with_vars_unset(
        ["SALESBUS_SERVER__PORT", "SALESBUS_MESSAGING__URI"],
        || {
            let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
            assert_eq!(cfg.server.host, "0.0.0.0");
            assert_eq!(cfg.server.port, 9000);
            assert_eq!(cfg.server.data_dir.as_deref(), Some("/var/lib/salesbus"));
            assert_eq!(cfg.messaging.uri, "ws://broker.internal:9000");
            assert_eq!(cfg.messaging.rpc_timeout(), Duration::from_millis(2500));
            // untouched keys keep their defaults
            assert_eq!(cfg.server.max_connections, 1000);
            assert_eq!(cfg.messaging.connect_timeout_ms, 5_000);
        },
    );
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("salesbus.toml");
    fs::write(&path, "[server]\nport = 9000\n").expect("write config file");

    temp_env::with_vars(
        [
            ("SALESBUS_SERVER__PORT", Some("9100")),
            ("SALESBUS_MESSAGING__URI", Some("ws://10.0.0.5:5672")),
        ],
        || {
            let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.messaging.uri, "ws://10.0.0.5:5672");
        },
    );
}
