//! Bootstrap configuration integration tests
//!
//! Env-var tests are serialized because process environment is global.

use selah_common::config::{Config, ConfigOverrides, TomlConfig};
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

fn clear_selah_env() {
    for key in [
        "SELAH_CONFIG",
        "SELAH_DATABASE_PATH",
        "SELAH_PORT",
        "SELAH_BIND_ADDRESS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn resolve_with_config_file() {
    clear_selah_env();

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("selah.toml");
    std::fs::write(
        &config_path,
        r#"
        database_path = "/tmp/from-toml.db"
        port = 6100

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    std::env::set_var("SELAH_CONFIG", &config_path);

    let config = Config::resolve(ConfigOverrides::default()).unwrap();
    assert_eq!(config.database_path, PathBuf::from("/tmp/from-toml.db"));
    assert_eq!(config.port, 6100);
    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.log_level(), "debug");
    assert_eq!(config.config_path, Some(config_path));

    clear_selah_env();
}

#[test]
#[serial]
fn env_overrides_beat_toml() {
    clear_selah_env();

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("selah.toml");
    std::fs::write(
        &config_path,
        r#"
        database_path = "/tmp/from-toml.db"
        port = 6100
        "#,
    )
    .unwrap();

    std::env::set_var("SELAH_CONFIG", &config_path);
    std::env::set_var("SELAH_DATABASE_PATH", "/tmp/from-env.db");
    std::env::set_var("SELAH_PORT", "6200");
    std::env::set_var("SELAH_BIND_ADDRESS", "0.0.0.0");

    let overrides = ConfigOverrides::from_env().unwrap();
    let config = Config::resolve(overrides).unwrap();

    assert_eq!(config.database_path, PathBuf::from("/tmp/from-env.db"));
    assert_eq!(config.port, 6200);
    assert_eq!(config.bind_address, "0.0.0.0");

    clear_selah_env();
}

#[test]
#[serial]
fn invalid_env_port_is_config_error() {
    clear_selah_env();
    std::env::set_var("SELAH_PORT", "not-a-port");

    let result = ConfigOverrides::from_env();
    assert!(result.is_err());

    clear_selah_env();
}

#[test]
#[serial]
fn missing_config_file_falls_back_to_defaults() {
    clear_selah_env();

    // Point at a path that does not exist; discovery must not pick it up
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope").join("selah.toml");
    assert!(!missing.exists());

    let config = Config::resolve(ConfigOverrides::default()).unwrap();
    assert_eq!(config.port, 5750);
    assert!(!config.database_path.as_os_str().is_empty());

    clear_selah_env();
}

#[test]
fn write_toml_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("selah.toml");

    let mut config = TomlConfig::default();
    config.database_path = Some(PathBuf::from("/tmp/db.sqlite"));
    config.judgment_api_key = Some("sk-roundtrip".to_string());

    selah_common::config::write_toml_config(&config, &path).unwrap();

    let loaded = TomlConfig::load(&path).unwrap();
    assert_eq!(loaded.database_path, Some(PathBuf::from("/tmp/db.sqlite")));
    assert_eq!(loaded.judgment_api_key.as_deref(), Some("sk-roundtrip"));
    assert_eq!(loaded.port, 5750);
}
