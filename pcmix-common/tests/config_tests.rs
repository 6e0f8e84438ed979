//! Integration tests for configuration loading
//!
//! Note: uses serial_test to prevent races on the PCMIX_CONFIG environment
//! variable. Tests that touch it are marked with #[serial].

use pcmix_common::config::{
    resolve_config_path, BackendSetting, DeviceSelection, TomlConfig, CONFIG_ENV_VAR,
};
use pcmix_common::SampleFormat;
use serial_test::serial;
use std::env;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes()).expect("Failed to write config");
    file
}

#[test]
fn test_full_config_file() {
    let file = write_config(
        r#"
[audio]
sample_rate = 48000
sample_format = "float32"
output_format = "int16"
backend = "ring"
device = "Speakers (USB)"
buffer_ms = 40

[logging]
level = "debug"
file = "/tmp/pcmix.log"
"#,
    );

    let config = TomlConfig::load(file.path()).expect("Config should parse");
    assert_eq!(config.audio.sample_rate, 48000);
    assert_eq!(config.audio.sample_format, SampleFormat::Float32);
    assert_eq!(config.audio.output_format, SampleFormat::Int16);
    assert_eq!(config.audio.backend, BackendSetting::Ring);
    assert_eq!(
        config.audio.device_selection(),
        DeviceSelection::Named("Speakers (USB)".to_string())
    );
    assert_eq!(config.audio.buffer_ms, 40);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.file.is_some());
}

#[test]
fn test_partial_config_fills_defaults() {
    let file = write_config("[audio]\nbackend = \"native\"\n");

    let config = TomlConfig::load(file.path()).unwrap();
    assert_eq!(config.audio.backend, BackendSetting::Native);
    assert_eq!(config.audio.sample_rate, 44100);
    assert_eq!(config.audio.buffer_ms, 100);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_invalid_toml_is_error() {
    let file = write_config("[audio\nsample_rate = 1");
    assert!(TomlConfig::load(file.path()).is_err());
}

#[test]
fn test_out_of_range_sample_rate_is_error() {
    let file = write_config("[audio]\nsample_rate = 100\n");
    assert!(TomlConfig::load(file.path()).is_err());
}

#[test]
#[serial]
fn test_cli_path_takes_priority_over_env() {
    let cli = write_config("[audio]\nsample_rate = 22050\n");
    let from_env = write_config("[audio]\nsample_rate = 96000\n");
    env::set_var(CONFIG_ENV_VAR, from_env.path());

    let resolved = resolve_config_path(Some(cli.path()), CONFIG_ENV_VAR);
    assert_eq!(resolved.as_deref(), Some(cli.path()));

    let config = TomlConfig::load_or_default(Some(cli.path())).unwrap();
    assert_eq!(config.audio.sample_rate, 22050);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_path_used_without_cli() {
    let from_env = write_config("[audio]\nsample_rate = 96000\n");
    env::set_var(CONFIG_ENV_VAR, from_env.path());

    let config = TomlConfig::load_or_default(None).unwrap();
    assert_eq!(config.audio.sample_rate, 96000);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_missing_explicit_file_falls_back_to_defaults() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("does-not-exist.toml");

    let config = TomlConfig::load_or_default(Some(&missing)).unwrap();
    assert_eq!(config, TomlConfig::default());
}
