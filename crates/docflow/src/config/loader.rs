use std::path::{Path, PathBuf};

use crate::config::schema::WorkerConfig;
use crate::error::ConfigError;
use crate::telemetry::LogFormat;

const SCHEMA_JSON: &str = include_str!("../../schema/worker-config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<WorkerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<WorkerConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let mut config: WorkerConfig = serde_json::from_value(json_value)?;

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Environment variables win over the file.
pub fn apply_env_overrides(config: &mut WorkerConfig) -> Result<(), ConfigError> {
    if let Some(value) = env_parse::<usize>("WORKER_BATCH_SIZE")? {
        config.worker.batch_size = value;
    }
    if let Some(value) = env_parse::<u64>("WORKER_POLL_INTERVAL")? {
        config.worker.poll_interval_secs = value;
    }
    if let Some(value) = env_bool("WORKER_ENABLE")? {
        config.worker.enable = value;
    }
    if let Some(value) = env_string("DOCFLOW_DATABASE") {
        config.database.path = Some(PathBuf::from(value));
    }
    if let Some(value) = env_string("DOCFLOW_STAGE_SERVICE_URL") {
        config.stages.service_url = Some(value);
    }
    if let Some(value) = env_parse::<LogFormat>("DOCFLOW_LOG_FORMAT")? {
        config.logging.format = value;
    }
    Ok(())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value,
        }),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(name) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        },
        None => Ok(None),
    }
}

pub fn validate_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let worker = &config.worker;
    if worker.batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "worker.batch_size must be at least 1".to_string(),
        });
    }
    if worker.poll_interval_secs == 0 || worker.janitor_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "worker intervals must be non-zero".to_string(),
        });
    }
    if worker.renew_interval_secs == 0 || worker.renew_interval_secs >= worker.lease_duration_secs
    {
        return Err(ConfigError::Validation {
            message: format!(
                "worker.renew_interval_secs ({}) must be non-zero and shorter than lease_duration_secs ({})",
                worker.renew_interval_secs, worker.lease_duration_secs
            ),
        });
    }

    let channel = &config.channel;
    if channel.max_delivery_count == 0 {
        return Err(ConfigError::Validation {
            message: "channel.max_delivery_count must be at least 1".to_string(),
        });
    }
    if worker.renew_interval_secs >= channel.lock_duration_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "worker.renew_interval_secs ({}) must be shorter than channel.lock_duration_secs ({})",
                worker.renew_interval_secs, channel.lock_duration_secs
            ),
        });
    }
    if let Some(stale) = channel.stale_enqueue_secs {
        if stale < channel.lock_duration_secs {
            return Err(ConfigError::Validation {
                message: format!(
                    "channel.stale_enqueue_secs ({}) must be at least channel.lock_duration_secs ({})",
                    stale, channel.lock_duration_secs
                ),
            });
        }
    }

    let stages = &config.stages;
    if stages.chunk_size == 0 || stages.chunk_overlap >= stages.chunk_size {
        return Err(ConfigError::Validation {
            message: format!(
                "stages.chunk_overlap ({}) must be smaller than a non-zero chunk_size ({})",
                stages.chunk_overlap, stages.chunk_size
            ),
        });
    }
    for (stage, secs) in stages.timeouts.as_list() {
        if secs == 0 {
            return Err(ConfigError::Validation {
                message: format!("stages.timeouts.{}_secs must be non-zero", stage),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelKind;
    use serial_test::serial;

    const ENV_VARS: [&str; 6] = [
        "WORKER_BATCH_SIZE",
        "WORKER_POLL_INTERVAL",
        "WORKER_ENABLE",
        "DOCFLOW_DATABASE",
        "DOCFLOW_STAGE_SERVICE_URL",
        "DOCFLOW_LOG_FORMAT",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_load_minimal_config_uses_defaults() {
        clear_env();
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();

        assert!(config.worker.enable);
        assert_eq!(config.worker.slots, 1);
        assert_eq!(config.worker.batch_size, 1);
        assert_eq!(config.worker.poll_interval_secs, 10);
        assert_eq!(config.worker.lease_duration_secs, 300);
        assert_eq!(config.worker.renew_interval_secs, 120);
        assert_eq!(config.channel.kind, ChannelKind::Polling);
        assert_eq!(config.stages.chunk_size, 1000);
        assert_eq!(config.stages.chunk_overlap, 200);
        assert_eq!(config.stages.timeouts.extract_secs, 600);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    #[serial]
    fn test_load_full_config() {
        clear_env();
        let config_json = r#"
        {
            "version": "1.0",
            "database": { "path": "/var/lib/docflow/jobs.db" },
            "worker": {
                "slots": 4,
                "batch_size": 5,
                "lease_duration_secs": 600,
                "renew_interval_secs": 200,
                "retry_via_redelivery": true
            },
            "channel": { "kind": "memory", "lock_duration_secs": 600 },
            "stages": {
                "service_url": "http://localhost:8090",
                "timeouts": { "embed_secs": 30 },
                "chunk_size": 500,
                "chunk_overlap": 50
            },
            "logging": { "format": "json" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(
            config.database.resolved_path(),
            PathBuf::from("/var/lib/docflow/jobs.db")
        );
        assert_eq!(config.worker.slots, 4);
        assert!(config.worker.retry_via_redelivery);
        assert_eq!(config.channel.kind, ChannelKind::Memory);
        assert_eq!(config.channel.stale_enqueue_after().as_secs(), 6000);
        assert_eq!(
            config.stages.service_url.as_deref(),
            Some("http://localhost:8090")
        );
        assert_eq!(config.stages.timeouts.embed_secs, 30);
        assert_eq!(config.stages.timeouts.download_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Json);

        let executor = config.worker.executor_settings();
        assert_eq!(executor.lease_duration.as_secs(), 600);
        assert_eq!(config.worker.pool_settings().batch_size, 5);
    }

    #[test]
    #[serial]
    fn test_schema_rejects_unknown_fields() {
        clear_env();
        let result = load_config_from_str(r#"{ "version": "1.0", "workers": {} }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    #[serial]
    fn test_schema_rejects_bad_channel_kind() {
        clear_env();
        let result = load_config_from_str(r#"{ "version": "1.0", "channel": { "kind": "kafka" } }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    #[serial]
    fn test_invalid_version() {
        clear_env();
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_renew_interval_must_be_shorter_than_lease() {
        clear_env();
        let result = load_config_from_str(
            r#"{ "version": "1.0", "worker": { "lease_duration_secs": 60, "renew_interval_secs": 60 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    #[serial]
    fn test_stale_enqueue_threshold() {
        clear_env();
        let config = load_config_from_str(
            r#"{ "version": "1.0", "channel": { "lock_duration_secs": 300, "stale_enqueue_secs": 900 } }"#,
        )
        .unwrap();
        assert_eq!(config.channel.stale_enqueue_after().as_secs(), 900);

        let result = load_config_from_str(
            r#"{ "version": "1.0", "channel": { "lock_duration_secs": 300, "stale_enqueue_secs": 60 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    #[serial]
    fn test_chunk_overlap_must_be_smaller_than_size() {
        clear_env();
        let result = load_config_from_str(
            r#"{ "version": "1.0", "stages": { "chunk_size": 100, "chunk_overlap": 100 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    #[serial]
    fn test_env_overrides_win_over_file() {
        clear_env();
        std::env::set_var("WORKER_BATCH_SIZE", "8");
        std::env::set_var("WORKER_POLL_INTERVAL", "3");
        std::env::set_var("WORKER_ENABLE", "false");
        std::env::set_var("DOCFLOW_STAGE_SERVICE_URL", "http://stages:9000");
        std::env::set_var("DOCFLOW_LOG_FORMAT", "json");

        let config = load_config_from_str(
            r#"{ "version": "1.0", "worker": { "batch_size": 2, "slots": 3 } }"#,
        );
        clear_env();
        let config = config.unwrap();

        assert_eq!(config.worker.batch_size, 8);
        assert_eq!(config.worker.poll_interval_secs, 3);
        assert!(!config.worker.enable);
        assert_eq!(config.worker.pool_settings().slots, 0);
        assert_eq!(
            config.stages.service_url.as_deref(),
            Some("http://stages:9000")
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_rejected() {
        clear_env();
        std::env::set_var("WORKER_BATCH_SIZE", "many");
        let result = load_config_from_str(r#"{ "version": "1.0" }"#);
        clear_env();

        match result {
            Err(ConfigError::InvalidEnv { name, value }) => {
                assert_eq!(name, "WORKER_BATCH_SIZE");
                assert_eq!(value, "many");
            }
            other => panic!("expected InvalidEnv, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_zero_batch_size_from_env_fails_validation() {
        clear_env();
        std::env::set_var("WORKER_BATCH_SIZE", "0");
        let result = load_config_from_str(r#"{ "version": "1.0" }"#);
        clear_env();
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    #[serial]
    fn test_load_config_missing_file() {
        clear_env();
        let result = load_config("/nonexistent/docflow.json");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{ "version": "1.0", "worker": { "slots": 2 } }"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.worker.slots, 2);
    }
}
