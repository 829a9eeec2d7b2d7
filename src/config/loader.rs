//! Configuration Loader
//!
//! Layers defaults, an optional YAML/TOML/JSON file and `TASKER__*`
//! environment overrides, then validates the merged result.

use super::SchedulerConfig;
use crate::error::SchedulerResult;
use config::{Config, Environment, File};
use std::path::Path;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "TASKER";
pub const ENV_SEPARATOR: &str = "__";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults, `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> SchedulerResult<SchedulerConfig> {
        Self::load_with_env(path, None)
    }

    /// Same as [`ConfigLoader::load`] but reads overrides from `env` instead of
    /// the process environment when provided. Used by tests.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> SchedulerResult<SchedulerConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&SchedulerConfig::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading scheduler configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let config: SchedulerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            partition_id = %config.controller.partition_id,
            driver_interval_ms = config.controller.driver_interval_ms,
            messaging_backend = ?config.messaging.backend,
            "Scheduler configuration loaded"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingBackend;
    use std::io::Write;

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = ConfigLoader::load_with_env(None, Some(config::Map::new())).unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "controller:\n  partition_id: partition-7\nqueue:\n  claim_limit: 250\nmessaging:\n  backend: in_memory"
        )
        .unwrap();

        let config = ConfigLoader::load_with_env(Some(file.path()), Some(config::Map::new())).unwrap();
        assert_eq!(config.controller.partition_id, "partition-7");
        assert_eq!(config.queue.claim_limit, 250);
        assert_eq!(config.messaging.backend, MessagingBackend::InMemory);
        // untouched sections keep their defaults
        assert_eq!(config.queue.cascade_batch_size, 20);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut env = config::Map::new();
        env.insert("TASKER__QUEUE__TIMEOUT_BATCH_SIZE".to_string(), "25".to_string());
        env.insert("TASKER__CONTROLLER__PARTITION_ID".to_string(), "from-env".to_string());

        let config = ConfigLoader::load_with_env(None, Some(env)).unwrap();
        assert_eq!(config.queue.timeout_batch_size, 25);
        assert_eq!(config.controller.partition_id, "from-env");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut env = config::Map::new();
        env.insert("TASKER__BUFFER__MAX_CONCURRENT_FLUSHES".to_string(), "0".to_string());

        let err = ConfigLoader::load_with_env(None, Some(env)).unwrap_err();
        assert!(err.to_string().contains("buffer.max_concurrent_flushes"));
    }
}
