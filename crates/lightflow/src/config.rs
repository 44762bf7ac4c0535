//! YAML configuration
//!
//! Configuration is explicit: the CLI loads a file and passes the parsed
//! [`Config`] into constructors. There is no process-global config object.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::queue::QueueName;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Connection settings for the broker or the signal substrate
///
/// The signal bus may share the broker's backend; the sections stay
/// separate so deployments can split them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            password: None,
        }
    }
}

/// Connection settings for the document store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            database: "lightflow".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Worker defaults applied when the CLI flags leave them unset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSection {
    pub concurrency: usize,
    pub queues_default: Vec<QueueName>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queues_default: QueueName::ALL.to_vec(),
        }
    }
}

/// Logging settings, consumed by the CLI's tracing setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `lightflow=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search paths for workflow definition files
    pub workflows: Vec<PathBuf>,

    pub broker: BrokerConfig,

    pub signal: BrokerConfig,

    pub store: StoreConfig,

    pub worker: WorkerSection,

    pub logging: LoggingConfig,
}

impl Config {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The commented default configuration emitted by `config default`
    pub fn default_yaml() -> &'static str {
        r#"# Lightflow configuration

# Directories scanned for workflow definition files (*.yaml)
workflows:
  - ./workflows

# Job queue broker
broker:
  host: localhost
  port: 6379
  database: 0
  # password: secret

# Signal bus (may point at the broker's backend)
signal:
  host: localhost
  port: 6379
  database: 0

# Document store for per-run state
store:
  host: localhost
  port: 27017
  database: lightflow
  # username: lightflow
  # password: secret

# Worker defaults
worker:
  concurrency: 4
  queues_default: [workflow, dag, task]

# Logging (tracing EnvFilter directive)
logging:
  level: info
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_yaml_parses_to_defaults() {
        let parsed: Config = serde_yaml::from_str(Config::default_yaml()).unwrap();
        let mut expected = Config::default();
        expected.workflows = vec![PathBuf::from("./workflows")];
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = serde_yaml::from_str("worker: { concurrency: 16, queues_default: [task] }").unwrap();
        assert_eq!(parsed.worker.concurrency, 16);
        assert_eq!(parsed.worker.queues_default, vec![QueueName::Task]);
        assert_eq!(parsed.broker, BrokerConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.cfg")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
