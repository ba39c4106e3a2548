//! Configuration loader and validator for the record relay.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::admission::{AdmissionSettings, FailurePolicy};
use crate::batcher::{BatchSettings, InvalidBatchPolicy};
use crate::queue::QueueSettings;
use crate::upstream::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub coordination: Coordination,
    pub admission: Admission,
    pub batching: Batching,
    pub queue: Queue,
    pub upstream: Upstream,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub database_url: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Shared coordination store used for buckets, batch lists and deferred queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coordination {
    pub backend: StoreBackend,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Admission {
    pub default_rpm: u32,
    pub bucket_ttl_seconds: u64,
    pub deferred_ttl_seconds: u64,
    pub on_store_failure: FailurePolicy,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batching {
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub batch_ttl_seconds: u64,
    #[serde(default)]
    pub on_invalid_batch: InvalidBatchPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub concurrency: usize,
    pub max_attempts: i32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub api_url: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Config {
    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            default_rpm: self.admission.default_rpm,
            bucket_ttl: Duration::from_secs(self.admission.bucket_ttl_seconds),
            deferred_ttl: Duration::from_secs(self.admission.deferred_ttl_seconds),
            on_store_failure: self.admission.on_store_failure,
            retry_after: Duration::from_secs(self.admission.retry_after_seconds),
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            max_batch_size: self.batching.max_batch_size,
            flush_interval: Duration::from_millis(self.batching.flush_interval_ms),
            batch_ttl: Duration::from_secs(self.batching.batch_ttl_seconds),
            on_invalid: self.batching.on_invalid_batch,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            concurrency: self.queue.concurrency,
            max_attempts: self.queue.max_attempts,
            backoff: Duration::from_millis(self.queue.backoff_ms),
            poll_interval: Duration::from_millis(self.app.poll_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.upstream.max_retries,
            base_delay: Duration::from_millis(self.upstream.base_delay_ms),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database_url must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.coordination.backend == StoreBackend::Sqlite
        && cfg
            .coordination
            .path
            .as_deref()
            .map_or(true, |p| p.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "coordination.path is required for the sqlite backend",
        ));
    }

    if cfg.admission.default_rpm == 0 {
        return Err(ConfigError::Invalid("admission.default_rpm must be > 0"));
    }
    if cfg.admission.bucket_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("admission.bucket_ttl_seconds must be > 0"));
    }

    if cfg.batching.max_batch_size == 0 {
        return Err(ConfigError::Invalid("batching.max_batch_size must be > 0"));
    }
    if cfg.batching.flush_interval_ms == 0 {
        return Err(ConfigError::Invalid("batching.flush_interval_ms must be > 0"));
    }

    if cfg.queue.concurrency == 0 {
        return Err(ConfigError::Invalid("queue.concurrency must be > 0"));
    }
    if cfg.queue.max_attempts < 1 {
        return Err(ConfigError::Invalid("queue.max_attempts must be >= 1"));
    }

    if cfg.upstream.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("upstream.api_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.upstream.api_url).is_err() {
        return Err(ConfigError::Invalid("upstream.api_url must be a valid URL"));
    }
    if cfg.upstream.max_retries == 0 {
        return Err(ConfigError::Invalid("upstream.max_retries must be >= 1"));
    }

    Ok(())
}

/// Returns the canonical example YAML.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/relay.db"
  poll_interval_ms: 250

coordination:
  backend: sqlite
  path: "./data/coordination.db"

admission:
  default_rpm: 300
  bucket_ttl_seconds: 60
  deferred_ttl_seconds: 3600
  on_store_failure: open
  retry_after_seconds: 60

batching:
  max_batch_size: 10
  flush_interval_ms: 1000
  batch_ttl_seconds: 300
  on_invalid_batch: drop

queue:
  concurrency: 5
  max_attempts: 3
  backoff_ms: 2000

upstream:
  api_url: "https://api.airtable.com/"
  max_retries: 3
  base_delay_ms: 1000
  timeout_seconds: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.admission.on_store_failure, FailurePolicy::Open);
        assert_eq!(cfg.batching.on_invalid_batch, InvalidBatchPolicy::Drop);
    }

    #[test]
    fn settings_follow_yaml() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let batch = cfg.batch_settings();
        assert_eq!(batch.max_batch_size, 10);
        assert_eq!(batch.flush_interval, Duration::from_millis(1000));
        assert_eq!(batch.batch_ttl, Duration::from_secs(300));

        let queue = cfg.queue_settings();
        assert_eq!(queue.concurrency, 5);
        assert_eq!(queue.max_attempts, 3);
        assert_eq!(queue.backoff, Duration::from_millis(2000));

        let retry = cfg.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn sqlite_backend_requires_path() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.coordination.path = None;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("coordination.path")),
            _ => panic!("wrong error"),
        }

        cfg.coordination.backend = StoreBackend::Memory;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_numbers_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.batching.max_batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.upstream.max_retries = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_retries")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_upstream_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.upstream.api_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn fail_closed_parses() {
        let yaml = example().replace("on_store_failure: open", "on_store_failure: closed");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.admission.on_store_failure, FailurePolicy::Closed);
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.queue.concurrency, 5);
        assert_eq!(cfg.coordination.backend, StoreBackend::Sqlite);
    }
}
