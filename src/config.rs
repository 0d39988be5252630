//! Unified configuration for detection evaluation runs.
//!
//! Every section has defaults matching a stock local setup, so an empty
//! configuration file (or none at all) is valid. Values can be loaded from a
//! YAML file and then overridden by command-line flags.
//!
//! # Examples
//!
//! ```rust
//! use detection_eval::EvalConfig;
//!
//! let config = EvalConfig::from_yaml_str("index:\n  url: http://10.0.0.5:9200\n")?;
//! assert_eq!(config.index.url, "http://10.0.0.5:9200");
//! assert_eq!(config.index.index_prefix, "dredd");
//! # Ok::<(), detection_eval::EvalError>(())
//! ```

use crate::error::{EvalError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub index: IndexConfig,
    pub capture: CaptureConfig,
    pub runtime: RuntimeConfig,
    pub normalizer: NormalizerConfig,
    pub rules: RulesConfig,
}

impl EvalConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EvalError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// Parse configuration from YAML text. Empty text yields the defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| EvalError::Config(e.to_string()))
    }
}

/// Bounded retry with exponential backoff.
///
/// The delay starts at `initial_backoff_ms`, doubles after every failed
/// attempt and never exceeds `max_backoff_ms`. Retrying stops after
/// `max_attempts` attempts or once `timeout_ms` has elapsed, whichever
/// comes first.
///
/// ```rust
/// use detection_eval::config::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     initial_backoff_ms: 100,
///     max_backoff_ms: 300,
///     timeout_ms: 10_000,
/// };
/// assert_eq!(policy.backoff(0), Duration::from_millis(100));
/// assert_eq!(policy.backoff(1), Duration::from_millis(200));
/// assert_eq!(policy.backoff(2), Duration::from_millis(300));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            timeout_ms: 120_000,
        }
    }
}

/// Search-index backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Base URL of the search service.
    pub url: String,
    /// Shared index name, and the prefix of per-dataset index tokens.
    pub index_prefix: String,
    /// Backend tag a custom rule must carry to run on this backend.
    pub family: String,
    /// Container image launched for the search service.
    pub image: String,
    /// Environment passed to the search service container.
    pub env: BTreeMap<String, String>,
    /// Documents per bulk request.
    pub bulk_batch_size: usize,
    /// File suffixes identifying telemetry archives.
    pub archive_extensions: Vec<String>,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
    /// Readiness wait after the service is launched.
    pub readiness: RetryPolicy,
}

impl IndexConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("discovery.type".to_string(), "single-node".to_string());
        Self {
            url: "http://127.0.0.1:9200".to_string(),
            index_prefix: "dredd".to_string(),
            family: "elasticsearch".to_string(),
            image: "elasticsearch:7.6.0".to_string(),
            env,
            bulk_batch_size: 500,
            archive_extensions: vec!["tar.gz".to_string()],
            request_timeout_ms: 30_000,
            readiness: RetryPolicy::default(),
        }
    }
}

/// Packet-capture backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub image: String,
    pub rule_extensions: Vec<String>,
    pub capture_extensions: Vec<String>,
    /// Where the merged ruleset is mounted inside the container.
    pub ruleset_mount: String,
    /// Where the capture file (or directory) is mounted inside the container.
    pub capture_mount: String,
    /// Alert log written by the detection engine.
    pub alert_log_path: String,
    pub replay_command: Vec<String>,
    pub workdir: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            image: "2xxesra/suricata".to_string(),
            rule_extensions: vec!["rule".to_string(), "rules".to_string()],
            capture_extensions: vec!["pcap".to_string(), "cap".to_string()],
            ruleset_mount: "/var/lib/suricata/rules/suricata.rules".to_string(),
            capture_mount: "/opt/pcaps".to_string(),
            alert_log_path: "/opt/eve.json".to_string(),
            replay_command: ["suricata", "-k", "none", "-r", "/opt/pcaps"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            workdir: "/opt".to_string(),
        }
    }
}

/// Container runtime settings shared by both backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container runtime executable.
    pub binary: String,
    /// Pull the image before launching.
    pub pull: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            pull: false,
        }
    }
}

/// What ingestion does with a record that never acquired `winlog.event_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingEventId {
    /// Index the record without `event.code`.
    #[default]
    Keep,
    /// Leave the record out of the bulk load.
    Drop,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub missing_event_id: MissingEventId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Abort the run on rule files that fail for reasons other than an
    /// unsupported feature, instead of listing them as invalid.
    pub strict: bool,
}
