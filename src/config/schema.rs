//! Configuration schema for modcheck
//!
//! Configuration is stored at `~/.config/modcheck/config.toml`

use crate::error::{ModcheckError, ModcheckResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Validation cache settings
    pub cache: CacheConfig,

    /// Batch orchestrator settings
    pub batch: BatchConfig,

    /// Change watching settings
    pub watch: WatchConfig,

    /// Performance monitor settings
    pub monitor: MonitorConfig,
}

impl Config {
    /// Reject settings that make the cache or orchestrator unusable.
    ///
    /// `source` is only used to label the error.
    pub fn validate(&self, source: &Path) -> ModcheckResult<()> {
        let invalid = |reason: String| ModcheckError::ConfigInvalid {
            path: source.to_path_buf(),
            reason,
        };

        if self.batch.concurrency == 0 {
            return Err(invalid("batch.concurrency must be at least 1".to_string()));
        }
        if self.batch.batch_size == 0 {
            return Err(invalid("batch.batch_size must be at least 1".to_string()));
        }
        if self.monitor.history_limit == 0 {
            return Err(invalid("monitor.history_limit must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.monitor.low_hit_rate) {
            return Err(invalid(format!(
                "monitor.low_hit_rate must be within 0..=1, got {}",
                self.monitor.low_hit_rate
            )));
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(invalid(format!(
                "general.log_format must be \"text\" or \"json\", got {:?}",
                self.general.log_format
            )));
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// How changed paths are compared against the files an entry depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatch {
    /// Normalized paths must be equal
    Exact,
    /// Equal, or a relative path matching the tail of the other path
    #[default]
    Suffix,
}

/// Validation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Persist entries to disk (false = memory-only)
    pub persistent: bool,

    /// Cache directory (defaults to the platform cache dir)
    pub dir: Option<PathBuf>,

    /// Entries older than this are stale regardless of hash (0 = never)
    pub max_age_secs: u64,

    /// In-memory byte budget
    pub max_size_bytes: u64,

    /// On-disk byte budget enforced by maintenance (0 = unbounded)
    pub max_disk_bytes: u64,

    /// Gzip persisted entries
    pub compress: bool,

    /// Upper bound on a cold read from disk during a lookup
    pub disk_read_timeout_ms: u64,

    /// Path comparison used for file-based invalidation
    pub path_match: PathMatch,
}

impl CacheConfig {
    /// Maximum entry age, `None` when age expiry is disabled
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    /// Cold read timeout
    pub fn disk_read_timeout(&self) -> Duration {
        Duration::from_millis(self.disk_read_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            dir: None,
            max_age_secs: 24 * 60 * 60,
            max_size_bytes: 64 * 1024 * 1024,
            max_disk_bytes: 512 * 1024 * 1024,
            compress: true,
            disk_read_timeout_ms: 2000,
            path_match: PathMatch::Suffix,
        }
    }
}

/// Batch orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum tasks running at once
    pub concurrency: usize,

    /// Tasks per sequential batch
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 10,
        }
    }
}

/// Change watching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period before a burst of changes triggers a cycle
    pub debounce_ms: u64,
}

impl WatchConfig {
    /// Debounce interval
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

/// Performance monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Completed operations kept for statistics
    pub history_limit: usize,

    /// Hit rate (0..=1) under which an insight is raised
    pub low_hit_rate: f64,

    /// Average duration (ms) over which an insight is raised
    pub slow_op_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            low_hit_rate: 0.3,
            slow_op_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[cache]"));
        assert!(toml.contains("[batch]"));
        assert!(toml.contains("path_match = \"suffix\""));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.batch.batch_size, 10);
        assert!(config.cache.persistent);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            persistent = false
            path_match = "exact"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.cache.persistent);
        assert_eq!(config.cache.path_match, PathMatch::Exact);
        assert_eq!(config.watch.debounce_ms, 300); // default preserved
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = Config::default();
        config.batch.concurrency = 0;
        let err = config.validate(Path::new("config.toml")).unwrap_err();
        assert!(err.to_string().contains("batch.concurrency"));
    }

    #[test]
    fn hit_rate_threshold_bounded() {
        let mut config = Config::default();
        config.monitor.low_hit_rate = 1.5;
        assert!(config.validate(Path::new("config.toml")).is_err());
    }

    #[test]
    fn zero_max_age_disables_expiry() {
        let cache = CacheConfig {
            max_age_secs: 0,
            ..CacheConfig::default()
        };
        assert!(cache.max_age().is_none());
        assert_eq!(
            CacheConfig::default().max_age(),
            Some(Duration::from_secs(86400))
        );
    }
}
