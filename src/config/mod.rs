pub mod defaults;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub cache: CacheConfig,
    pub request: RequestConfig,
    pub logging: LoggingConfig,
}

/// Time window cache tuning. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub polled_entry_age_out_secs: u64,
    pub slow_query_entry_age_out_secs: u64,
    pub max_truncated_entry_age_secs: u64,
    pub poll_loop_interval_secs: u64,
    pub poll_query_interval_secs: u64,
    pub data_settle_time_secs: u64,
    pub max_aggregated_records: usize,
    pub prefetch: bool,
    pub prefetch_clusters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_secs: u64,
    pub default_from: String,
    pub default_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn get_default_config_path() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("service-graph").join("config.toml")
    }

    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = config_path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            toml::from_str(&config_str).with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            let default_path = Self::get_default_config_path();
            if default_path.exists() {
                let config_str = std::fs::read_to_string(&default_path)
                    .with_context(|| format!("Failed to read config file: {}", default_path.display()))?;
                toml::from_str(&config_str)
                    .with_context(|| format!("Failed to parse config file: {}", default_path.display()))?
            } else {
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(anyhow::anyhow!("Cache max entries must be greater than 0"));
        }

        if self.cache.poll_loop_interval_secs == 0 || self.cache.poll_query_interval_secs == 0 {
            return Err(anyhow::anyhow!("Cache poll intervals must be greater than 0"));
        }

        if self.cache.max_aggregated_records == 0 {
            return Err(anyhow::anyhow!("Max aggregated records must be greater than 0"));
        }

        if self.request.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        if !SUPPORTED_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Unsupported log level '{}', expected one of {}",
                self.logging.level,
                SUPPORTED_LOG_LEVELS.join(", ")
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn polled_entry_age_out(&self) -> Duration {
        Duration::from_secs(self.polled_entry_age_out_secs)
    }

    pub fn slow_query_entry_age_out(&self) -> Duration {
        Duration::from_secs(self.slow_query_entry_age_out_secs)
    }

    pub fn max_truncated_entry_age(&self) -> Duration {
        Duration::from_secs(self.max_truncated_entry_age_secs)
    }

    pub fn poll_loop_interval(&self) -> Duration {
        Duration::from_secs(self.poll_loop_interval_secs)
    }

    pub fn poll_query_interval(&self) -> Duration {
        Duration::from_secs(self.poll_query_interval_secs)
    }

    pub fn data_settle_time(&self) -> Duration {
        Duration::from_secs(self.data_settle_time_secs)
    }

    /// Clusters warmed at startup. Falls back to the default cluster.
    pub fn prefetch_clusters(&self) -> Vec<String> {
        if self.prefetch_clusters.is_empty() {
            vec![DEFAULT_CLUSTER.to_string()]
        } else {
            self.prefetch_clusters.clone()
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            polled_entry_age_out_secs: DEFAULT_POLLED_ENTRY_AGE_OUT_SECS,
            slow_query_entry_age_out_secs: DEFAULT_SLOW_QUERY_ENTRY_AGE_OUT_SECS,
            max_truncated_entry_age_secs: DEFAULT_MAX_TRUNCATED_ENTRY_AGE_SECS,
            poll_loop_interval_secs: DEFAULT_POLL_LOOP_INTERVAL_SECS,
            poll_query_interval_secs: DEFAULT_POLL_QUERY_INTERVAL_SECS,
            data_settle_time_secs: DEFAULT_DATA_SETTLE_TIME_SECS,
            max_aggregated_records: DEFAULT_MAX_AGGREGATED_RECORDS,
            prefetch: false,
            prefetch_clusters: Vec::new(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            default_from: DEFAULT_REQUEST_FROM.to_string(),
            default_to: DEFAULT_REQUEST_TO.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: DEFAULT_LOG_LEVEL.to_string(), file: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nmax_entries = 4\nprefetch_clusters = [\"east\"]\n\n[logging]\nlevel = \"debug\"").unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache.max_entries, 4);
        assert_eq!(config.cache.poll_query_interval(), Duration::from_secs(DEFAULT_POLL_QUERY_INTERVAL_SECS));
        assert_eq!(config.cache.prefetch_clusters(), vec!["east".to_string()]);
        assert_eq!(config.request.timeout(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.prefetch_clusters(), vec![DEFAULT_CLUSTER.to_string()]);

        config.cache.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported log level 'loud'"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read config file"));
    }
}
