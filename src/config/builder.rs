//! Configuration builder
//!
//! Merges configuration from files, the environment and CLI arguments.

use crate::config::env::{CUDAGOV_CONFIG, CUDAGOV_STANDALONE};
use crate::config::{Config, ConfigFile};

/// Builder for merging configuration sources
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Load the named tunables file, or the system-wide one
    pub fn with_file(mut self, path: Option<&str>) -> Self {
        if let Some(cfg) = ConfigFile::load_located(path) {
            self.config = cfg;
        }
        self
    }

    /// Load the file named by `CUDAGOV_CONFIG`, or the system-wide one
    pub fn with_env_file(self) -> Self {
        let path = std::env::var(CUDAGOV_CONFIG).ok();
        self.with_file(path.as_deref())
    }

    /// Apply environment overrides
    pub fn with_env(self) -> Self {
        let standalone = std::env::var(CUDAGOV_STANDALONE)
            .ok()
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"));
        self.with_standalone(standalone)
    }

    /// Override standalone token initialization
    pub fn with_standalone(mut self, standalone: Option<bool>) -> Self {
        if let Some(s) = standalone {
            self.config.throttle.standalone = s;
        }
        self
    }

    /// Override the monitor polling interval
    pub fn with_monitor_interval(mut self, interval_ms: Option<u64>) -> Self {
        if let Some(i) = interval_ms {
            self.config.monitor.interval_ms = i;
        }
        self
    }

    /// Override the token refill interval
    pub fn with_wait_interval(mut self, interval_ms: Option<u64>) -> Self {
        if let Some(i) = interval_ms {
            self.config.throttle.wait_interval_ms = i;
        }
        self
    }

    /// Override the shm name prefix
    pub fn with_shm_prefix(mut self, prefix: Option<String>) -> Self {
        if let Some(p) = prefix {
            self.config.shm.prefix = p;
        }
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new().build();
        assert!(!config.throttle.standalone);
        assert_eq!(config.monitor.interval_ms, 100);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ConfigBuilder::new()
            .with_standalone(Some(true))
            .with_monitor_interval(Some(200))
            .with_wait_interval(Some(20))
            .with_shm_prefix(Some("/test_gov".to_string()))
            .build();

        assert!(config.throttle.standalone);
        assert_eq!(config.monitor.interval_ms, 200);
        assert_eq!(config.throttle.wait_interval_ms, 20);
        assert_eq!(config.shm.fb_path(1), "/test_gov.fb.1");
    }

    #[test]
    fn test_file_then_overrides() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[throttle]\nwait_interval_ms = 40\nstandalone = false").unwrap();

        let config = ConfigBuilder::new()
            .with_file(file.path().to_str())
            .with_standalone(Some(true))
            .build();
        assert_eq!(config.throttle.wait_interval_ms, 40);
        assert!(config.throttle.standalone);
    }

    #[test]
    fn test_builder_none_keeps_values() {
        let config = ConfigBuilder::new()
            .with_standalone(None)
            .with_monitor_interval(None)
            .build();
        assert!(!config.throttle.standalone);
        assert_eq!(config.monitor.interval_ms, 100);
    }
}
