//! Configuration system
//!
//! Limits come from the environment (see [`env`]); tunables come from an
//! optional TOML file, overridden by environment and CLI values.

pub mod builder;
pub mod env;
pub mod file;

pub use builder::ConfigBuilder;
pub use env::Limits;
pub use file::ConfigFile;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Token refill settings for hooked processes
    pub throttle: ThrottleConfig,
    /// Shared memory naming
    pub shm: ShmConfig,
    /// Adaptive controller settings
    pub monitor: MonitorConfig,
}

/// Token refill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Interval between token refills, in milliseconds
    pub wait_interval_ms: u64,
    /// Initialize the token region locally instead of waiting for a monitor
    pub standalone: bool,
    /// How long to wait for another process to finish laying out a region
    pub ready_timeout_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            wait_interval_ms: 100,
            standalone: false,
            ready_timeout_ms: 5000,
        }
    }
}

impl ThrottleConfig {
    /// Refill interval as a duration
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }

    /// Layout readiness timeout as a duration
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Shared memory naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Prefix of every shm object name, must start with '/'
    pub prefix: String,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            prefix: "/cuda_hook".to_string(),
        }
    }
}

impl ShmConfig {
    /// Name of the token region for a minor and cgroup
    pub fn token_path(&self, minor: u32, cgroup_id: &str) -> String {
        format!("{}.{:x}.{}", self.prefix, minor, cgroup_id)
    }

    /// Name of the memory accounting region for a minor
    pub fn fb_path(&self, minor: u32) -> String {
        format!("{}.fb.{:x}", self.prefix, minor)
    }
}

/// Adaptive controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Polling cadence in milliseconds
    pub interval_ms: u64,
    /// Length of the bootstrap window and of each retune period, in seconds
    pub sample_window_secs: u64,
    /// Ramp add_per_cycle by one per tick while it is at or below this value
    pub bootstrap_max_rate: i32,
    /// Capacity of the utilization sample buffer
    pub max_samples: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            sample_window_secs: 5,
            bootstrap_max_rate: 3,
            max_samples: 200,
        }
    }
}

impl MonitorConfig {
    /// Polling cadence as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Number of ticks in one sample window
    pub fn sample_ticks(&self) -> i32 {
        let per_sec = (1000 / self.interval_ms.clamp(1, 1000)) as i32;
        (per_sec * self.sample_window_secs as i32).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.throttle.wait_interval_ms, 100);
        assert!(!config.throttle.standalone);
        assert_eq!(config.monitor.sample_ticks(), 50);
    }

    #[test]
    fn test_shm_paths() {
        let shm = ShmConfig::default();
        assert_eq!(shm.token_path(10, "5680af4f12fc9a3"), "/cuda_hook.a.5680af4f12fc9a3");
        assert_eq!(shm.fb_path(0), "/cuda_hook.fb.0");
    }

    #[test]
    fn test_sample_ticks_follow_interval() {
        let monitor = MonitorConfig {
            interval_ms: 250,
            ..Default::default()
        };
        assert_eq!(monitor.sample_ticks(), 20);
    }
}
