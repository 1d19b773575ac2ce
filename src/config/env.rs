//! Limit configuration from the environment
//!
//! `CUDA_MEM_LIMIT=<minor>=<size>` and `CUDA_CORE_LIMIT=<minor>=<tokens>`.
//! A missing or malformed variable disables that half of the governor.

use crate::domain::{CoreLimit, MemoryLimit};

/// Environment variable carrying the memory limit
pub const CUDA_MEM_LIMIT: &str = "CUDA_MEM_LIMIT";

/// Environment variable carrying the compute limit
pub const CUDA_CORE_LIMIT: &str = "CUDA_CORE_LIMIT";

/// Environment variable naming the tunables file
pub const CUDAGOV_CONFIG: &str = "CUDAGOV_CONFIG";

/// Environment variable forcing standalone token initialization
pub const CUDAGOV_STANDALONE: &str = "CUDAGOV_STANDALONE";

/// Limits that apply to this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    /// Memory ceiling, if memory governance is enabled
    pub memory: Option<MemoryLimit>,
    /// Compute ceiling, if compute governance is enabled
    pub core: Option<CoreLimit>,
}

impl Limits {
    /// Read limits from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read limits through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let memory = match lookup(CUDA_MEM_LIMIT) {
            Some(spec) => MemoryLimit::parse(CUDA_MEM_LIMIT, &spec)
                .map_err(|e| log::warn!("{}", e))
                .ok(),
            None => {
                log::debug!("env {} not found", CUDA_MEM_LIMIT);
                None
            }
        };

        let core = match lookup(CUDA_CORE_LIMIT) {
            Some(spec) => CoreLimit::parse(CUDA_CORE_LIMIT, &spec)
                .map_err(|e| log::warn!("{}", e))
                .ok(),
            None => {
                log::debug!("env {} not found", CUDA_CORE_LIMIT);
                None
            }
        };

        Self { memory, core }
    }

    /// Whether any governance is active
    pub fn any(&self) -> bool {
        self.memory.is_some() || self.core.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_both_limits() {
        let limits = Limits::from_lookup(lookup(&[
            (CUDA_MEM_LIMIT, "0=1G"),
            (CUDA_CORE_LIMIT, "0=10"),
        ]));
        assert_eq!(limits.memory, Some(MemoryLimit::new(0, 1 << 30)));
        assert_eq!(limits.core, Some(CoreLimit::new(0, 10)));
        assert!(limits.any());
    }

    #[test]
    fn test_absent_limits_disable_governance() {
        let limits = Limits::from_lookup(lookup(&[]));
        assert_eq!(limits, Limits::default());
        assert!(!limits.any());
    }

    #[test]
    fn test_malformed_limit_disables_only_that_half() {
        let limits = Limits::from_lookup(lookup(&[
            (CUDA_MEM_LIMIT, "garbage"),
            (CUDA_CORE_LIMIT, "1=30"),
        ]));
        assert!(limits.memory.is_none());
        assert_eq!(limits.core, Some(CoreLimit::new(1, 30)));
    }
}
