//! Utilization domain types
//!
//! Types for per-process GPU utilization samples as reported by the driver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One per-process utilization sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSample {
    /// Process ID
    pub pid: u32,
    /// Sample timestamp in microseconds since the Unix epoch
    pub timestamp_us: u64,
    /// SM (compute) utilization percentage
    pub sm_util: u32,
    /// Memory controller utilization percentage
    pub mem_util: u32,
}

impl ProcessSample {
    /// Create a new sample
    pub fn new(pid: u32, timestamp_us: u64, sm_util: u32) -> Self {
        Self {
            pid,
            timestamp_us,
            sm_util,
            mem_util: 0,
        }
    }

    /// Whether this sample was taken at or after `last_seen_us`
    pub fn is_fresh(&self, last_seen_us: u64) -> bool {
        self.timestamp_us >= last_seen_us
    }
}

impl fmt::Display for ProcessSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PID {}: sm {}% mem {}% @{}",
            self.pid, self.sm_util, self.mem_util, self.timestamp_us
        )
    }
}
