//! CLI argument definitions using clap derive
//!
//! `cudagov-monitor <minor> <cgroup-id> <core-limit>`

use crate::cgroup::MAX_CGROUP_ID_LEN;
use crate::domain::CoreLimit;

use clap::Parser;

/// Adaptive compute governor for one cgroup
///
/// Tunes the kernel launch rate of the cgroup's CUDA processes so their SM
/// utilization tracks the core limit.
#[derive(Parser, Debug)]
#[command(name = "cudagov-monitor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// GPU minor number (/dev/nvidia<minor>)
    pub minor: u32,

    /// Short cgroup id of the governed container
    #[arg(value_parser = parse_cgroup_id)]
    pub cgroup_id: String,

    /// Target SM utilization in percent
    #[arg(value_parser = clap::value_parser!(u32).range(1..=100))]
    pub core_limit: u32,

    /// Polling interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Path to configuration file
    #[arg(short, long, env = "CUDAGOV_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Limit this monitor enforces
    pub fn limit(&self) -> CoreLimit {
        CoreLimit::new(self.minor, self.core_limit)
    }
}

fn parse_cgroup_id(value: &str) -> Result<String, String> {
    if value.is_empty() {
        return Err("cgroup id must not be empty".to_string());
    }
    if value.contains('/') {
        return Err("cgroup id must be a single path segment".to_string());
    }
    if value.chars().count() > MAX_CGROUP_ID_LEN {
        log::warn!(
            "cgroup id {} truncated to {} characters",
            value,
            MAX_CGROUP_ID_LEN
        );
    }
    Ok(value.chars().take(MAX_CGROUP_ID_LEN).collect())
}
