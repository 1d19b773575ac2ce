//! cgroup identity
//!
//! The short cgroup id scopes token regions and lets the monitor match NVML
//! samples to its container. It is the last path segment of the process's
//! device cgroup (v1) or unified cgroup (v2), with container runtime
//! decorations removed, truncated to 15 characters.

use crate::error::GovernorError;

/// Longest id kept, matching the shm naming scheme
pub const MAX_CGROUP_ID_LEN: usize = 15;

const RUNTIME_PREFIXES: &[&str] = &["docker-", "cri-containerd-", "crio-"];

/// Extract the short id from the contents of `/proc/<pid>/cgroup`
pub fn parse_cgroup_id(content: &str) -> Option<String> {
    let v1 = content.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let (_, controllers, path) = (fields.next()?, fields.next()?, fields.next()?);
        controllers
            .split(',')
            .any(|c| c == "devices")
            .then_some(path)
    });
    let v2 = || {
        content
            .lines()
            .find_map(|line| line.strip_prefix("0::"))
    };

    short_id(v1.or_else(v2)?)
}

fn short_id(path: &str) -> Option<String> {
    let mut segment = path.trim().rsplit('/').next()?;
    for prefix in RUNTIME_PREFIXES {
        if let Some(rest) = segment.strip_prefix(prefix) {
            segment = rest;
            break;
        }
    }
    let segment = segment.strip_suffix(".scope").unwrap_or(segment);
    if segment.is_empty() {
        return None;
    }
    Some(segment.chars().take(MAX_CGROUP_ID_LEN).collect())
}

/// Short cgroup id of a running process
pub fn cgroup_id(pid: u32) -> Result<String, GovernorError> {
    let content = std::fs::read_to_string(format!("/proc/{}/cgroup", pid))?;
    parse_cgroup_id(&content).ok_or(GovernorError::CgroupNotFound(pid))
}

/// Resolves a process's cgroup id
///
/// The monitor resolves every sampled pid through this seam, so tests can
/// substitute a fixed table.
pub trait CgroupResolver {
    fn cgroup_id(&self, pid: u32) -> Option<String>;
}

/// Reads `/proc/<pid>/cgroup`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcCgroups;

impl CgroupResolver for ProcCgroups {
    fn cgroup_id(&self, pid: u32) -> Option<String> {
        cgroup_id(pid)
            .map_err(|e| log::trace!("pid {}: {}", pid, e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_devices_line() {
        let content = "\
12:memory:/kubepods/besteffort/pod59760328/5680af4f12fc9a331866222e5446b51a
4:devices:/kubepods/besteffort/pod59760328-93c1-464e-a944-7f6801c299d6/5680af4f12fc9a331866222e5446b51a0bf358334418d089916996a672b27346
1:name=systemd:/init.scope
";
        assert_eq!(parse_cgroup_id(content).unwrap(), "5680af4f12fc9a3");
    }

    #[test]
    fn test_parse_v2_unified_line() {
        let content = "0::/system.slice/docker-0123456789abcdef0123.scope\n";
        assert_eq!(parse_cgroup_id(content).unwrap(), "0123456789abcde");

        let content = "0::/kubepods.slice/cri-containerd-abc123.scope\n";
        assert_eq!(parse_cgroup_id(content).unwrap(), "abc123");
    }

    #[test]
    fn test_v1_wins_over_v2() {
        let content = "5:cpu,devices:/a/deadbeef\n0::/b/cafebabe\n";
        assert_eq!(parse_cgroup_id(content).unwrap(), "deadbeef");
    }

    #[test]
    fn test_root_cgroup_has_no_id() {
        assert!(parse_cgroup_id("0::/\n").is_none());
        assert!(parse_cgroup_id("").is_none());
    }

    #[test]
    fn test_own_cgroup_readable() {
        // Whatever the host layout, reading our own entry must not error
        // with an IO failure.
        let result = cgroup_id(std::process::id());
        assert!(!matches!(result, Err(GovernorError::Io(_))));
    }
}
