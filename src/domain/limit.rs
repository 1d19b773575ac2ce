//! Limit domain types
//!
//! Provides validated types for per-device memory and compute limits.
//! Both are written as `<minor>=<value>`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory ceiling for one GPU minor, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// GPU minor number the limit applies to
    pub minor: u32,
    /// Ceiling in bytes
    pub bytes: u64,
}

impl MemoryLimit {
    /// Create a new memory limit
    pub const fn new(minor: u32, bytes: u64) -> Self {
        Self { minor, bytes }
    }

    /// Parse a `<minor>=<size>` specifier, size with optional IEC suffix
    pub fn parse(key: &str, spec: &str) -> Result<Self, ConfigError> {
        let (minor, value) = split_spec(key, spec)?;
        let bytes = iec_to_bytes(value).ok_or_else(|| ConfigError::InvalidLimit {
            key: key.to_string(),
            message: format!("invalid size '{}'", value),
        })?;
        Ok(Self { minor, bytes })
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} MiB", self.minor, self.bytes >> 20)
    }
}

/// Compute ceiling for one GPU minor, as a utilization target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreLimit {
    /// GPU minor number the limit applies to
    pub minor: u32,
    /// Target utilization / token count
    pub limit: u32,
}

impl CoreLimit {
    /// Create a new core limit
    pub const fn new(minor: u32, limit: u32) -> Self {
        Self { minor, limit }
    }

    /// Parse a `<minor>=<integer>` specifier
    pub fn parse(key: &str, spec: &str) -> Result<Self, ConfigError> {
        let (minor, value) = split_spec(key, spec)?;
        let limit = value.parse::<u32>().map_err(|_| ConfigError::InvalidLimit {
            key: key.to_string(),
            message: format!("invalid core limit '{}'", value),
        })?;
        Ok(Self { minor, limit })
    }
}

impl fmt::Display for CoreLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.minor, self.limit)
    }
}

fn split_spec<'a>(key: &str, spec: &'a str) -> Result<(u32, &'a str), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidLimit {
        key: key.to_string(),
        message,
    };

    let (minor, value) = spec
        .trim()
        .split_once('=')
        .ok_or_else(|| invalid("missing '='".to_string()))?;
    let minor = minor
        .trim()
        .parse::<u32>()
        .map_err(|_| invalid(format!("invalid minor '{}'", minor)))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid("empty value".to_string()));
    }
    Ok((minor, value))
}

/// Convert a size such as `1G`, `512m` or `1.5GiB` to bytes
///
/// Only the first character after the number selects the unit; a bare number
/// is taken as bytes.
pub fn iec_to_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: u64 = match suffix.chars().next() {
        None => 1,
        Some('K' | 'k') => 1 << 10,
        Some('M' | 'm') => 1 << 20,
        Some('G' | 'g') => 1 << 30,
        Some('T' | 't') => 1 << 40,
        Some(_) => return None,
    };

    Some((number * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iec_to_bytes() {
        assert_eq!(iec_to_bytes("1024"), Some(1024));
        assert_eq!(iec_to_bytes("4k"), Some(4096));
        assert_eq!(iec_to_bytes("1G"), Some(1 << 30));
        assert_eq!(iec_to_bytes("1.5g"), Some(3 << 29));
        assert_eq!(iec_to_bytes("2Gi"), Some(2 << 30));
        assert_eq!(iec_to_bytes("1T"), Some(1 << 40));
        assert_eq!(iec_to_bytes("12x"), None);
        assert_eq!(iec_to_bytes("G"), None);
    }

    #[test]
    fn test_memory_limit_parse() {
        let limit = MemoryLimit::parse("CUDA_MEM_LIMIT", "0=1G").unwrap();
        assert_eq!(limit, MemoryLimit::new(0, 1 << 30));

        let limit = MemoryLimit::parse("CUDA_MEM_LIMIT", " 3 = 512M ").unwrap();
        assert_eq!(limit.minor, 3);
        assert_eq!(limit.bytes, 512 << 20);
    }

    #[test]
    fn test_memory_limit_rejects_malformed() {
        assert!(MemoryLimit::parse("CUDA_MEM_LIMIT", "1G").is_err());
        assert!(MemoryLimit::parse("CUDA_MEM_LIMIT", "0=").is_err());
        assert!(MemoryLimit::parse("CUDA_MEM_LIMIT", "x=1G").is_err());
    }

    #[test]
    fn test_core_limit_parse() {
        let limit = CoreLimit::parse("CUDA_CORE_LIMIT", "0=10").unwrap();
        assert_eq!(limit, CoreLimit::new(0, 10));
        assert_eq!(limit.to_string(), "0=10");

        assert!(CoreLimit::parse("CUDA_CORE_LIMIT", "0=ten").is_err());
    }
}
