//! Unified error types for cudagov
//!
//! This module defines all error types used throughout the governor and the
//! monitor. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Top-level governor error type
#[derive(Error, Debug)]
pub enum GovernorError {
    /// Error from NVML operations
    #[error("NVML error: {0}")]
    Nvml(#[from] NvmlError),

    /// Error from configuration parsing/validation
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error from shared memory setup
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),

    /// Error from the compute throttle
    #[error("Throttle error: {0}")]
    Throttle(#[from] ThrottleError),

    /// Loader symbols required for interception are missing
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// The cgroup of a process could not be determined
    #[error("Cannot determine cgroup id of pid {0}")]
    CgroupNotFound(u32),

    /// Failed to start the token refill thread
    #[error("Failed to spawn refill thread: {0}")]
    Spawn(std::io::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the NVML binding used by the monitor
#[derive(Error, Debug)]
pub enum NvmlError {
    /// NVML library not found
    #[error("NVML library not found. Is the NVIDIA driver installed?")]
    LibraryNotFound,

    /// A required entry point is missing from the library
    #[error("NVML entry point not available: {0}")]
    SymbolMissing(String),

    /// Failed to initialize NVML library
    #[error("Failed to initialize NVML: {0}")]
    InitializationFailed(String),

    /// An NVML call returned a non-success code
    #[error("{func} failed with NVML error code {code}")]
    Call { func: &'static str, code: u32 },

    /// No device exposes the requested minor number
    #[error("GPU device not found for minor {0}")]
    DeviceNotFound(u32),

    /// No samples newer than the requested timestamp
    #[error("No utilization samples since last poll")]
    NoSamples,

    /// Operation not supported by this GPU
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Unknown NVML error
    #[error("NVML error: {0}")]
    Unknown(String),
}

/// Errors from configuration parsing and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// A limit specifier is malformed
    #[error("Invalid limit in {key}: {message}")]
    InvalidLimit { key: String, message: String },

    /// Invalid config value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors from POSIX shared memory regions and their primitives
#[derive(Error, Debug)]
pub enum ShmError {
    /// shm_open failed
    #[error("Failed to open shared memory {name}: {source}")]
    Open { name: String, source: nix::Error },

    /// Sizing the region failed
    #[error("Failed to size shared memory {name}: {source}")]
    Truncate { name: String, source: nix::Error },

    /// Mapping the region failed
    #[error("Failed to map shared memory {name}: {source}")]
    Map { name: String, source: nix::Error },

    /// The creator never finished laying out the region
    #[error("Shared memory {0} was not initialized in time")]
    NotReady(String),

    /// A process-shared semaphore operation failed
    #[error("Semaphore operation failed: {0}")]
    Semaphore(nix::Error),

    /// The region name is not a valid shm path
    #[error("Invalid shared memory name: {0}")]
    InvalidName(String),
}

/// Errors from the compute throttle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    /// The token semaphore lock was poisoned by a panicking holder
    #[error("Token semaphore is poisoned")]
    Poisoned,
}

/// Errors from resolving loader entry points before interception starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// A loader function was not found in any loaded module
    #[error("Loader symbol not found: {0}")]
    SymbolNotFound(&'static str),
}

/// Result type alias using GovernorError
pub type Result<T> = std::result::Result<T, GovernorError>;
