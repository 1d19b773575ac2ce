//! cudagov - GPU memory and compute governor for CUDA processes
//!
//! This library holds everything behind the preload shim and the monitor
//! binary: symbol interposition, ioctl-level memory accounting, the launch
//! token bucket, the shared memory regions that tie processes together, and
//! the adaptive controller that tunes the launch rate.
//!
//! # Modules
//!
//! - [`hook`]: Loader bootstrap, hook table and interception engine
//! - [`memory`]: Memory accounting over resource-manager ioctls
//! - [`throttle`]: Kernel launch token bucket and refill loop
//! - [`shm`]: Shared memory regions and their initialization protocol
//! - [`controller`]: Adaptive controller run by the monitor
//! - [`governor`]: Per-process governor tying the halves together
//! - [`config`]: Configuration system
//! - [`domain`]: Domain models with validation
//! - [`error`]: Error types

pub mod cgroup;
pub mod cli;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod governor;
pub mod hook;
pub mod logging;
pub mod memory;
pub mod nvos;
pub mod shm;
pub mod throttle;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{GovernorError, Result};
pub use governor::Governor;
