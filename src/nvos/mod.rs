//! NVIDIA resource-manager wire format
//!
//! The governor decodes, but does not define, the driver's ioctl protocol.
//! This module holds the request encoding and the parameter block layouts
//! it needs to read allocation sizes and rewrite memory info replies.

pub mod escape;
pub mod params;

pub use escape::{IoctlRequest, NVIDIA_CTL_MINOR, NVIDIA_DEVICE_MAJOR};
pub use params::NvHandle;
