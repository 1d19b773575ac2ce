//! Adaptive controller (the monitor process)

pub mod device_info;
pub mod feedback;
pub mod monitor;
pub mod nvml;

pub use device_info::DeviceInfo;
pub use feedback::FeedbackController;
pub use monitor::Monitor;
pub use nvml::{NvmlLib, UtilizationSource};
