//! Startup description of the governed device
//!
//! Gathered once through nvml-wrapper when the monitor starts and logged, so
//! an operator can tell which physical GPU a monitor is tuning.

use crate::error::NvmlError;

use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::{Device, Nvml};
use std::fmt;

/// Static facts about one GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// NVML enumeration index
    pub index: u32,
    /// Character device minor (`/dev/nvidia<minor>`)
    pub minor: u32,
    pub name: String,
    pub uuid: String,
    /// Framebuffer size in bytes
    pub memory_total: u64,
    /// Framebuffer bytes free at startup
    pub memory_free: u64,
    /// Graphics clock in MHz at startup
    pub graphics_clock_mhz: Option<u32>,
    /// Maximum customer boost graphics clock in MHz
    pub max_boost_mhz: Option<u32>,
}

impl DeviceInfo {
    /// Look up the device whose minor number is `minor`
    ///
    /// Falls back to enumeration index `minor` when the driver does not
    /// report minor numbers.
    pub fn query(minor: u32) -> Result<Self, NvmlError> {
        let nvml = Nvml::init().map_err(|e| match e {
            nvml_wrapper::error::NvmlError::LibloadingError(_) => NvmlError::LibraryNotFound,
            nvml_wrapper::error::NvmlError::DriverNotLoaded => {
                NvmlError::InitializationFailed("NVIDIA driver not loaded".to_string())
            }
            other => NvmlError::InitializationFailed(other.to_string()),
        })?;

        let count = nvml
            .device_count()
            .map_err(|e| NvmlError::Unknown(e.to_string()))?;
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            if device.minor_number().ok() == Some(minor) {
                return Self::from_device(&device, index, minor);
            }
        }

        let device = nvml.device_by_index(minor).map_err(|e| match e {
            nvml_wrapper::error::NvmlError::NotFound
            | nvml_wrapper::error::NvmlError::InvalidArg => NvmlError::DeviceNotFound(minor),
            other => NvmlError::Unknown(other.to_string()),
        })?;
        Self::from_device(&device, minor, minor)
    }

    fn from_device(device: &Device<'_>, index: u32, minor: u32) -> Result<Self, NvmlError> {
        let convert = |e: nvml_wrapper::error::NvmlError| match e {
            nvml_wrapper::error::NvmlError::NotSupported => {
                NvmlError::NotSupported("Operation not supported by this GPU".to_string())
            }
            other => NvmlError::Unknown(other.to_string()),
        };

        let memory = device.memory_info().map_err(convert)?;
        Ok(Self {
            index,
            minor,
            name: device.name().map_err(convert)?,
            uuid: device.uuid().map_err(convert)?,
            memory_total: memory.total,
            memory_free: memory.free,
            graphics_clock_mhz: device.clock_info(Clock::Graphics).ok(),
            max_boost_mhz: device.max_customer_boost_clock(Clock::Graphics).ok(),
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mhz = |v: Option<u32>| v.map_or_else(|| "n/a".to_string(), |v| format!("{} MHz", v));
        write!(
            f,
            "GPU {} ({}) minor {}: {}, {} MiB total, {} MiB free, clock {} / {}",
            self.index,
            self.uuid,
            self.minor,
            self.name,
            self.memory_total >> 20,
            self.memory_free >> 20,
            mhz(self.graphics_clock_mhz),
            mhz(self.max_boost_mhz)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let info = DeviceInfo {
            index: 0,
            minor: 2,
            name: "Mock GPU".to_string(),
            uuid: "GPU-MOCK-0000".to_string(),
            memory_total: 8 << 30,
            memory_free: 6 << 30,
            graphics_clock_mhz: Some(1410),
            max_boost_mhz: None,
        };
        assert_eq!(
            info.to_string(),
            "GPU 0 (GPU-MOCK-0000) minor 2: Mock GPU, 8192 MiB total, 6144 MiB free, \
             clock 1410 MHz / n/a"
        );
    }

    #[test]
    #[ignore = "Requires NVIDIA GPU"]
    fn test_query_first_device() {
        let info = DeviceInfo::query(0).unwrap();
        assert!(info.memory_total > 0);
    }
}
