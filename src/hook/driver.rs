//! Access to the real NVIDIA device files
//!
//! The interception engine only needs two things from the outside world:
//! which device a descriptor refers to and the real `ioctl`. Both sit behind
//! [`DriverIo`] so the engine can be driven by a scripted driver in tests.

use crate::hook::loader::IoctlFn;

use nix::sys::stat::{fstat, major, minor, SFlag};
use std::ffi::{c_int, c_ulong, c_void};

/// Device identity and the real ioctl entry point
pub trait DriverIo {
    /// `(major, minor)` of the character device behind `fd`
    fn device_number(&self, fd: c_int) -> Option<(u32, u32)>;

    /// Forward to the driver
    ///
    /// # Safety
    /// Same contract as `ioctl(2)` for `request`.
    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, args: *mut c_void) -> c_int;
}

/// The kernel driver, reached through the bootstrapped `ioctl`
#[derive(Debug, Clone, Copy)]
pub struct RealDriver {
    ioctl: IoctlFn,
}

impl RealDriver {
    pub fn new(ioctl: IoctlFn) -> Self {
        Self { ioctl }
    }
}

impl DriverIo for RealDriver {
    fn device_number(&self, fd: c_int) -> Option<(u32, u32)> {
        let st = fstat(fd).ok()?;
        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFCHR {
            return None;
        }
        Some((major(st.st_rdev) as u32, minor(st.st_rdev) as u32))
    }

    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, args: *mut c_void) -> c_int {
        (self.ioctl)(fd, request, args)
    }
}
