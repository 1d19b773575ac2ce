//! Exported `dlsym` and `ioctl`
//!
//! These shadow the libc definitions for every module loaded after us.
//! `dlsym` needs its caller's return address to answer `RTLD_NEXT` for the
//! caller rather than for this library, so on the supported architectures it
//! is a naked trampoline that passes the return address as a third argument.

use crate::cuda::hooks;
use crate::{governor_ready, loader};

use cudagov::hook::{resolve, DriverIo, RealDriver};

use std::ffi::{c_char, c_int, c_ulong, c_void};

#[cfg(target_arch = "x86_64")]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn dlsym(_handle: *mut c_void, _symbol: *const c_char) -> *mut c_void {
    std::arch::naked_asm!(
        "mov rdx, [rsp]",
        "jmp {resolve}",
        resolve = sym dlsym_from,
    )
}

#[cfg(target_arch = "aarch64")]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn dlsym(_handle: *mut c_void, _symbol: *const c_char) -> *mut c_void {
    std::arch::naked_asm!(
        "mov x2, x30",
        "b {resolve}",
        resolve = sym dlsym_from,
    )
}

/// Without a trampoline, `RTLD_NEXT` is anchored to this library
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[no_mangle]
pub unsafe extern "C" fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
    dlsym_from(handle, symbol, dlsym_from as *const c_void)
}

unsafe extern "C" fn dlsym_from(
    handle: *mut c_void,
    symbol: *const c_char,
    caller: *const c_void,
) -> *mut c_void {
    resolve(loader(), hooks(), handle, symbol, caller)
}

/// `ioctl(2)` with memory accounting for NVIDIA resource-manager escapes
///
/// Declared with a fixed third argument: every caller passes either a
/// pointer or nothing, and both land in the same register. Calls made while
/// the governor is still being built go straight to the driver.
#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, args: *mut c_void) -> c_int {
    let driver = RealDriver::new(loader().ioctl());
    match governor_ready() {
        Some(governor) => governor.ioctl(&driver, fd, request, args),
        None => driver.ioctl(fd, request, args),
    }
}
