//! Interception engine
//!
//! Symbol resolution and the ioctl path of the preload library. The exported
//! functions in the shim are thin wrappers around these.

use crate::hook::driver::DriverIo;
use crate::hook::entry::HookTable;
use crate::hook::loader::LoaderSymbols;
use crate::memory::{Admission, MemoryGovernor};
use crate::nvos::{IoctlRequest, NVIDIA_DEVICE_MAJOR};
use crate::nvos::escape::NV_IOCTL_MAGIC;

use std::ffi::{c_char, c_int, c_ulong, c_void, CStr};

/// Resolve a symbol for the application
///
/// `caller` is the application's return address; it anchors `RTLD_NEXT`
/// lookups to the application's module. Governed names come back as our
/// hook, with the real address recorded on the way.
///
/// # Safety
/// `symbol` must be a valid C string; `handle` any value `dlsym` accepts.
pub unsafe fn resolve(
    loader: &LoaderSymbols,
    hooks: &HookTable,
    handle: *mut c_void,
    symbol: *const c_char,
    caller: *const c_void,
) -> *mut c_void {
    let real = if handle == libc::RTLD_NEXT {
        loader.next_symbol(caller, symbol)
    } else {
        loader.dlsym(handle, symbol)
    };
    if symbol.is_null() {
        return real;
    }
    match CStr::from_ptr(symbol).to_str() {
        Ok(name) => hooks.intercept(name, real),
        Err(_) => real,
    }
}

/// Substitute the result of a proc-address lookup in place
///
/// # Safety
/// `symbol` must be a valid C string and `pfn` null or writable.
pub unsafe fn patch_proc_address(
    hooks: &HookTable,
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    flags: u64,
) {
    if symbol.is_null() || pfn.is_null() {
        return;
    }
    let Ok(name) = CStr::from_ptr(symbol).to_str() else {
        return;
    };
    *pfn = hooks.intercept_proc(name, flags, *pfn);
}

/// Account one ioctl around the real call
///
/// Requests that are not resource-manager escapes on an NVIDIA device are
/// forwarded untouched. A rejected allocation never reaches the driver: the
/// ioctl itself succeeds and the failure travels in the parameter block.
///
/// # Safety
/// Same contract as `ioctl(2)` for `request` and `args`.
pub unsafe fn intercept_ioctl<D: DriverIo + ?Sized>(
    memory: Option<&MemoryGovernor>,
    driver: &D,
    fd: c_int,
    request: c_ulong,
    args: *mut c_void,
) -> c_int {
    let Some(memory) = memory else {
        return driver.ioctl(fd, request, args);
    };

    let req = IoctlRequest::decode(request as u64);
    if req.kind != NV_IOCTL_MAGIC || !req.is_governed() {
        return driver.ioctl(fd, request, args);
    }
    let minor = match driver.device_number(fd) {
        Some((NVIDIA_DEVICE_MAJOR, minor)) => minor,
        _ => return driver.ioctl(fd, request, args),
    };

    let admission = memory.pre_ioctl(minor, &req, args);
    if admission == Admission::Reject {
        return 0;
    }

    let ret = driver.ioctl(fd, request, args);
    if ret == 0 {
        memory.post_ioctl(minor, &req, args, admission);
    } else {
        log::debug!("ioctl 0x{:x} failed: {}", req.raw, ret);
        memory.cancel(admission);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::entry::{HookEntry, CU_GET_PROC_ADDRESS_PER_THREAD_DEFAULT_STREAM};
    use crate::mock::MockDriver;
    use std::ptr;

    extern "C" fn hooked_getpid() -> c_int {
        -7
    }

    extern "C" fn launch_hook() -> c_int {
        11
    }

    extern "C" fn launch_ptsz_hook() -> c_int {
        12
    }

    #[test]
    fn test_resolve_substitutes_governed_name() {
        let loader = LoaderSymbols::bootstrap(None).unwrap();
        let hooks = HookTable::new(vec![HookEntry::new("getpid", hooked_getpid as *const c_void)]);

        let got = unsafe {
            resolve(&loader, &hooks, libc::RTLD_DEFAULT, c"getpid".as_ptr(), ptr::null())
        };
        assert_eq!(got, hooked_getpid as *mut c_void);
        assert!(hooks.real("getpid").is_some());

        let other = unsafe {
            resolve(&loader, &hooks, libc::RTLD_DEFAULT, c"getppid".as_ptr(), ptr::null())
        };
        assert_ne!(other, hooked_getpid as *mut c_void);
        assert!(!other.is_null());
    }

    #[test]
    fn test_patch_proc_address() {
        let hooks = HookTable::new(vec![
            HookEntry::new("cuLaunchKernel", launch_hook as *const c_void),
            HookEntry::new("cuLaunchKernel_ptsz", launch_ptsz_hook as *const c_void),
        ]);
        let real = hooked_getpid as *mut c_void;

        let mut pfn = real;
        unsafe { patch_proc_address(&hooks, c"cuLaunchKernel".as_ptr(), &mut pfn, 0) };
        assert_eq!(pfn, launch_hook as *mut c_void);

        let mut pfn = real;
        unsafe {
            patch_proc_address(
                &hooks,
                c"cuLaunchKernel".as_ptr(),
                &mut pfn,
                CU_GET_PROC_ADDRESS_PER_THREAD_DEFAULT_STREAM,
            )
        };
        assert_eq!(pfn, launch_ptsz_hook as *mut c_void);

        unsafe { patch_proc_address(&hooks, c"cuLaunchKernel".as_ptr(), ptr::null_mut(), 0) };
    }

    #[test]
    fn test_ungoverned_requests_pass_through() {
        let mut driver = MockDriver::new();
        // Not an 'F' request.
        let ret = unsafe { intercept_ioctl(None, &driver, 3, 0x5401, ptr::null_mut()) };
        assert_eq!(ret, 0);
        assert_eq!(driver.forwarded(), 1);

        driver.set_device(1, 3);
        let req = IoctlRequest::readwrite(crate::nvos::escape::NV_ESC_RM_FREE, 16);
        let mut block = [0u32; 4];
        let gov = MockDriver::governor(1 << 30);
        let ret = unsafe {
            intercept_ioctl(
                Some(&gov),
                &driver,
                3,
                req.raw as c_ulong,
                block.as_mut_ptr() as *mut c_void,
            )
        };
        assert_eq!(ret, 0);
        assert_eq!(driver.forwarded(), 2);
    }
}
