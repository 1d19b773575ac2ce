//! Driver API replacements
//!
//! Kernel launches wait for a token before reaching the driver. The
//! proc-address entry points are wrapped so that functions resolved through
//! them are substituted the same way `dlsym` substitutes them.

use cudagov::bug_on;
use cudagov::hook::{patch_proc_address, FnAddr, HookEntry, HookTable};

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::sync::LazyLock;

/// `CUresult`
type CuResult = c_int;

type GetProcAddressFn = unsafe extern "C" fn(*const c_char, *mut *mut c_void, c_int, u64) -> CuResult;
type GetProcAddressV2Fn =
    unsafe extern "C" fn(*const c_char, *mut *mut c_void, c_int, u64, *mut c_int) -> CuResult;
type LaunchKernelFn = unsafe extern "C" fn(
    *mut c_void,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    *mut c_void,
    *mut *mut c_void,
    *mut *mut c_void,
) -> CuResult;
type LaunchKernelExFn =
    unsafe extern "C" fn(*const c_void, *mut c_void, *mut *mut c_void, *mut *mut c_void) -> CuResult;

static HOOKS: LazyLock<HookTable> = LazyLock::new(|| {
    HookTable::new(vec![
        HookEntry::new("cuGetProcAddress", cu_get_proc_address as *const c_void),
        HookEntry::new("cuGetProcAddress_v2", cu_get_proc_address_v2 as *const c_void),
        HookEntry::new("cuLaunchKernel", cu_launch_kernel as *const c_void),
        HookEntry::new("cuLaunchKernel_ptsz", cu_launch_kernel_ptsz as *const c_void),
        HookEntry::new("cuLaunchKernelEx", cu_launch_kernel_ex as *const c_void),
        HookEntry::new("cuLaunchKernelEx_ptsz", cu_launch_kernel_ex_ptsz as *const c_void),
    ])
});

pub fn hooks() -> &'static HookTable {
    &HOOKS
}

/// Real address of a hooked entry point; reaching a hook before its real
/// address was learned is a bug
fn real(name: &str) -> FnAddr {
    let addr = HOOKS.real(name);
    bug_on!(addr.is_none());
    addr.unwrap_or_else(|| std::process::abort())
}

unsafe extern "C" fn cu_get_proc_address(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: u64,
) -> CuResult {
    let f = std::mem::transmute::<*const c_void, GetProcAddressFn>(real("cuGetProcAddress").as_ptr());
    let ret = f(symbol, pfn, cuda_version, flags);
    if ret == 0 {
        patch_proc_address(&HOOKS, symbol, pfn, flags);
    }
    ret
}

unsafe extern "C" fn cu_get_proc_address_v2(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: u64,
    symbol_status: *mut c_int,
) -> CuResult {
    let f =
        std::mem::transmute::<*const c_void, GetProcAddressV2Fn>(real("cuGetProcAddress_v2").as_ptr());
    let ret = f(symbol, pfn, cuda_version, flags, symbol_status);
    if ret == 0 {
        patch_proc_address(&HOOKS, symbol, pfn, flags);
    }
    ret
}

macro_rules! launch_kernel_hook {
    ($hook:ident, $name:literal) => {
        #[allow(clippy::too_many_arguments)]
        unsafe extern "C" fn $hook(
            f: *mut c_void,
            grid_x: c_uint,
            grid_y: c_uint,
            grid_z: c_uint,
            block_x: c_uint,
            block_y: c_uint,
            block_z: c_uint,
            shared_mem_bytes: c_uint,
            stream: *mut c_void,
            params: *mut *mut c_void,
            extra: *mut *mut c_void,
        ) -> CuResult {
            let ret = crate::governor().rate_limit();
            if ret != 0 {
                return ret;
            }
            let real = std::mem::transmute::<*const c_void, LaunchKernelFn>(real($name).as_ptr());
            real(
                f,
                grid_x,
                grid_y,
                grid_z,
                block_x,
                block_y,
                block_z,
                shared_mem_bytes,
                stream,
                params,
                extra,
            )
        }
    };
}

macro_rules! launch_kernel_ex_hook {
    ($hook:ident, $name:literal) => {
        unsafe extern "C" fn $hook(
            config: *const c_void,
            f: *mut c_void,
            params: *mut *mut c_void,
            extra: *mut *mut c_void,
        ) -> CuResult {
            let ret = crate::governor().rate_limit();
            if ret != 0 {
                return ret;
            }
            let real = std::mem::transmute::<*const c_void, LaunchKernelExFn>(real($name).as_ptr());
            real(config, f, params, extra)
        }
    };
}

launch_kernel_hook!(cu_launch_kernel, "cuLaunchKernel");
launch_kernel_hook!(cu_launch_kernel_ptsz, "cuLaunchKernel_ptsz");
launch_kernel_ex_hook!(cu_launch_kernel_ex, "cuLaunchKernelEx");
launch_kernel_ex_hook!(cu_launch_kernel_ex_ptsz, "cuLaunchKernelEx_ptsz");
