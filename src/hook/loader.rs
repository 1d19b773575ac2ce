//! Loader entry points resolved at bootstrap
//!
//! Once `dlsym` and `ioctl` are interposed, the real ones can no longer be
//! reached by name. They are located once, by walking symbol tables, and
//! called through the pointers kept here.

use crate::error::BootstrapError;
use crate::hook::elf::find_symbols;
use crate::hook::entry::FnAddr;

use std::ffi::{c_char, c_int, c_ulong, c_void, CStr};
use std::ptr;

pub type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
pub type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
pub type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type DladdrFn = unsafe extern "C" fn(*const c_void, *mut libc::Dl_info) -> c_int;
pub type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int;

const NAMES: [&str; 5] = ["dlopen", "dlsym", "dlclose", "dladdr", "ioctl"];

/// Public prefix of glibc's `struct link_map`
#[repr(C)]
struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *const c_void,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

/// Real loader and ioctl entry points
#[derive(Debug, Clone, Copy)]
pub struct LoaderSymbols {
    dlopen: DlopenFn,
    dlsym: DlsymFn,
    dlclose: DlcloseFn,
    dladdr: DladdrFn,
    ioctl: IoctlFn,
}

impl LoaderSymbols {
    /// Resolve every entry point, skipping the module loaded at `skip_base`
    pub fn bootstrap(skip_base: Option<usize>) -> Result<Self, BootstrapError> {
        let found = find_symbols(&NAMES, skip_base);
        let get = |i: usize| found[i].ok_or(BootstrapError::SymbolNotFound(NAMES[i]));

        // SAFETY: each address is the exported definition of the named libc
        // function, whose signature the alias matches.
        unsafe {
            Ok(Self {
                dlopen: std::mem::transmute::<*const c_void, DlopenFn>(get(0)?.as_ptr()),
                dlsym: std::mem::transmute::<*const c_void, DlsymFn>(get(1)?.as_ptr()),
                dlclose: std::mem::transmute::<*const c_void, DlcloseFn>(get(2)?.as_ptr()),
                dladdr: std::mem::transmute::<*const c_void, DladdrFn>(get(3)?.as_ptr()),
                ioctl: std::mem::transmute::<*const c_void, IoctlFn>(get(4)?.as_ptr()),
            })
        }
    }

    /// The real `ioctl`
    pub fn ioctl(&self) -> IoctlFn {
        self.ioctl
    }

    /// Real `dlsym`
    ///
    /// # Safety
    /// Same contract as `dlsym(3)`.
    pub unsafe fn dlsym(&self, handle: *mut c_void, symbol: *const c_char) -> *mut c_void {
        (self.dlsym)(handle, symbol)
    }

    /// Resolve `symbol` in the modules loaded after the one containing `caller`
    ///
    /// This is `RTLD_NEXT` computed against the application's return address
    /// rather than ours. Each candidate is re-opened with `RTLD_NOLOAD` so the
    /// lookup goes through a proper handle.
    ///
    /// # Safety
    /// `symbol` must be a valid C string.
    pub unsafe fn next_symbol(&self, caller: *const c_void, symbol: *const c_char) -> *mut c_void {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if (self.dladdr)(caller, &mut info) == 0 {
            log::debug!("caller {:p} is in no loaded module", caller);
            return ptr::null_mut();
        }

        let main = (self.dlopen)(ptr::null(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) as *mut LinkMap;
        if main.is_null() {
            return ptr::null_mut();
        }

        let result = self.search_after(main, &info, symbol);
        (self.dlclose)(main as *mut c_void);
        result
    }

    unsafe fn search_after(
        &self,
        main: *mut LinkMap,
        caller: &libc::Dl_info,
        symbol: *const c_char,
    ) -> *mut c_void {
        let caller_name = (!caller.dli_fname.is_null()).then(|| CStr::from_ptr(caller.dli_fname));
        let is_caller = |map: &LinkMap| {
            if map.l_addr != 0 && map.l_addr == caller.dli_fbase as usize {
                return true;
            }
            let name = (!map.l_name.is_null()).then(|| CStr::from_ptr(map.l_name));
            matches!((name, caller_name), (Some(n), Some(c)) if !n.is_empty() && n == c)
        };

        let mut map = main;
        while !map.is_null() && !is_caller(&*map) {
            map = (*map).l_next;
        }
        if map.is_null() {
            // A non-PIE executable has neither a load bias nor a name.
            log::trace!("caller module not in link map, searching after the executable");
            map = main;
        }

        map = (*map).l_next;
        while !map.is_null() {
            let name = (*map).l_name;
            if !name.is_null() && *name != 0 {
                let handle = (self.dlopen)(name, libc::RTLD_NOLOAD | libc::RTLD_LAZY);
                if !handle.is_null() {
                    let addr = (self.dlsym)(handle, symbol);
                    (self.dlclose)(handle);
                    if !addr.is_null() {
                        return addr;
                    }
                }
            }
            map = (*map).l_next;
        }
        ptr::null_mut()
    }
}

/// Resolve a real entry point by the bootstrapped `dlsym`
pub fn lookup(loader: &LoaderSymbols, handle: *mut c_void, name: &CStr) -> Option<FnAddr> {
    // SAFETY: `name` is a valid C string.
    FnAddr::new(unsafe { loader.dlsym(handle, name.as_ptr()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_resolves_everything() {
        let loader = LoaderSymbols::bootstrap(None).unwrap();
        assert!(lookup(&loader, libc::RTLD_DEFAULT, c"getpid").is_some());
    }

    #[test]
    fn test_bootstrap_skipping_libc_fails() {
        let libc_base = crate::hook::elf::module_base(libc::getpid as *const c_void);
        // When libc itself is excluded, nothing else defines ioctl.
        let result = LoaderSymbols::bootstrap(libc_base);
        if let Err(e) = result {
            assert!(matches!(e, BootstrapError::SymbolNotFound(_)));
        }
    }

    #[test]
    fn test_next_symbol_from_main_program() {
        let loader = LoaderSymbols::bootstrap(None).unwrap();
        let caller = test_next_symbol_from_main_program as *const c_void;
        let addr = unsafe { loader.next_symbol(caller, c"getpid".as_ptr()) };
        assert!(!addr.is_null());
    }
}
