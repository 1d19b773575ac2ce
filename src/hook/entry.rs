//! Hook entry table
//!
//! Each governed driver entry point has one entry holding the real address,
//! learned as a side effect of symbol resolution, and the replacement handed
//! to the application instead.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Flag of the proc-address call requesting per-thread default stream variants
pub const CU_GET_PROC_ADDRESS_PER_THREAD_DEFAULT_STREAM: u64 = 1 << 1;

/// Suffix of per-thread default stream entry points
pub const PTSZ_SUFFIX: &str = "_ptsz";

/// Address of a foreign function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FnAddr(*const c_void);

// SAFETY: a code address is immutable and valid from any thread.
unsafe impl Send for FnAddr {}
unsafe impl Sync for FnAddr {}

impl FnAddr {
    pub fn new(addr: *const c_void) -> Option<Self> {
        (!addr.is_null()).then_some(Self(addr))
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0
    }

    pub fn as_mut_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

/// One governed entry point
#[derive(Debug)]
pub struct HookEntry {
    name: &'static str,
    real: AtomicPtr<c_void>,
    hook: Option<FnAddr>,
}

impl HookEntry {
    /// Entry that is substituted by `hook`
    pub fn new(name: &'static str, hook: *const c_void) -> Self {
        Self {
            name,
            real: AtomicPtr::new(ptr::null_mut()),
            hook: FnAddr::new(hook),
        }
    }

    /// Entry whose real address is recorded but never substituted
    pub fn observed(name: &'static str) -> Self {
        Self {
            name,
            real: AtomicPtr::new(ptr::null_mut()),
            hook: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hook(&self) -> Option<FnAddr> {
        self.hook
    }

    /// Real address, once resolved
    pub fn real(&self) -> Option<FnAddr> {
        FnAddr::new(self.real.load(Ordering::Acquire))
    }

    /// Record the real address; the first resolution wins
    pub fn set_real(&self, addr: *mut c_void) -> bool {
        !addr.is_null()
            && self
                .real
                .compare_exchange(ptr::null_mut(), addr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// Registry of governed entry points, looked up by name
#[derive(Debug)]
pub struct HookTable {
    entries: Vec<HookEntry>,
}

impl HookTable {
    pub fn new(entries: Vec<HookEntry>) -> Self {
        Self { entries }
    }

    pub fn find(&self, name: &str) -> Option<&HookEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[HookEntry] {
        &self.entries
    }

    /// Whether `addr` is one of our replacements
    pub fn is_hook(&self, addr: *const c_void) -> bool {
        self.entries
            .iter()
            .any(|e| e.hook.is_some_and(|h| h.as_ptr() == addr))
    }

    /// Real address of a governed entry point
    pub fn real(&self, name: &str) -> Option<FnAddr> {
        self.find(name).and_then(HookEntry::real)
    }

    /// Learn `real` for `name` and return what the caller should receive
    ///
    /// Ungoverned names and null addresses come back unchanged. A resolution
    /// that already yields one of our hooks is never recorded as real.
    pub fn intercept(&self, name: &str, real: *mut c_void) -> *mut c_void {
        if real.is_null() {
            return real;
        }
        let Some(entry) = self.find(name) else {
            return real;
        };
        if self.is_hook(real) {
            return real;
        }

        if entry.set_real(real) {
            log::debug!("Resolved {} at {:p}", name, real);
        }
        match entry.hook {
            Some(hook) => {
                log::trace!("replace {}", name);
                hook.as_mut_ptr()
            }
            None => real,
        }
    }

    /// Variant of `intercept` for proc-address lookups
    ///
    /// With the per-thread default stream flag, the driver hands out the
    /// `_ptsz` flavour of the entry point, so it is recorded under that name
    /// when the table has one.
    pub fn intercept_proc(&self, name: &str, flags: u64, real: *mut c_void) -> *mut c_void {
        if flags & CU_GET_PROC_ADDRESS_PER_THREAD_DEFAULT_STREAM != 0 {
            let ptsz = format!("{}{}", name, PTSZ_SUFFIX);
            if self.find(&ptsz).is_some() {
                return self.intercept(&ptsz, real);
            }
        }
        self.intercept(name, real)
    }
}
