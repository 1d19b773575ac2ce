//! Raw NVML binding for the monitor's sampling loop
//!
//! The library is opened with libloading and bound by name. Initialization
//! and handle lookup tolerate both the historical and the `_v2` entry points,
//! so the monitor runs against old and new drivers alike.

use crate::domain::ProcessSample;
use crate::error::NvmlError;

use libloading::{Library, Symbol};
use nvml_wrapper_sys::bindings::{
    nvmlClockId_enum_NVML_CLOCK_ID_CURRENT, nvmlClockId_enum_NVML_CLOCK_ID_CUSTOMER_BOOST_MAX,
    nvmlClockType_enum_NVML_CLOCK_GRAPHICS, nvmlDevice_t, nvmlProcessUtilizationSample_t,
    nvmlReturn_enum_NVML_ERROR_NOT_FOUND, nvmlReturn_enum_NVML_SUCCESS,
};
use std::os::raw::{c_uint, c_ulonglong};
use std::ptr;

const NVML_LIBRARY_NAMES: &[&str] = &["libnvidia-ml.so.1", "libnvidia-ml.so"];

type InitFn = unsafe extern "C" fn() -> c_uint;
type ShutdownFn = unsafe extern "C" fn() -> c_uint;
type GetHandleByIndexFn = unsafe extern "C" fn(c_uint, *mut nvmlDevice_t) -> c_uint;
type GetCountFn = unsafe extern "C" fn(*mut c_uint) -> c_uint;
type GetMinorNumberFn = unsafe extern "C" fn(nvmlDevice_t, *mut c_uint) -> c_uint;
type GetProcessUtilizationFn = unsafe extern "C" fn(
    nvmlDevice_t,
    *mut nvmlProcessUtilizationSample_t,
    *mut c_uint,
    c_ulonglong,
) -> c_uint;
type GetClockFn = unsafe extern "C" fn(nvmlDevice_t, c_uint, c_uint, *mut c_uint) -> c_uint;

/// Source of per-process utilization samples
///
/// The monitor polls through this seam so tests can script the samples.
pub trait UtilizationSource {
    /// Samples taken at or after `last_seen_us` (microseconds since the epoch)
    ///
    /// `NvmlError::NoSamples` means nothing new since the last poll.
    fn process_samples(&mut self, last_seen_us: u64) -> Result<Vec<ProcessSample>, NvmlError>;
}

/// Entry points of an initialized NVML library
pub struct NvmlLib {
    _lib: Library,
    shutdown: ShutdownFn,
    get_handle_by_index: GetHandleByIndexFn,
    get_count: Option<GetCountFn>,
    get_minor_number: Option<GetMinorNumberFn>,
    get_process_utilization: GetProcessUtilizationFn,
    get_clock: GetClockFn,
    initialized: bool,
}

fn check(func: &'static str, code: c_uint) -> Result<(), NvmlError> {
    if code == nvmlReturn_enum_NVML_SUCCESS {
        Ok(())
    } else {
        Err(NvmlError::Call { func, code })
    }
}

unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, NvmlError> {
    let sym: Symbol<F> = lib
        .get(name.as_bytes())
        .map_err(|_| NvmlError::SymbolMissing(name.to_string()))?;
    Ok(*sym)
}

unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
    lib.get(name.as_bytes()).ok().map(|s: Symbol<F>| *s)
}

impl NvmlLib {
    /// Open the library, bind every entry point and call `nvmlInit`
    pub fn load() -> Result<Self, NvmlError> {
        let lib = Self::load_library()?;

        // SAFETY: the aliases match the NVML prototypes of the bound names.
        unsafe {
            let init: InitFn =
                load_fn(&lib, "nvmlInit").or_else(|_| load_fn(&lib, "nvmlInit_v2"))?;
            let mut nvml = Self {
                shutdown: load_fn(&lib, "nvmlShutdown")?,
                get_handle_by_index: load_fn(&lib, "nvmlDeviceGetHandleByIndex")
                    .or_else(|_| load_fn(&lib, "nvmlDeviceGetHandleByIndex_v2"))?,
                get_count: load_fn_opt::<GetCountFn>(&lib, "nvmlDeviceGetCount_v2")
                    .or(load_fn_opt(&lib, "nvmlDeviceGetCount")),
                get_minor_number: load_fn_opt(&lib, "nvmlDeviceGetMinorNumber"),
                get_process_utilization: load_fn(&lib, "nvmlDeviceGetProcessUtilization")?,
                get_clock: load_fn(&lib, "nvmlDeviceGetClock")?,
                initialized: false,
                _lib: lib,
            };
            nvml.initialize(init)?;
            Ok(nvml)
        }
    }

    /// Run `init`; only a successful init is paired with `nvmlShutdown`
    unsafe fn initialize(&mut self, init: InitFn) -> Result<(), NvmlError> {
        let code = init();
        if code != nvmlReturn_enum_NVML_SUCCESS {
            return Err(NvmlError::InitializationFailed(format!(
                "nvmlInit returned {}",
                code
            )));
        }
        self.initialized = true;
        Ok(())
    }

    fn load_library() -> Result<Library, NvmlError> {
        for name in NVML_LIBRARY_NAMES {
            // SAFETY: loading NVML runs no initializers with preconditions.
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    log::debug!("Loaded NVML from {}", name);
                    return Ok(lib);
                }
                Err(e) => log::debug!("Failed to load {}: {}", name, e),
            }
        }
        Err(NvmlError::LibraryNotFound)
    }

    /// Handle of the device with the given minor number
    ///
    /// Devices are matched by their reported minor; when the driver cannot
    /// report minors the minor is taken as the enumeration index.
    pub fn device_for_minor(&self, minor: u32) -> Result<NvmlDevice<'_>, NvmlError> {
        if let (Some(get_count), Some(get_minor)) = (self.get_count, self.get_minor_number) {
            let mut count: c_uint = 0;
            // SAFETY: `count` is a valid out pointer.
            check("nvmlDeviceGetCount", unsafe { get_count(&mut count) })?;
            for index in 0..count {
                let Ok(device) = self.device_by_index(index) else {
                    continue;
                };
                let mut dev_minor: c_uint = 0;
                // SAFETY: `device.handle` came from the library.
                if unsafe { get_minor(device.handle, &mut dev_minor) } == nvmlReturn_enum_NVML_SUCCESS
                    && dev_minor == minor
                {
                    log::debug!("Minor {} is NVML device {}", minor, index);
                    return Ok(device);
                }
            }
        }

        self.device_by_index(minor)
            .map_err(|_| NvmlError::DeviceNotFound(minor))
    }

    fn device_by_index(&self, index: u32) -> Result<NvmlDevice<'_>, NvmlError> {
        let mut handle: nvmlDevice_t = ptr::null_mut();
        // SAFETY: `handle` is a valid out pointer.
        let code = unsafe { (self.get_handle_by_index)(index, &mut handle) };
        check("nvmlDeviceGetHandleByIndex", code)?;
        Ok(NvmlDevice { lib: self, handle })
    }
}

impl Drop for NvmlLib {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        // SAFETY: paired with the successful nvmlInit in `load`.
        let code = unsafe { (self.shutdown)() };
        if code != nvmlReturn_enum_NVML_SUCCESS {
            log::debug!("nvmlShutdown returned {}", code);
        }
    }
}

/// One device handle, borrowed from the library that produced it
pub struct NvmlDevice<'a> {
    lib: &'a NvmlLib,
    handle: nvmlDevice_t,
}

impl NvmlDevice<'_> {
    /// Current and maximum boost graphics clock, in MHz
    pub fn graphics_clocks(&self) -> Result<(u32, u32), NvmlError> {
        let mut current: c_uint = 0;
        let mut max: c_uint = 0;
        // SAFETY: valid handle and out pointers.
        unsafe {
            check(
                "nvmlDeviceGetClock",
                (self.lib.get_clock)(
                    self.handle,
                    nvmlClockType_enum_NVML_CLOCK_GRAPHICS,
                    nvmlClockId_enum_NVML_CLOCK_ID_CUSTOMER_BOOST_MAX,
                    &mut max,
                ),
            )?;
            check(
                "nvmlDeviceGetClock",
                (self.lib.get_clock)(
                    self.handle,
                    nvmlClockType_enum_NVML_CLOCK_GRAPHICS,
                    nvmlClockId_enum_NVML_CLOCK_ID_CURRENT,
                    &mut current,
                ),
            )?;
        }
        Ok((current, max))
    }

    /// Sampler reusing one buffer of `capacity` entries
    pub fn sampler(&self, capacity: u32) -> NvmlSampler<'_> {
        NvmlSampler {
            device: self,
            buffer: vec![
                nvmlProcessUtilizationSample_t {
                    pid: 0,
                    timeStamp: 0,
                    smUtil: 0,
                    memUtil: 0,
                    encUtil: 0,
                    decUtil: 0,
                };
                capacity.max(1) as usize
            ],
        }
    }
}

/// Polls process utilization of one device
pub struct NvmlSampler<'a> {
    device: &'a NvmlDevice<'a>,
    buffer: Vec<nvmlProcessUtilizationSample_t>,
}

impl UtilizationSource for NvmlSampler<'_> {
    fn process_samples(&mut self, last_seen_us: u64) -> Result<Vec<ProcessSample>, NvmlError> {
        let mut count = self.buffer.len() as c_uint;
        // SAFETY: the buffer holds `count` entries.
        let code = unsafe {
            (self.device.lib.get_process_utilization)(
                self.device.handle,
                self.buffer.as_mut_ptr(),
                &mut count,
                last_seen_us,
            )
        };
        if code == nvmlReturn_enum_NVML_ERROR_NOT_FOUND {
            return Err(NvmlError::NoSamples);
        }
        check("nvmlDeviceGetProcessUtilization", code)?;

        let count = (count as usize).min(self.buffer.len());
        Ok(self.buffer[..count]
            .iter()
            .map(|s| ProcessSample {
                pid: s.pid,
                timestamp_us: s.timeStamp,
                sm_util: s.smUtil,
                mem_util: s.memUtil,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_call_errors_carry_code() {
        assert!(check("nvmlInit", nvmlReturn_enum_NVML_SUCCESS).is_ok());
        let err = check("nvmlDeviceGetClock", 3).unwrap_err();
        assert!(matches!(
            err,
            NvmlError::Call {
                func: "nvmlDeviceGetClock",
                code: 3
            }
        ));
    }

    static SHUTDOWNS: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn init_ok() -> c_uint {
        nvmlReturn_enum_NVML_SUCCESS
    }
    unsafe extern "C" fn init_failed() -> c_uint {
        9
    }
    unsafe extern "C" fn shutdown() -> c_uint {
        SHUTDOWNS.fetch_add(1, Ordering::SeqCst);
        nvmlReturn_enum_NVML_SUCCESS
    }
    unsafe extern "C" fn no_handle(_: c_uint, _: *mut nvmlDevice_t) -> c_uint {
        9
    }
    unsafe extern "C" fn no_utilization(
        _: nvmlDevice_t,
        _: *mut nvmlProcessUtilizationSample_t,
        _: *mut c_uint,
        _: c_ulonglong,
    ) -> c_uint {
        9
    }
    unsafe extern "C" fn no_clock(_: nvmlDevice_t, _: c_uint, _: c_uint, _: *mut c_uint) -> c_uint {
        9
    }

    fn unbound() -> NvmlLib {
        NvmlLib {
            _lib: Library::from(libloading::os::unix::Library::this()),
            shutdown,
            get_handle_by_index: no_handle,
            get_count: None,
            get_minor_number: None,
            get_process_utilization: no_utilization,
            get_clock: no_clock,
            initialized: false,
        }
    }

    #[test]
    fn test_shutdown_only_after_successful_init() {
        let mut nvml = unbound();
        let err = unsafe { nvml.initialize(init_failed) }.unwrap_err();
        assert!(matches!(err, NvmlError::InitializationFailed(_)));
        drop(nvml);
        assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), 0);

        let mut nvml = unbound();
        unsafe { nvml.initialize(init_ok) }.unwrap();
        drop(nvml);
        assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_minor_is_device_not_found() {
        let nvml = unbound();
        assert!(matches!(
            nvml.device_for_minor(4),
            Err(NvmlError::DeviceNotFound(4))
        ));
    }

    #[test]
    #[ignore = "Requires NVIDIA GPU"]
    fn test_load_and_sample() {
        let nvml = NvmlLib::load().unwrap();
        let device = nvml.device_for_minor(0).unwrap();
        let (current, max) = device.graphics_clocks().unwrap();
        assert!(max >= current || max == 0);

        let mut sampler = device.sampler(200);
        match sampler.process_samples(0) {
            Ok(_) | Err(NvmlError::NoSamples) => {}
            Err(e) => panic!("{}", e),
        }
    }
}
