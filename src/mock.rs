//! Mock implementations for testing
//!
//! Provides a scripted NVIDIA driver behind the interception engine, and a
//! scripted utilization source and cgroup table for the monitor, so both can
//! be tested without real hardware.

use crate::cgroup::CgroupResolver;
use crate::controller::UtilizationSource;
use crate::domain::{MemoryLimit, ProcessSample};
use crate::error::NvmlError;
use crate::hook::{intercept_ioctl, DriverIo};
use crate::memory::MemoryGovernor;
use crate::nvos::escape::{
    NV_ESC_RM_ALLOC, NV_ESC_RM_CONTROL, NV_ESC_RM_FREE, NV_ESC_RM_VID_HEAP_CONTROL,
    NV_IOCTL_MAGIC,
};
use crate::nvos::params::{
    decode_rm_alloc, params_mut, Nv2080CtrlFbGetInfoParams, Nv2080CtrlFbInfo, Nvos00Parameters,
    Nvos21Parameters, Nvos32Parameters, Nvos54Parameters, Nvos64Parameters, NV01_DEVICE_0,
    NV20_SUBDEVICE_0, NV2080_CTRL_CMD_FB_GET_INFO, NV2080_CTRL_CMD_FB_GET_INFO_V2,
    NV2080_CTRL_FB_INFO_INDEX_HEAP_FREE, NV2080_CTRL_FB_INFO_INDEX_HEAP_SIZE,
    NV2080_CTRL_FB_INFO_INDEX_TOTAL_RAM_SIZE, NVOS32_FUNCTION_ALLOC_SIZE, NVOS32_FUNCTION_INFO,
    NV_OK,
};
use crate::nvos::{IoctlRequest, NvHandle, NVIDIA_CTL_MINOR, NVIDIA_DEVICE_MAJOR};
use crate::shm::{FbInit, ShmRegion};

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_int, c_ulong, c_void};
use std::mem::size_of;

const MOCK_FD: c_int = 42;

/// Fake /dev/nvidiactl that answers resource-manager escapes
///
/// Every helper drives a request through
/// [`intercept_ioctl`](crate::hook::intercept_ioctl) exactly as the preload
/// library does, so the governor sees the same pre/post sequence it would
/// see in a hooked process.
#[derive(Debug)]
pub struct MockDriver {
    device: (u32, u32),
    forwarded: Cell<usize>,
    fail_next: Cell<Option<u32>>,
}

/// Device allocation parameters; `deviceId` comes first
#[repr(C)]
#[derive(Debug, Default)]
struct DeviceAllocParams {
    device_id: u32,
    flags: u32,
    va_space_size: u64,
}

/// Inline info list of the V2 control
#[repr(C)]
#[derive(Debug, Default)]
struct FbGetInfoV2Params {
    fb_info_list_size: u32,
    fb_info_list: [Nv2080CtrlFbInfo; 4],
}

impl MockDriver {
    /// Physical framebuffer reported by the fake driver, in KiB
    pub const DEVICE_TOTAL_KIB: u32 = 16 << 20;
    /// Physical free framebuffer reported by the fake driver, in KiB
    pub const DEVICE_FREE_KIB: u32 = 12 << 20;
    /// Info index the governor does not rewrite
    pub const UNRELATED_INDEX: u32 = 0x01;
    /// Value the fake driver reports for `UNRELATED_INDEX`
    pub const UNRELATED_VALUE: u32 = 0xabcd;
    /// Parent handle used when a test does not care about attribution
    pub const DEFAULT_PARENT: NvHandle = 0x20;

    /// Driver on /dev/nvidiactl
    pub fn new() -> Self {
        Self {
            device: (NVIDIA_DEVICE_MAJOR, NVIDIA_CTL_MINOR),
            forwarded: Cell::new(0),
            fail_next: Cell::new(None),
        }
    }

    /// Memory governor over an anonymous region of `bytes`
    pub fn governor(bytes: u64) -> MemoryGovernor {
        let init = FbInit {
            total: bytes,
            owner_pid: std::process::id() as i32,
        };
        match ShmRegion::anonymous(&init) {
            Ok(fb) => MemoryGovernor::new(MemoryLimit::new(0, bytes), fb),
            Err(e) => panic!("anonymous fb region: {}", e),
        }
    }

    /// Pretend the descriptor is a different character device
    pub fn set_device(&mut self, major: u32, minor: u32) {
        self.device = (major, minor);
    }

    /// Requests that reached the driver
    pub fn forwarded(&self) -> usize {
        self.forwarded.get()
    }

    /// Answer the next request with `status`
    pub fn fail_next_with(&mut self, status: u32) {
        self.fail_next.set(Some(status));
    }

    fn call<T>(&mut self, gov: &MemoryGovernor, nr: u8, params: &mut T) -> c_int {
        let req = IoctlRequest::readwrite(nr, size_of::<T>());
        // SAFETY: `params` is a live block of the encoded size.
        unsafe {
            intercept_ioctl(
                Some(gov),
                &*self,
                MOCK_FD,
                req.raw as c_ulong,
                params as *mut T as *mut c_void,
            )
        }
    }

    /// Heap allocation under the default parent; returns `(status, free)`
    pub fn vid_heap_alloc(
        &mut self,
        gov: &MemoryGovernor,
        root: NvHandle,
        h_memory: NvHandle,
        size: u64,
        alignment: u64,
    ) -> (u32, u64) {
        self.vid_heap_alloc_on(gov, root, Self::DEFAULT_PARENT, h_memory, size, alignment)
    }

    /// Heap allocation under `parent`; returns `(status, free)`
    pub fn vid_heap_alloc_on(
        &mut self,
        gov: &MemoryGovernor,
        root: NvHandle,
        parent: NvHandle,
        h_memory: NvHandle,
        size: u64,
        alignment: u64,
    ) -> (u32, u64) {
        let mut p = Nvos32Parameters {
            h_root: root,
            h_object_parent: parent,
            function: NVOS32_FUNCTION_ALLOC_SIZE,
            ..Default::default()
        };
        p.alloc_size.h_memory = h_memory;
        p.alloc_size.size = size;
        p.alloc_size.alignment = alignment;
        self.call(gov, NV_ESC_RM_VID_HEAP_CONTROL, &mut p);
        (p.status, p.free)
    }

    /// Heap info query; returns `(total, free)` in bytes
    pub fn vid_heap_info(&mut self, gov: &MemoryGovernor, root: NvHandle) -> (u64, u64) {
        let mut p = Nvos32Parameters {
            h_root: root,
            h_object_parent: Self::DEFAULT_PARENT,
            function: NVOS32_FUNCTION_INFO,
            ..Default::default()
        };
        self.call(gov, NV_ESC_RM_VID_HEAP_CONTROL, &mut p);
        (p.total, p.free)
    }

    /// Free `handle`; returns the status
    pub fn free(&mut self, gov: &MemoryGovernor, root: NvHandle, handle: NvHandle) -> u32 {
        let mut p = Nvos00Parameters {
            h_root: root,
            h_object_parent: root,
            h_object_old: handle,
            status: 0,
        };
        self.call(gov, NV_ESC_RM_FREE, &mut p);
        p.status
    }

    /// Framebuffer info control against `object`
    ///
    /// Asks for total RAM, heap size, heap free and one unrelated index, in
    /// that order.
    pub fn fb_get_info(
        &mut self,
        gov: &MemoryGovernor,
        root: NvHandle,
        object: NvHandle,
        v2: bool,
    ) -> Vec<Nv2080CtrlFbInfo> {
        let request = [
            NV2080_CTRL_FB_INFO_INDEX_TOTAL_RAM_SIZE,
            NV2080_CTRL_FB_INFO_INDEX_HEAP_SIZE,
            NV2080_CTRL_FB_INFO_INDEX_HEAP_FREE,
            Self::UNRELATED_INDEX,
        ];
        let mut list: Vec<Nv2080CtrlFbInfo> = request
            .iter()
            .map(|&index| Nv2080CtrlFbInfo { index, data: 0 })
            .collect();

        let mut control = Nvos54Parameters {
            h_client: root,
            h_object: object,
            ..Default::default()
        };

        if v2 {
            let mut params = FbGetInfoV2Params {
                fb_info_list_size: list.len() as u32,
                ..Default::default()
            };
            params.fb_info_list.copy_from_slice(&list);
            control.cmd = NV2080_CTRL_CMD_FB_GET_INFO_V2;
            control.params = &mut params as *mut FbGetInfoV2Params as u64;
            control.params_size = size_of::<FbGetInfoV2Params>() as u32;
            self.call(gov, NV_ESC_RM_CONTROL, &mut control);
            params.fb_info_list.to_vec()
        } else {
            let mut params = Nv2080CtrlFbGetInfoParams {
                fb_info_list_size: list.len() as u32,
                fb_info_list: list.as_mut_ptr() as u64,
            };
            control.cmd = NV2080_CTRL_CMD_FB_GET_INFO;
            control.params = &mut params as *mut Nv2080CtrlFbGetInfoParams as u64;
            control.params_size = size_of::<Nv2080CtrlFbGetInfoParams>() as u32;
            self.call(gov, NV_ESC_RM_CONTROL, &mut control);
            list
        }
    }

    /// Allocate a device object for `device_id` (48-byte layout)
    pub fn rm_alloc_device(
        &mut self,
        gov: &MemoryGovernor,
        root: NvHandle,
        handle: NvHandle,
        device_id: u32,
    ) -> u32 {
        let mut params = DeviceAllocParams {
            device_id,
            ..Default::default()
        };
        let mut p = Nvos64Parameters {
            h_root: root,
            h_object_parent: root,
            h_object_new: handle,
            h_class: NV01_DEVICE_0,
            p_alloc_parms: &mut params as *mut DeviceAllocParams as u64,
            params_size: size_of::<DeviceAllocParams>() as u32,
            ..Default::default()
        };
        self.call(gov, NV_ESC_RM_ALLOC, &mut p);
        p.status
    }

    /// Allocate a subdevice under `parent` (32-byte layout)
    pub fn rm_alloc_child(
        &mut self,
        gov: &MemoryGovernor,
        root: NvHandle,
        parent: NvHandle,
        handle: NvHandle,
    ) -> u32 {
        let mut p = Nvos21Parameters {
            h_root: root,
            h_object_parent: parent,
            h_object_new: handle,
            h_class: NV20_SUBDEVICE_0,
            ..Default::default()
        };
        self.call(gov, NV_ESC_RM_ALLOC, &mut p);
        p.status
    }

    fn status(&self) -> u32 {
        self.fail_next.take().unwrap_or(NV_OK)
    }

    fn fill_fb_info(list: &mut [Nv2080CtrlFbInfo]) {
        for info in list {
            info.data = match info.index {
                NV2080_CTRL_FB_INFO_INDEX_TOTAL_RAM_SIZE | NV2080_CTRL_FB_INFO_INDEX_HEAP_SIZE => {
                    Self::DEVICE_TOTAL_KIB
                }
                NV2080_CTRL_FB_INFO_INDEX_HEAP_FREE => Self::DEVICE_FREE_KIB,
                _ => Self::UNRELATED_VALUE,
            };
        }
    }

    unsafe fn answer(&self, req: &IoctlRequest, args: *mut c_void) {
        match req.nr {
            NV_ESC_RM_VID_HEAP_CONTROL => {
                if let Some(p) = params_mut::<Nvos32Parameters>(args, req.size) {
                    p.status = self.status();
                    p.total = (Self::DEVICE_TOTAL_KIB as u64) << 10;
                    p.free = (Self::DEVICE_FREE_KIB as u64) << 10;
                }
            }
            NV_ESC_RM_CONTROL => {
                let Some(p) = params_mut::<Nvos54Parameters>(args, req.size) else {
                    return;
                };
                p.status = self.status();
                if p.cmd == NV2080_CTRL_CMD_FB_GET_INFO {
                    let head = &mut *(p.params as *mut Nv2080CtrlFbGetInfoParams);
                    let list = std::slice::from_raw_parts_mut(
                        head.fb_info_list as *mut Nv2080CtrlFbInfo,
                        head.fb_info_list_size as usize,
                    );
                    Self::fill_fb_info(list);
                } else if p.cmd == NV2080_CTRL_CMD_FB_GET_INFO_V2 {
                    let params = &mut *(p.params as *mut FbGetInfoV2Params);
                    let len = (params.fb_info_list_size as usize).min(params.fb_info_list.len());
                    Self::fill_fb_info(&mut params.fb_info_list[..len]);
                }
            }
            NV_ESC_RM_FREE => {
                if let Some(p) = params_mut::<Nvos00Parameters>(args, req.size) {
                    p.status = self.status();
                }
            }
            NV_ESC_RM_ALLOC => {
                if decode_rm_alloc(args, req.size).is_none() {
                    return;
                }
                let status = self.status();
                if req.size >= size_of::<Nvos64Parameters>() {
                    if let Some(p) = params_mut::<Nvos64Parameters>(args, req.size) {
                        p.status = status;
                    }
                } else if let Some(p) = params_mut::<Nvos21Parameters>(args, req.size) {
                    p.status = status;
                }
            }
            _ => {}
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverIo for MockDriver {
    fn device_number(&self, _fd: c_int) -> Option<(u32, u32)> {
        Some(self.device)
    }

    unsafe fn ioctl(&self, _fd: c_int, request: c_ulong, args: *mut c_void) -> c_int {
        self.forwarded.set(self.forwarded.get() + 1);
        let req = IoctlRequest::decode(request as u64);
        if !args.is_null() && req.kind == NV_IOCTL_MAGIC {
            self.answer(&req, args);
        }
        0
    }
}

/// Scripted utilization source
///
/// Each poll returns the next queued batch; an empty queue reports no
/// samples, as NVML does when nothing ran since the last poll.
#[derive(Debug, Default)]
pub struct MockUtilization {
    batches: VecDeque<Vec<ProcessSample>>,
    last_seen: Option<u64>,
}

impl MockUtilization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the samples for the next poll
    pub fn push(&mut self, samples: Vec<ProcessSample>) {
        self.batches.push_back(samples);
    }

    /// Timestamp passed to the latest poll
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }
}

impl UtilizationSource for MockUtilization {
    fn process_samples(&mut self, last_seen_us: u64) -> Result<Vec<ProcessSample>, NvmlError> {
        self.last_seen = Some(last_seen_us);
        match self.batches.pop_front() {
            Some(batch) if !batch.is_empty() => Ok(batch),
            _ => Err(NvmlError::NoSamples),
        }
    }
}

/// Fixed pid to cgroup id table
#[derive(Debug, Default, Clone)]
pub struct FixedCgroups {
    ids: HashMap<u32, String>,
}

impl FixedCgroups {
    pub fn new(entries: &[(u32, &str)]) -> Self {
        Self {
            ids: entries
                .iter()
                .map(|(pid, id)| (*pid, id.to_string()))
                .collect(),
        }
    }
}

impl CgroupResolver for FixedCgroups {
    fn cgroup_id(&self, pid: u32) -> Option<String> {
        self.ids.get(&pid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_driver_counts_requests() {
        let gov = MockDriver::governor(1 << 30);
        let mut driver = MockDriver::new();
        assert_eq!(driver.rm_alloc_child(&gov, 1, 1, 2), NV_OK);
        assert_eq!(driver.free(&gov, 1, 2), NV_OK);
        assert_eq!(driver.forwarded(), 2);
    }

    #[test]
    fn test_mock_driver_fails_once() {
        let gov = MockDriver::governor(1 << 30);
        let mut driver = MockDriver::new();
        driver.fail_next_with(0x1f);
        assert_eq!(driver.free(&gov, 1, 2), 0x1f);
        assert_eq!(driver.free(&gov, 1, 2), NV_OK);
    }

    #[test]
    fn test_mock_utilization_drains_batches() {
        let mut source = MockUtilization::new();
        source.push(vec![ProcessSample::new(1, 10, 20)]);
        assert_eq!(source.process_samples(5).unwrap().len(), 1);
        assert!(matches!(source.process_samples(6), Err(NvmlError::NoSamples)));
        assert_eq!(source.last_seen(), Some(6));
    }
}
