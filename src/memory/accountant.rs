//! Memory accounting over resource-manager ioctls
//!
//! Admission happens before the real call: an `ALLOC_SIZE` heap request
//! reserves its page-aligned size from the shared counter, or is answered
//! with `NV_ERR_NO_MEMORY` without reaching the driver. After the call the
//! reservation is either turned into an allocation record or handed back.

use crate::domain::MemoryLimit;
use crate::memory::records::{AllocationTable, ObjectKey};
use crate::nvos::escape::{
    IoctlRequest, NV_ESC_RM_ALLOC, NV_ESC_RM_CONTROL, NV_ESC_RM_FREE, NV_ESC_RM_VID_HEAP_CONTROL,
    NVIDIA_CTL_MINOR,
};
use crate::nvos::params::{
    decode_rm_alloc, params_mut, Nv2080CtrlFbGetInfoParams, Nv2080CtrlFbInfo, Nvos00Parameters,
    Nvos32Parameters, Nvos54Parameters, NV01_DEVICE_0, NV2080_CTRL_CMD_FB_GET_INFO,
    NV2080_CTRL_CMD_FB_GET_INFO_V2, NV2080_CTRL_FB_INFO_INDEX_HEAP_FREE,
    NV2080_CTRL_FB_INFO_INDEX_HEAP_SIZE, NV2080_CTRL_FB_INFO_INDEX_TOTAL_RAM_SIZE,
    NVOS32_FUNCTION_ALLOC_SIZE, NVOS32_FUNCTION_INFO, NV_ERR_NO_MEMORY, NV_OK,
    RM_PAGE_SIZE_INVALID,
};
use crate::shm::{FbInit, Reservation, SharedFbInfo, ShmRegion};
use crate::config::ShmConfig;
use crate::error::ShmError;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};
use std::ffi::c_void;
use std::mem::{align_of, size_of};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Verdict of the pre-call check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not a governed request; forward untouched
    Passthrough,
    /// Bytes reserved from the shared counter; forward, then settle
    Reserved { bytes: u64 },
    /// Reply already holds `NV_ERR_NO_MEMORY`; do not forward
    Reject,
}

/// Round `size` up to `alignment`, when one was requested
pub fn aligned_size(size: u64, alignment: u64) -> u64 {
    if alignment == RM_PAGE_SIZE_INVALID {
        return size;
    }
    size.saturating_add(alignment - 1) & !(alignment - 1)
}

fn pid_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Memory half of the governor
pub struct MemoryGovernor {
    limit: MemoryLimit,
    fb: ShmRegion<SharedFbInfo>,
    table: Mutex<AllocationTable>,
}

impl MemoryGovernor {
    /// Govern through an already mapped accounting region
    pub fn new(limit: MemoryLimit, fb: ShmRegion<SharedFbInfo>) -> Self {
        Self {
            limit,
            fb,
            table: Mutex::new(AllocationTable::new()),
        }
    }

    /// Create or join the accounting region for the limit's minor
    pub fn open(limit: MemoryLimit, shm: &ShmConfig, timeout: Duration) -> Result<Self, ShmError> {
        let init = FbInit {
            total: limit.bytes,
            owner_pid: getpid().as_raw(),
        };
        let fb = ShmRegion::<SharedFbInfo>::open(&shm.fb_path(limit.minor), &init, timeout)?;
        if !fb.created() && fb.total() != limit.bytes {
            log::warn!(
                "Memory region for minor {} already limits to {} bytes, ignoring {}",
                limit.minor,
                fb.total(),
                limit.bytes
            );
        }

        let governor = Self::new(limit, fb);
        log::info!(
            "Memory governed: {} (free {} bytes)",
            governor.limit,
            governor.fb.free()
        );
        Ok(governor)
    }

    /// Configured limit
    pub fn limit(&self) -> MemoryLimit {
        self.limit
    }

    /// Governed ceiling in bytes
    pub fn total(&self) -> u64 {
        self.fb.total()
    }

    /// Bytes still available
    pub fn free(&self) -> u64 {
        self.fb.free()
    }

    /// Bytes held by this process's live allocations
    pub fn allocated(&self) -> u64 {
        self.lock().allocated()
    }

    /// Number of this process's live allocations
    pub fn allocation_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, AllocationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn governs(&self, table: &AllocationTable, key: ObjectKey) -> bool {
        match table.device_of(key) {
            Some(device) => device == self.limit.minor,
            None => true,
        }
    }

    /// Free bytes as reported to the application
    pub fn reported_free(&self) -> u64 {
        self.fb.reported_free(pid_alive)
    }

    /// Admission check, run before the real ioctl
    ///
    /// # Safety
    /// `args` must be the argument the application passed for `req`.
    pub unsafe fn pre_ioctl(&self, minor: u32, req: &IoctlRequest, args: *mut c_void) -> Admission {
        if minor != NVIDIA_CTL_MINOR || req.nr != NV_ESC_RM_VID_HEAP_CONTROL {
            return Admission::Passthrough;
        }
        let Some(p) = params_mut::<Nvos32Parameters>(args, req.size) else {
            return Admission::Passthrough;
        };
        if p.function != NVOS32_FUNCTION_ALLOC_SIZE {
            return Admission::Passthrough;
        }
        if !self.governs(&self.lock(), ObjectKey::new(p.h_root, p.h_object_parent)) {
            return Admission::Passthrough;
        }

        let bytes = aligned_size(p.alloc_size.size, p.alloc_size.alignment);
        log::trace!(
            "alloc size {} align {} -> {}",
            p.alloc_size.size,
            p.alloc_size.alignment,
            bytes
        );

        match self.fb.try_reserve(bytes) {
            Reservation::Granted(_) => Admission::Reserved { bytes },
            Reservation::Denied(free) => {
                log::warn!("Rejecting allocation of {} bytes, {} free", bytes, free);
                p.status = NV_ERR_NO_MEMORY;
                p.total = self.fb.total();
                p.free = free;
                Admission::Reject
            }
        }
    }

    /// Hand back a reservation whose ioctl never completed
    pub fn cancel(&self, admission: Admission) {
        if let Admission::Reserved { bytes } = admission {
            self.fb.release(bytes);
        }
    }

    /// Accounting update, run after a successful real ioctl
    ///
    /// # Safety
    /// `args` must be the argument the application passed for `req`.
    pub unsafe fn post_ioctl(
        &self,
        minor: u32,
        req: &IoctlRequest,
        args: *mut c_void,
        admission: Admission,
    ) {
        if minor != NVIDIA_CTL_MINOR {
            self.cancel(admission);
            return;
        }

        match req.nr {
            NV_ESC_RM_VID_HEAP_CONTROL => self.post_vid_heap(req, args, admission),
            NV_ESC_RM_CONTROL => self.post_control(req, args),
            NV_ESC_RM_FREE => self.post_free(req, args),
            NV_ESC_RM_ALLOC => self.post_rm_alloc(req, args),
            nr => log::trace!("ioctl escape 0x{:x} size 0x{:x}", nr, req.size),
        }
    }

    unsafe fn post_vid_heap(&self, req: &IoctlRequest, args: *mut c_void, admission: Admission) {
        let Some(p) = params_mut::<Nvos32Parameters>(args, req.size) else {
            self.cancel(admission);
            return;
        };

        match p.function {
            NVOS32_FUNCTION_ALLOC_SIZE => {
                let Admission::Reserved { bytes } = admission else {
                    return;
                };
                if p.status != NV_OK {
                    self.fb.release(bytes);
                    return;
                }

                let key = ObjectKey::new(p.h_root, p.alloc_size.h_memory);
                if let Some(stale) = self.lock().insert_memory(key, bytes) {
                    log::debug!("Handle 0x{:x} reused without a free", key.handle);
                    self.fb.release(stale);
                }
                p.total = self.fb.total();
                p.free = self.fb.free();
                log::debug!(
                    "Allocated 0x{:x}: {} bytes, {} free",
                    key.handle,
                    bytes,
                    p.free
                );
            }
            NVOS32_FUNCTION_INFO => {
                if p.status != NV_OK {
                    return;
                }
                if !self.governs(&self.lock(), ObjectKey::new(p.h_root, p.h_object_parent)) {
                    return;
                }
                p.total = self.fb.total();
                p.free = self.reported_free();
            }
            _ => self.cancel(admission),
        }
    }

    unsafe fn post_control(&self, req: &IoctlRequest, args: *mut c_void) {
        let Some(p) = params_mut::<Nvos54Parameters>(args, req.size) else {
            return;
        };
        if p.status != NV_OK {
            return;
        }
        if p.cmd != NV2080_CTRL_CMD_FB_GET_INFO && p.cmd != NV2080_CTRL_CMD_FB_GET_INFO_V2 {
            log::trace!("rm control cmd 0x{:x}", p.cmd);
            return;
        }
        if !self.governs(&self.lock(), ObjectKey::new(p.h_client, p.h_object)) {
            return;
        }

        let free = self.reported_free();
        let list = if p.cmd == NV2080_CTRL_CMD_FB_GET_INFO {
            fb_info_list(p.params, p.params_size)
        } else {
            fb_info_list_inline(p.params, p.params_size)
        };
        if let Some(list) = list {
            rewrite_fb_info(list, self.fb.total(), free);
        }
    }

    unsafe fn post_free(&self, req: &IoctlRequest, args: *mut c_void) {
        let Some(p) = params_mut::<Nvos00Parameters>(args, req.size) else {
            return;
        };
        // Freeing the client root is not a memory release.
        if p.status != NV_OK || p.h_object_old == p.h_root {
            return;
        }

        let key = ObjectKey::new(p.h_root, p.h_object_old);
        let released = {
            let mut table = self.lock();
            table.remove_object(key);
            table.remove_memory(key)
        };
        if let Some(bytes) = released {
            let free = self.fb.release(bytes);
            log::debug!("Freed 0x{:x}: {} bytes, {} free", key.handle, bytes, free);
        }
    }

    unsafe fn post_rm_alloc(&self, req: &IoctlRequest, args: *mut c_void) {
        let Some(alloc) = decode_rm_alloc(args, req.size) else {
            return;
        };
        if alloc.status != NV_OK {
            return;
        }

        let mut table = self.lock();
        let device = if alloc.h_class == NV01_DEVICE_0 {
            read_device_id(alloc.p_alloc_parms, alloc.params_size)
        } else {
            table.device_of(ObjectKey::new(alloc.h_root, alloc.h_object_parent))
        };

        if let Some(device) = device {
            log::trace!(
                "Object 0x{:x} class 0x{:x} on device {}",
                alloc.h_object_new,
                alloc.h_class,
                device
            );
            table.insert_object(ObjectKey::new(alloc.h_root, alloc.h_object_new), device);
        }
    }
}

/// `deviceId` is the first field of the device class allocation parameters
unsafe fn read_device_id(params: u64, params_size: u32) -> Option<u32> {
    let ptr = params as *const u32;
    if ptr.is_null() || (params_size as usize) < size_of::<u32>() {
        return None;
    }
    Some(ptr.read_unaligned())
}

/// Info list passed by pointer
unsafe fn fb_info_list<'a>(params: u64, params_size: u32) -> Option<&'a mut [Nv2080CtrlFbInfo]> {
    let head = params_mut::<Nv2080CtrlFbGetInfoParams>(params as *mut c_void, params_size as usize)?;
    let list = head.fb_info_list as *mut Nv2080CtrlFbInfo;
    if list.is_null() || (list as usize) % align_of::<Nv2080CtrlFbInfo>() != 0 {
        return None;
    }
    Some(std::slice::from_raw_parts_mut(list, head.fb_info_list_size as usize))
}

/// Info list stored inline after the count, bounded by the block size
unsafe fn fb_info_list_inline<'a>(
    params: u64,
    params_size: u32,
) -> Option<&'a mut [Nv2080CtrlFbInfo]> {
    let count = params_mut::<u32>(params as *mut c_void, params_size as usize)?;
    let capacity = (params_size as usize - size_of::<u32>()) / size_of::<Nv2080CtrlFbInfo>();
    let len = (*count as usize).min(capacity);
    let list = (params as *mut u8).add(size_of::<u32>()) as *mut Nv2080CtrlFbInfo;
    Some(std::slice::from_raw_parts_mut(list, len))
}

fn rewrite_fb_info(list: &mut [Nv2080CtrlFbInfo], total: u64, free: u64) {
    let to_kib = |bytes: u64| u32::try_from(bytes >> 10).unwrap_or(u32::MAX);
    for info in list {
        match info.index {
            NV2080_CTRL_FB_INFO_INDEX_TOTAL_RAM_SIZE | NV2080_CTRL_FB_INFO_INDEX_HEAP_SIZE => {
                info.data = to_kib(total)
            }
            NV2080_CTRL_FB_INFO_INDEX_HEAP_FREE => info.data = to_kib(free),
            _ => {}
        }
    }
}
