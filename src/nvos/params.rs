//! Resource-manager parameter blocks
//!
//! Layouts mirror the driver's `NVOS*` structures. Only the prefix the
//! governor reads or writes is declared; a block is decoded when the size
//! embedded in the request covers at least that prefix, so newer driver
//! versions that append fields keep working.

use std::ffi::c_void;
use std::mem::{align_of, size_of};

/// Driver object handle, unique within one client
pub type NvHandle = u32;

/// Success status
pub const NV_OK: u32 = 0x0000_0000;
/// Out of memory status synthesized on admission rejection
pub const NV_ERR_NO_MEMORY: u32 = 0x0000_0051;

/// Heap function: allocate by size
pub const NVOS32_FUNCTION_ALLOC_SIZE: u32 = 2;
/// Heap function: query heap total/free
pub const NVOS32_FUNCTION_INFO: u32 = 5;

/// Alignment value meaning "none requested"
pub const RM_PAGE_SIZE_INVALID: u64 = 0;

/// Device object class
pub const NV01_DEVICE_0: u32 = 0x0000_0080;
/// Subdevice object class
pub const NV20_SUBDEVICE_0: u32 = 0x0000_2080;

/// Control command: framebuffer info, list passed by pointer
pub const NV2080_CTRL_CMD_FB_GET_INFO: u32 = 0x2080_1301;
/// Control command: framebuffer info, list inline
pub const NV2080_CTRL_CMD_FB_GET_INFO_V2: u32 = 0x2080_1303;

/// Framebuffer info index: total RAM, in KiB
pub const NV2080_CTRL_FB_INFO_INDEX_TOTAL_RAM_SIZE: u32 = 0x08;
/// Framebuffer info index: heap size, in KiB
pub const NV2080_CTRL_FB_INFO_INDEX_HEAP_SIZE: u32 = 0x09;
/// Framebuffer info index: free heap, in KiB
pub const NV2080_CTRL_FB_INFO_INDEX_HEAP_FREE: u32 = 0x1A;

/// `NVOS32_FUNCTION_ALLOC_SIZE` member of the heap control union
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvos32AllocSize {
    pub owner: u32,
    pub h_memory: NvHandle,
    pub kind: u32,
    pub flags: u32,
    pub attr: u32,
    pub format: u32,
    pub compr_covg: u32,
    pub zcull_covg: u32,
    pub partition_stride: u32,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub alignment: u64,
    pub offset: u64,
    pub limit: u64,
    pub address: u64,
    pub range_begin: u64,
    pub range_end: u64,
    pub attr2: u32,
    pub ctag_offset: u32,
}

/// `NVOS32_PARAMETERS`: video heap control
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvos32Parameters {
    pub h_root: NvHandle,
    pub h_object_parent: NvHandle,
    pub function: u32,
    pub h_va_space: NvHandle,
    pub ivc_heap_number: i16,
    pub status: u32,
    pub total: u64,
    pub free: u64,
    pub alloc_size: Nvos32AllocSize,
}

/// `NVOS00_PARAMETERS`: object free
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvos00Parameters {
    pub h_root: NvHandle,
    pub h_object_parent: NvHandle,
    pub h_object_old: NvHandle,
    pub status: u32,
}

/// `NVOS54_PARAMETERS`: control call
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvos54Parameters {
    pub h_client: NvHandle,
    pub h_object: NvHandle,
    pub cmd: u32,
    pub flags: u32,
    pub params: u64,
    pub params_size: u32,
    pub status: u32,
}

/// `NVOS21_PARAMETERS`: object allocation
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvos21Parameters {
    pub h_root: NvHandle,
    pub h_object_parent: NvHandle,
    pub h_object_new: NvHandle,
    pub h_class: u32,
    pub p_alloc_parms: u64,
    pub params_size: u32,
    pub status: u32,
}

/// `NVOS64_PARAMETERS`: object allocation with access rights
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nvos64Parameters {
    pub h_root: NvHandle,
    pub h_object_parent: NvHandle,
    pub h_object_new: NvHandle,
    pub h_class: u32,
    pub p_alloc_parms: u64,
    pub p_rights_requested: u64,
    pub params_size: u32,
    pub flags: u32,
    pub status: u32,
}

/// One framebuffer info entry
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Nv2080CtrlFbInfo {
    pub index: u32,
    pub data: u32,
}

/// `NV2080_CTRL_FB_GET_INFO_PARAMS`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Nv2080CtrlFbGetInfoParams {
    pub fb_info_list_size: u32,
    pub fb_info_list: u64,
}

/// Fields shared by both object allocation layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmAlloc {
    pub h_root: NvHandle,
    pub h_object_parent: NvHandle,
    pub h_object_new: NvHandle,
    pub h_class: u32,
    pub p_alloc_parms: u64,
    pub params_size: u32,
    pub status: u32,
}

impl From<&Nvos21Parameters> for RmAlloc {
    fn from(p: &Nvos21Parameters) -> Self {
        Self {
            h_root: p.h_root,
            h_object_parent: p.h_object_parent,
            h_object_new: p.h_object_new,
            h_class: p.h_class,
            p_alloc_parms: p.p_alloc_parms,
            params_size: p.params_size,
            status: p.status,
        }
    }
}

impl From<&Nvos64Parameters> for RmAlloc {
    fn from(p: &Nvos64Parameters) -> Self {
        Self {
            h_root: p.h_root,
            h_object_parent: p.h_object_parent,
            h_object_new: p.h_object_new,
            h_class: p.h_class,
            p_alloc_parms: p.p_alloc_parms,
            params_size: p.params_size,
            status: p.status,
        }
    }
}

/// Decode an object allocation block of either layout
///
/// # Safety
/// `args` must be null or point to at least `size` readable bytes.
pub unsafe fn decode_rm_alloc(args: *mut c_void, size: usize) -> Option<RmAlloc> {
    if size >= size_of::<Nvos64Parameters>() {
        params_mut::<Nvos64Parameters>(args, size).map(|p| RmAlloc::from(&*p))
    } else {
        params_mut::<Nvos21Parameters>(args, size).map(|p| RmAlloc::from(&*p))
    }
}

/// View an ioctl argument as a parameter block
///
/// Returns `None` when the pointer is null, misaligned or the block is
/// smaller than `T`.
///
/// # Safety
/// `args` must be null or point to at least `size` bytes that stay valid and
/// unaliased for the returned lifetime.
pub unsafe fn params_mut<'a, T>(args: *mut c_void, size: usize) -> Option<&'a mut T> {
    if args.is_null() || size < size_of::<T>() || (args as usize) % align_of::<T>() != 0 {
        return None;
    }
    Some(&mut *(args as *mut T))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_nvos32_layout() {
        assert_eq!(offset_of!(Nvos32Parameters, status), 20);
        assert_eq!(offset_of!(Nvos32Parameters, total), 24);
        assert_eq!(offset_of!(Nvos32Parameters, free), 32);
        assert_eq!(offset_of!(Nvos32Parameters, alloc_size), 40);
        assert_eq!(offset_of!(Nvos32AllocSize, size), 48);
        assert_eq!(offset_of!(Nvos32AllocSize, alignment), 56);
    }

    #[test]
    fn test_fixed_block_sizes() {
        assert_eq!(size_of::<Nvos00Parameters>(), 16);
        assert_eq!(size_of::<Nvos54Parameters>(), 32);
        assert_eq!(size_of::<Nvos21Parameters>(), 32);
        assert_eq!(size_of::<Nvos64Parameters>(), 48);
        assert_eq!(size_of::<Nv2080CtrlFbGetInfoParams>(), 16);
    }

    #[test]
    fn test_params_mut_rejects_short_blocks() {
        let mut block = Nvos00Parameters::default();
        let ptr = &mut block as *mut _ as *mut c_void;
        unsafe {
            assert!(params_mut::<Nvos00Parameters>(ptr, 8).is_none());
            assert!(params_mut::<Nvos00Parameters>(std::ptr::null_mut(), 16).is_none());
            let p = params_mut::<Nvos00Parameters>(ptr, 16).unwrap();
            p.h_object_old = 7;
        }
        assert_eq!(block.h_object_old, 7);
    }

    #[test]
    fn test_decode_rm_alloc_by_size() {
        let mut small = Nvos21Parameters {
            h_object_new: 5,
            h_class: NV01_DEVICE_0,
            ..Default::default()
        };
        let decoded = unsafe { decode_rm_alloc(&mut small as *mut _ as *mut c_void, 32) }.unwrap();
        assert_eq!(decoded.h_object_new, 5);
        assert_eq!(decoded.h_class, NV01_DEVICE_0);

        let mut large = Nvos64Parameters {
            h_object_new: 9,
            status: NV_OK,
            ..Default::default()
        };
        let decoded = unsafe { decode_rm_alloc(&mut large as *mut _ as *mut c_void, 48) }.unwrap();
        assert_eq!(decoded.h_object_new, 9);
    }
}
