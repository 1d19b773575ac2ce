//! ioctl request decoding for the NVIDIA character devices
//!
//! Requests are built with the Linux `_IOC` encoding; the escape number sits
//! in the low byte and the parameter size in bits 16..30.

/// Character device major of /dev/nvidia*
pub const NVIDIA_DEVICE_MAJOR: u32 = 195;

/// Minor of /dev/nvidiactl, which carries every resource-manager escape
pub const NVIDIA_CTL_MINOR: u32 = 0xFF;

/// ioctl type byte used by the driver ('F')
pub const NV_IOCTL_MAGIC: u8 = b'F';

/// Free a resource-manager object
pub const NV_ESC_RM_FREE: u8 = 0x29;
/// Issue a resource-manager control call
pub const NV_ESC_RM_CONTROL: u8 = 0x2A;
/// Allocate a resource-manager object
pub const NV_ESC_RM_ALLOC: u8 = 0x2B;
/// Video heap control (framebuffer allocation)
pub const NV_ESC_RM_VID_HEAP_CONTROL: u8 = 0x4A;

const IOC_NRBITS: u64 = 8;
const IOC_TYPEBITS: u64 = 8;
const IOC_SIZEBITS: u64 = 14;
const IOC_TYPESHIFT: u64 = IOC_NRBITS;
const IOC_SIZESHIFT: u64 = IOC_TYPESHIFT + IOC_TYPEBITS;

/// Decoded ioctl request number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlRequest {
    /// Raw request value
    pub raw: u64,
    /// Escape (command) number
    pub nr: u8,
    /// ioctl type byte
    pub kind: u8,
    /// Size of the parameter block in bytes
    pub size: usize,
}

impl IoctlRequest {
    /// Decode a raw request value
    pub const fn decode(raw: u64) -> Self {
        Self {
            raw,
            nr: (raw & ((1 << IOC_NRBITS) - 1)) as u8,
            kind: ((raw >> IOC_TYPESHIFT) & ((1 << IOC_TYPEBITS) - 1)) as u8,
            size: ((raw >> IOC_SIZESHIFT) & ((1 << IOC_SIZEBITS) - 1)) as usize,
        }
    }

    /// Build a read/write request the way the driver's user-mode library does
    pub const fn readwrite(nr: u8, size: usize) -> Self {
        const IOC_READ_WRITE: u64 = 3;
        let raw = (IOC_READ_WRITE << 30)
            | ((size as u64) << IOC_SIZESHIFT)
            | ((NV_IOCTL_MAGIC as u64) << IOC_TYPESHIFT)
            | nr as u64;
        Self::decode(raw)
    }

    /// Whether this request is one the accounting engine decodes
    pub fn is_governed(&self) -> bool {
        matches!(
            self.nr,
            NV_ESC_RM_FREE | NV_ESC_RM_CONTROL | NV_ESC_RM_ALLOC | NV_ESC_RM_VID_HEAP_CONTROL
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_vid_heap_control() {
        // read/write, 0xb8 bytes, type 'F', escape 0x4a
        let req = IoctlRequest::decode(0xc0b8_464a);
        assert_eq!(req.nr, NV_ESC_RM_VID_HEAP_CONTROL);
        assert_eq!(req.kind, NV_IOCTL_MAGIC);
        assert_eq!(req.size, 0xb8);
        assert!(req.is_governed());
    }

    #[test]
    fn test_readwrite_roundtrip() {
        let req = IoctlRequest::readwrite(NV_ESC_RM_FREE, 16);
        assert_eq!(req.nr, NV_ESC_RM_FREE);
        assert_eq!(req.size, 16);
        assert_eq!(IoctlRequest::decode(req.raw), req);
    }

    #[test]
    fn test_ungoverned_escape() {
        let req = IoctlRequest::readwrite(0x2c, 8);
        assert!(!req.is_governed());
    }
}
