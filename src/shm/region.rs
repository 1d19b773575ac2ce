//! Named shared memory regions
//!
//! A region is created by exactly one process: `shm_open(O_CREAT | O_EXCL)`
//! elects the creator, which sizes the object, lays out the contents and
//! finally publishes a magic value with release ordering. Every other process
//! attaches and waits until both the object size and the magic are visible.

use crate::error::ShmError;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Contents of a shared region
///
/// # Safety
/// Implementors must be `#[repr(C)]`, valid when zero-filled, and only
/// mutated through interior mutability that is sound across processes
/// (atomics, process-shared semaphores).
pub unsafe trait SharedLayout: Sized + Sync {
    /// Value published once the creator finished [`SharedLayout::init`]
    const MAGIC: u64;

    /// Parameters the creator lays the region out with
    type Init;

    /// The readiness word
    fn magic(&self) -> &AtomicU64;

    /// Lay out a zero-filled region
    ///
    /// # Safety
    /// Runs exactly once, in the creating process, before the magic is
    /// published.
    unsafe fn init(&self, init: &Self::Init) -> Result<(), ShmError>;
}

/// A mapped shared region holding one `T`
pub struct ShmRegion<T: SharedLayout> {
    ptr: NonNull<T>,
    name: Option<String>,
    created: bool,
    _marker: PhantomData<T>,
}

// SAFETY: T is Sync and every access goes through &T.
unsafe impl<T: SharedLayout> Send for ShmRegion<T> {}
unsafe impl<T: SharedLayout> Sync for ShmRegion<T> {}

impl<T: SharedLayout> ShmRegion<T> {
    fn len() -> NonZeroUsize {
        NonZeroUsize::new(size_of::<T>()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Create the named region, or attach to it if another process did
    pub fn open(name: &str, init: &T::Init, timeout: Duration) -> Result<Self, ShmError> {
        validate_name(name)?;
        let deadline = Instant::now() + timeout;

        loop {
            match shm_open(
                name,
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                Mode::from_bits_truncate(0o666),
            ) {
                Ok(fd) => return Self::create(name, fd, init),
                Err(Errno::EEXIST) => {}
                Err(source) => {
                    return Err(ShmError::Open {
                        name: name.to_string(),
                        source,
                    })
                }
            }

            match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
                Ok(fd) => return Self::attach(name, fd, deadline),
                // The creator went away between our two opens; race again.
                Err(Errno::ENOENT) if Instant::now() < deadline => continue,
                Err(source) => {
                    return Err(ShmError::Open {
                        name: name.to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Map a fresh anonymous shared region
    ///
    /// The mapping is shared with children forked afterwards and with every
    /// thread of this process.
    pub fn anonymous(init: &T::Init) -> Result<Self, ShmError> {
        let name = "<anonymous>";
        // SAFETY: a new anonymous mapping aliases nothing.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                Self::len(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;

        let region = Self::from_raw(ptr, None, true);
        region.publish(init)?;
        Ok(region)
    }

    /// Remove a named region; existing mappings stay valid
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        shm_unlink(name).map_err(|source| ShmError::Open {
            name: name.to_string(),
            source,
        })
    }

    /// Whether this process laid out the region
    pub fn created(&self) -> bool {
        self.created
    }

    /// Name of the backing shm object
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn create(name: &str, fd: OwnedFd, init: &T::Init) -> Result<Self, ShmError> {
        ftruncate(&fd, size_of::<T>() as libc::off_t).map_err(|source| ShmError::Truncate {
            name: name.to_string(),
            source,
        })?;

        let region = Self::map(name, &fd, true)?;
        region.publish(init)?;
        log::debug!("Created shared region {} ({} bytes)", name, size_of::<T>());
        Ok(region)
    }

    fn attach(name: &str, fd: OwnedFd, deadline: Instant) -> Result<Self, ShmError> {
        let want = size_of::<T>() as i64;
        loop {
            let st = fstat(fd.as_raw_fd()).map_err(|source| ShmError::Open {
                name: name.to_string(),
                source,
            })?;
            if st.st_size >= want {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ShmError::NotReady(name.to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let region = Self::map(name, &fd, false)?;
        while region.magic().load(Ordering::Acquire) != T::MAGIC {
            if Instant::now() >= deadline {
                return Err(ShmError::NotReady(name.to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        log::debug!("Attached to shared region {}", name);
        Ok(region)
    }

    fn map(name: &str, fd: &OwnedFd, created: bool) -> Result<Self, ShmError> {
        // SAFETY: the object is at least size_of::<T>() bytes long and the
        // mapping is released in Drop.
        let ptr = unsafe {
            mmap(
                None,
                Self::len(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;

        Ok(Self::from_raw(ptr, Some(name.to_string()), created))
    }

    fn from_raw(ptr: NonNull<c_void>, name: Option<String>, created: bool) -> Self {
        Self {
            ptr: ptr.cast(),
            name,
            created,
            _marker: PhantomData,
        }
    }

    fn publish(&self, init: &T::Init) -> Result<(), ShmError> {
        // SAFETY: only the creator reaches this, before the magic is set.
        unsafe { self.init(init)? };
        self.magic().store(T::MAGIC, Ordering::Release);
        Ok(())
    }
}

impl<T: SharedLayout> Deref for ShmRegion<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping lives as long as self and T is valid when
        // zero-filled, so every byte pattern a peer can leave is readable.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: SharedLayout> Drop for ShmRegion<T> {
    fn drop(&mut self) {
        // SAFETY: ptr came from mmap with this length and no &T outlives self.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), size_of::<T>()) } {
            log::warn!("munmap of {:?} failed: {}", self.name, e);
        }
    }
}

fn validate_name(name: &str) -> Result<(), ShmError> {
    let valid = name.len() > 1
        && name.len() < 255
        && name.starts_with('/')
        && !name[1..].contains('/');
    if valid {
        Ok(())
    } else {
        Err(ShmError::InvalidName(name.to_string()))
    }
}
