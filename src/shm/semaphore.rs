//! Process-shared POSIX semaphore
//!
//! A `sem_t` embedded in a shared mapping. Every wait restarts on `EINTR`.

use crate::error::ShmError;

use nix::errno::Errno;
use std::cell::UnsafeCell;

/// Counting semaphore that lives inside a shared region
#[repr(transparent)]
pub struct SharedSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

// SAFETY: sem_t is designed for concurrent use from multiple threads and, once
// initialized with pshared = 1, from multiple processes.
unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    fn as_ptr(&self) -> *mut libc::sem_t {
        self.inner.get()
    }

    /// Initialize the semaphore for use across processes
    ///
    /// # Safety
    /// Must be called exactly once, before any other process can observe the
    /// region, and never on a semaphore that has waiters.
    pub unsafe fn init(&self, value: u32) -> Result<(), ShmError> {
        if libc::sem_init(self.as_ptr(), 1, value) == -1 {
            return Err(ShmError::Semaphore(Errno::last()));
        }
        Ok(())
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) -> Result<(), ShmError> {
        loop {
            // SAFETY: the semaphore was initialized by the region creator.
            if unsafe { libc::sem_wait(self.as_ptr()) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(ShmError::Semaphore(e)),
            }
        }
    }

    /// Decrement the count if it is positive, without blocking
    pub fn try_wait(&self) -> Result<bool, ShmError> {
        loop {
            // SAFETY: see `wait`.
            if unsafe { libc::sem_trywait(self.as_ptr()) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EAGAIN => return Ok(false),
                e => return Err(ShmError::Semaphore(e)),
            }
        }
    }

    /// Increment the count, waking one waiter
    pub fn post(&self) -> Result<(), ShmError> {
        // SAFETY: see `wait`.
        if unsafe { libc::sem_post(self.as_ptr()) } == -1 {
            return Err(ShmError::Semaphore(Errno::last()));
        }
        Ok(())
    }

    /// Current count
    pub fn value(&self) -> Result<i32, ShmError> {
        let mut value = 0;
        // SAFETY: see `wait`.
        if unsafe { libc::sem_getvalue(self.as_ptr(), &mut value) } == -1 {
            return Err(ShmError::Semaphore(Errno::last()));
        }
        Ok(value)
    }
}
