//! Per-minor memory accounting region
//!
//! Every governed process on one GPU minor debits and credits the same
//! `free` counter. Updates are compare-and-swap loops that saturate at zero
//! and at `total`, so concurrent processes never tear the counter and it
//! never leaves `0..=total`.

use crate::error::ShmError;
use crate::shm::region::SharedLayout;

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Creator parameters: ceiling in bytes and owning pid
#[derive(Debug, Clone, Copy)]
pub struct FbInit {
    pub total: u64,
    pub owner_pid: i32,
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The bytes were debited; holds the new free value
    Granted(u64),
    /// Not enough free memory; holds the free value observed
    Denied(u64),
}

/// Shared total/free memory for one GPU minor
#[repr(C)]
pub struct SharedFbInfo {
    magic: AtomicU64,
    owner_pid: AtomicI32,
    _pad: u32,
    total: AtomicU64,
    free: AtomicU64,
}

unsafe impl SharedLayout for SharedFbInfo {
    const MAGIC: u64 = 0x4342_5f46_425f_0001;
    type Init = FbInit;

    fn magic(&self) -> &AtomicU64 {
        &self.magic
    }

    unsafe fn init(&self, init: &FbInit) -> Result<(), ShmError> {
        self.owner_pid.store(init.owner_pid, Ordering::Relaxed);
        self.total.store(init.total, Ordering::Relaxed);
        self.free.store(init.total, Ordering::Relaxed);
        Ok(())
    }
}

impl SharedFbInfo {
    /// Governed ceiling in bytes
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Bytes still available under the ceiling
    pub fn free(&self) -> u64 {
        self.free.load(Ordering::Acquire)
    }

    /// Pid of the process that last took ownership of the counter
    pub fn owner_pid(&self) -> i32 {
        self.owner_pid.load(Ordering::Acquire)
    }

    /// Check-and-debit in one step
    pub fn try_reserve(&self, bytes: u64) -> Reservation {
        let mut current = self.free();
        loop {
            if current < bytes {
                return Reservation::Denied(current);
            }
            match self.free.compare_exchange_weak(
                current,
                current - bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Reservation::Granted(current - bytes),
                Err(observed) => current = observed,
            }
        }
    }

    /// Debit an allocation the driver already granted, saturating at zero
    pub fn consume(&self, bytes: u64) -> u64 {
        self.update(|free, _| free.saturating_sub(bytes))
    }

    /// Credit freed bytes back, saturating at the ceiling
    pub fn release(&self, bytes: u64) -> u64 {
        self.update(|free, total| free.saturating_add(bytes).min(total))
    }

    /// Free bytes to report to the application
    ///
    /// While the recorded owner is alive this is the shared counter. Once the
    /// owner has exited the counter may hold debits nobody will credit back,
    /// so free is unknown and the full ceiling is reported. The counter
    /// itself is never rewritten here.
    pub fn reported_free(&self, is_alive: impl Fn(i32) -> bool) -> u64 {
        let owner = self.owner_pid();
        if owner != 0 && !is_alive(owner) {
            log::debug!("Owner pid {} exited, reporting free as unbounded", owner);
            return self.total();
        }
        self.free()
    }

    fn update(&self, f: impl Fn(u64, u64) -> u64) -> u64 {
        let total = self.total();
        let mut current = self.free();
        loop {
            let next = f(current, total);
            match self
                .free
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRegion;
    use std::sync::Arc;

    const GIB: u64 = 1 << 30;

    fn region(total: u64) -> ShmRegion<SharedFbInfo> {
        ShmRegion::anonymous(&FbInit {
            total,
            owner_pid: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_reserve_within_and_beyond_limit() {
        let fb = region(GIB);
        assert_eq!(fb.try_reserve(GIB / 2), Reservation::Granted(GIB / 2));
        assert_eq!(fb.try_reserve(GIB), Reservation::Denied(GIB / 2));
        assert_eq!(fb.free(), GIB / 2);
    }

    #[test]
    fn test_counter_saturates() {
        let fb = region(100);
        assert_eq!(fb.consume(150), 0);
        assert_eq!(fb.release(40), 40);
        assert_eq!(fb.release(500), 100);
        assert!(fb.free() <= fb.total());
    }

    #[test]
    fn test_concurrent_updates_balance() {
        let fb = Arc::new(region(GIB));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fb = Arc::clone(&fb);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        fb.consume(4096);
                        fb.release(4096);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fb.free(), GIB);
    }

    #[test]
    fn test_dead_owner_reports_unbounded_free() {
        let fb = region(1000);
        // A peer and this process both hold debits.
        assert_eq!(fb.try_reserve(200), Reservation::Granted(800));
        assert_eq!(fb.try_reserve(100), Reservation::Granted(700));

        assert_eq!(fb.reported_free(|_| true), 700);
        assert_eq!(fb.reported_free(|_| false), 1000);

        // The shared counter keeps every live debit.
        assert_eq!(fb.free(), 700);
        assert_eq!(fb.owner_pid(), 1);
        assert_eq!(fb.release(100), 800);
    }

    #[test]
    fn test_unknown_owner_reports_counter() {
        let fb: ShmRegion<SharedFbInfo> = ShmRegion::anonymous(&FbInit {
            total: 1000,
            owner_pid: 0,
        })
        .unwrap();
        fb.consume(300);
        assert_eq!(fb.reported_free(|_| false), 700);
    }
}
