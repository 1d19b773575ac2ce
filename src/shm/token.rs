//! Per-minor, per-cgroup compute token region
//!
//! Shared between the hooked processes of one cgroup and its monitor. The
//! monitor publishes token rates; every refill thread consumes them. Each
//! publication bumps `version`, and a consumer remembers the last version it
//! applied, so it can tell how many publications it never saw.

use crate::error::ShmError;
use crate::shm::region::SharedLayout;
use crate::shm::semaphore::SharedSemaphore;

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const STATE_FRESH: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

/// Token rate parameters and launch statistics
#[repr(C)]
pub struct TokenParam {
    core_limit: AtomicI32,
    add_per_cycle: AtomicI32,
    mod_times: AtomicI32,
    avg_launches: [AtomicI32; 2],
    launch_idx: AtomicU32,
}

/// Shared token state for one GPU minor and cgroup
#[repr(C)]
pub struct TokenAttr {
    magic: AtomicU64,
    ready: SharedSemaphore,
    state: AtomicU32,
    _pad: u32,
    wait_interval_ns: AtomicU64,
    version: AtomicU64,
    acked: AtomicU64,
    params: TokenParam,
}

/// Parameters a consumer picked up from a publication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUpdate {
    /// Version applied
    pub version: u64,
    /// Publications overwritten before this consumer observed them
    pub skipped: u64,
    /// Tokens to post per refill cycle
    pub add_per_cycle: u32,
    /// Refill interval
    pub wait_interval: Duration,
}

unsafe impl SharedLayout for TokenAttr {
    const MAGIC: u64 = 0x4342_5f54_4f4b_0001;
    type Init = ();

    fn magic(&self) -> &AtomicU64 {
        &self.magic
    }

    unsafe fn init(&self, _: &()) -> Result<(), ShmError> {
        self.ready.init(0)
    }
}

impl TokenAttr {
    /// Whether rate parameters have been written
    pub fn is_inited(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Write the initial parameters if nobody has yet
    ///
    /// Returns `false` when another process already initialized (or is
    /// initializing) the region.
    pub fn initialize(&self, core_limit: u32, wait_interval: Duration) -> Result<bool, ShmError> {
        if self
            .state
            .compare_exchange(
                STATE_FRESH,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }

        let p = &self.params;
        p.core_limit.store(core_limit as i32, Ordering::Relaxed);
        p.add_per_cycle.store(1, Ordering::Relaxed);
        p.mod_times.store(0, Ordering::Relaxed);
        p.avg_launches[0].store(0, Ordering::Relaxed);
        p.avg_launches[1].store(0, Ordering::Relaxed);
        p.launch_idx.store(0, Ordering::Relaxed);
        self.wait_interval_ns
            .store(wait_interval.as_nanos() as u64, Ordering::Relaxed);

        self.state.store(STATE_READY, Ordering::Release);
        self.publish();
        self.ready.post()?;
        Ok(true)
    }

    /// Block until the region has parameters
    ///
    /// Every woken waiter posts the readiness semaphore again, so all late
    /// joiners wake, not only the first.
    pub fn wait_ready(&self) -> Result<(), ShmError> {
        if self.is_inited() {
            return Ok(());
        }
        self.ready.wait()?;
        self.ready.post()
    }

    /// Adopt a new core limit, rescaling the rate proportionally
    ///
    /// Returns whether the limit changed.
    pub fn retarget(&self, core_limit: u32) -> bool {
        let p = &self.params;
        let old = p.core_limit.load(Ordering::Acquire);
        let new = core_limit as i32;
        if old == new {
            return false;
        }

        let add = p.add_per_cycle.load(Ordering::Acquire) as i64;
        let scaled = if old > 0 { add * new as i64 / old as i64 } else { add };
        p.add_per_cycle.store(scaled.max(1) as i32, Ordering::Release);
        p.core_limit.store(new, Ordering::Release);
        p.mod_times.store(0, Ordering::Release);
        log::info!(
            "Core limit changed {} -> {}, add_per_cycle {} -> {}",
            old,
            new,
            add,
            scaled.max(1)
        );
        true
    }

    /// Announce that parameters changed; returns the new version
    pub fn publish(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether a publication has not been consumed yet
    pub fn pending(&self) -> bool {
        self.version.load(Ordering::Acquire) != self.acked.load(Ordering::Acquire)
    }

    /// Latest published version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Pick up the current parameters if they are newer than `seen`
    pub fn consume(&self, seen: u64) -> Option<TokenUpdate> {
        let version = self.version.load(Ordering::Acquire);
        if version == seen {
            return None;
        }

        let update = TokenUpdate {
            version,
            skipped: version.saturating_sub(seen).saturating_sub(1),
            add_per_cycle: self.add_per_cycle(),
            wait_interval: self.wait_interval(),
        };
        self.acked.fetch_max(version, Ordering::AcqRel);
        Some(update)
    }

    /// Refill interval published by the initializer
    pub fn wait_interval(&self) -> Duration {
        Duration::from_nanos(self.wait_interval_ns.load(Ordering::Acquire))
    }

    /// Configured core limit
    pub fn core_limit(&self) -> u32 {
        self.params.core_limit.load(Ordering::Acquire).max(0) as u32
    }

    /// Tokens posted per refill cycle
    pub fn add_per_cycle(&self) -> u32 {
        self.params.add_per_cycle.load(Ordering::Acquire).max(1) as u32
    }

    /// Store a new token rate (not yet published)
    pub fn set_add_per_cycle(&self, value: u32) {
        self.params
            .add_per_cycle
            .store(value.max(1) as i32, Ordering::Release);
    }

    /// Advance the controller tick counter, returning the new count
    pub fn tick(&self) -> i32 {
        self.params.mod_times.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Controller tick counter
    pub fn mod_times(&self) -> i32 {
        self.params.mod_times.load(Ordering::Acquire)
    }

    /// Store this cycle's rolling average of launches and advance the slot
    pub fn record_average(&self, avg: u32) {
        let p = &self.params;
        let idx = p.launch_idx.load(Ordering::Acquire);
        p.avg_launches[(idx % 2) as usize].store(avg as i32, Ordering::Release);
        p.launch_idx.store(idx.wrapping_add(1), Ordering::Release);
    }

    /// The two most recent rolling averages, newest first
    pub fn averages(&self) -> (u32, u32) {
        let p = &self.params;
        let idx = p.launch_idx.load(Ordering::Acquire);
        let newest = p.avg_launches[(idx.wrapping_add(1) % 2) as usize].load(Ordering::Acquire);
        let previous = p.avg_launches[(idx % 2) as usize].load(Ordering::Acquire);
        (newest.max(0) as u32, previous.max(0) as u32)
    }
}
