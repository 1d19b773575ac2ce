//! Kernel launch admission

use crate::config::Config;
use crate::domain::CoreLimit;
use crate::error::{ShmError, ThrottleError};
use crate::shm::{ShmRegion, TokenAttr};
use crate::throttle::bucket::TokenBucket;
use crate::throttle::refill::Refill;

use std::ffi::c_int;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Status returned from a launch hook when the token wait itself failed
///
/// Outside the range of driver result codes.
pub const GOVERNOR_INTERNAL_ERROR: c_int = 10_000;

/// Compute half of the governor
pub struct ComputeLimiter {
    limit: CoreLimit,
    attr: Arc<ShmRegion<TokenAttr>>,
    bucket: Arc<TokenBucket>,
    launches: Arc<AtomicU32>,
    fallback_interval: Duration,
}

impl ComputeLimiter {
    /// Join the token region for this minor and cgroup
    ///
    /// Blocks until the monitor (or, in standalone mode, this process) has
    /// written the rate parameters.
    pub fn open(limit: CoreLimit, cgroup_id: &str, config: &Config) -> Result<Self, ShmError> {
        let name = config.shm.token_path(limit.minor, cgroup_id);
        let attr = ShmRegion::<TokenAttr>::open(&name, &(), config.throttle.ready_timeout())?;

        if config.throttle.standalone
            && attr.initialize(limit.limit, config.throttle.wait_interval())?
        {
            log::info!("Initialized token region {} without a monitor", name);
        }
        if !attr.is_inited() {
            log::info!("Waiting for the monitor to initialize {}", name);
        }

        Self::from_region(limit, Arc::new(attr), config.throttle.wait_interval())
    }

    /// Build on a mapped token region, waiting for it to become ready
    pub fn from_region(
        limit: CoreLimit,
        attr: Arc<ShmRegion<TokenAttr>>,
        fallback_interval: Duration,
    ) -> Result<Self, ShmError> {
        attr.wait_ready()?;

        let core_limit = attr.core_limit() as u64;
        log::info!(
            "Compute governed: {} (region limit {}, {} per cycle)",
            limit,
            core_limit,
            attr.add_per_cycle()
        );

        Ok(Self {
            limit,
            attr,
            bucket: Arc::new(TokenBucket::new(core_limit)),
            launches: Arc::new(AtomicU32::new(0)),
            fallback_interval,
        })
    }

    /// Configured limit
    pub fn limit(&self) -> CoreLimit {
        self.limit
    }

    /// Take a launch token, blocking while none are available
    pub fn acquire(&self) -> Result<(), ThrottleError> {
        self.bucket.acquire()?;
        self.launches.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Launches admitted since the refill thread last sampled
    pub fn pending_launches(&self) -> u32 {
        self.launches.load(Ordering::Acquire)
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Refill state sharing this limiter's bucket and counters
    pub fn refill(&self) -> Refill {
        Refill::new(
            Arc::clone(&self.attr),
            Arc::clone(&self.bucket),
            Arc::clone(&self.launches),
            self.fallback_interval,
        )
    }

    /// Start the refill thread
    pub fn spawn_refill(&self) -> std::io::Result<JoinHandle<()>> {
        let refill = self.refill();
        std::thread::Builder::new()
            .name("cudagov-refill".to_string())
            .spawn(move || refill.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn limiter(limit: u32) -> ComputeLimiter {
        let attr = Arc::new(ShmRegion::<TokenAttr>::anonymous(&()).unwrap());
        attr.initialize(limit, INTERVAL).unwrap();
        ComputeLimiter::from_region(CoreLimit::new(0, limit), attr, INTERVAL).unwrap()
    }

    #[test]
    fn test_acquire_counts_launches() {
        let limiter = limiter(3);
        limiter.acquire().unwrap();
        limiter.acquire().unwrap();
        assert_eq!(limiter.pending_launches(), 2);
        assert_eq!(limiter.bucket().available().unwrap(), 1);
    }

    #[test]
    fn test_burst_is_granted_only_available_tokens() {
        let limiter = Arc::new(limiter(10));
        let mut refill = limiter.refill();
        let granted = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let app = {
            let limiter = Arc::clone(&limiter);
            let granted = Arc::clone(&granted);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    limiter.acquire().unwrap();
                    granted.fetch_add(1, Ordering::SeqCst);
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(granted.load(Ordering::SeqCst), 10);

        // One token per tick at add_per_cycle = 1.
        refill.step();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(granted.load(Ordering::SeqCst), 11);
        assert!(!done.load(Ordering::SeqCst));

        while !done.load(Ordering::SeqCst) {
            refill.step();
            std::thread::sleep(Duration::from_millis(1));
        }
        app.join().unwrap();
        assert_eq!(granted.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_late_joiner_waits_for_initialization() {
        let attr = Arc::new(ShmRegion::<TokenAttr>::anonymous(&()).unwrap());
        let joined = Arc::new(AtomicBool::new(false));

        let joiner = {
            let attr = Arc::clone(&attr);
            let joined = Arc::clone(&joined);
            std::thread::spawn(move || {
                let limiter =
                    ComputeLimiter::from_region(CoreLimit::new(0, 20), attr, INTERVAL).unwrap();
                joined.store(true, Ordering::SeqCst);
                limiter.bucket().available().unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!joined.load(Ordering::SeqCst));

        attr.initialize(20, INTERVAL).unwrap();
        // Parameters, not zeroed memory: the bucket starts at the core limit.
        assert_eq!(joiner.join().unwrap(), 20);
    }

    #[test]
    fn test_idle_cycles_bank_tokens() {
        let limiter = limiter(2);
        let mut refill = limiter.refill();
        for _ in 0..5 {
            refill.step();
        }
        assert_eq!(limiter.bucket().available().unwrap(), 7);
    }
}
