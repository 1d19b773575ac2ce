//! Token refill loop
//!
//! One refill thread runs per hooked process. Each cycle it sleeps the
//! published interval, posts `add_per_cycle` tokens and feeds the launch
//! count of the finished cycle into the shared rolling average the monitor
//! reads.

use crate::shm::{ShmRegion, TokenAttr};
use crate::throttle::bucket::TokenBucket;
use crate::throttle::sampler::LaunchSampler;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// State owned by the refill thread
pub struct Refill {
    attr: Arc<ShmRegion<TokenAttr>>,
    bucket: Arc<TokenBucket>,
    launches: Arc<AtomicU32>,
    sampler: LaunchSampler,
    seen_version: u64,
    add_per_cycle: u32,
    interval: Duration,
}

impl Refill {
    pub fn new(
        attr: Arc<ShmRegion<TokenAttr>>,
        bucket: Arc<TokenBucket>,
        launches: Arc<AtomicU32>,
        fallback_interval: Duration,
    ) -> Self {
        let mut refill = Self {
            attr,
            bucket,
            launches,
            sampler: LaunchSampler::new(),
            seen_version: 0,
            add_per_cycle: 1,
            interval: fallback_interval,
        };
        refill.refresh();
        refill
    }

    /// Tokens posted per cycle
    pub fn add_per_cycle(&self) -> u32 {
        self.add_per_cycle
    }

    /// Current sleep between cycles
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Apply a newer publication, if any; returns whether one was applied
    pub fn refresh(&mut self) -> bool {
        let Some(update) = self.attr.consume(self.seen_version) else {
            return false;
        };
        if update.skipped > 0 {
            log::debug!(
                "Token rate moved {} versions ahead, {} updates not observed",
                update.version - self.seen_version,
                update.skipped
            );
        }

        self.seen_version = update.version;
        self.add_per_cycle = update.add_per_cycle;
        if !update.wait_interval.is_zero() {
            self.interval = update.wait_interval;
        }
        log::debug!(
            "Token rate v{}: {} per {:?}",
            update.version,
            self.add_per_cycle,
            self.interval
        );
        true
    }

    /// One cycle without the sleep: post tokens, sample launches
    pub fn step(&mut self) {
        if let Err(e) = self.bucket.add(self.add_per_cycle as u64) {
            log::error!("Token refill failed: {}", e);
        }

        let launches = self.launches.swap(0, Ordering::AcqRel);
        let avg = self.sampler.record(launches);
        self.attr.record_average(avg);
        log::trace!("cycle launches {} avg {}", launches, avg);
    }

    /// Run for the lifetime of the process
    pub fn run(mut self) {
        log::debug!("Token refill started");
        loop {
            self.refresh();
            std::thread::sleep(self.interval);
            self.step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn setup(limit: u32) -> (Arc<ShmRegion<TokenAttr>>, Arc<TokenBucket>, Arc<AtomicU32>) {
        let attr = Arc::new(ShmRegion::<TokenAttr>::anonymous(&()).unwrap());
        attr.initialize(limit, INTERVAL).unwrap();
        let bucket = Arc::new(TokenBucket::new(0));
        (attr, bucket, Arc::new(AtomicU32::new(0)))
    }

    #[test]
    fn test_new_applies_initial_publication() {
        let (attr, bucket, launches) = setup(10);
        let refill = Refill::new(Arc::clone(&attr), bucket, launches, Duration::from_secs(1));
        assert_eq!(refill.add_per_cycle(), 1);
        assert_eq!(refill.interval(), INTERVAL);
        assert!(!attr.pending());
    }

    #[test]
    fn test_step_posts_and_samples() {
        let (attr, bucket, launches) = setup(10);
        let mut refill = Refill::new(
            Arc::clone(&attr),
            Arc::clone(&bucket),
            Arc::clone(&launches),
            INTERVAL,
        );

        launches.store(40, Ordering::Relaxed);
        refill.step();
        assert_eq!(bucket.available().unwrap(), 1);
        assert_eq!(launches.load(Ordering::Relaxed), 0);
        assert_eq!(attr.averages().0, 20);
    }

    #[test]
    fn test_refresh_picks_up_new_rate() {
        let (attr, bucket, launches) = setup(10);
        let mut refill = Refill::new(Arc::clone(&attr), Arc::clone(&bucket), launches, INTERVAL);
        assert!(!refill.refresh());

        attr.set_add_per_cycle(25);
        attr.publish();
        assert!(refill.refresh());
        assert_eq!(refill.add_per_cycle(), 25);

        refill.step();
        refill.step();
        assert_eq!(bucket.available().unwrap(), 50);
    }
}
