//! Adaptive controller loop
//!
//! One monitor runs per constrained cgroup. It owns the token region's
//! parameters: it initializes them, then at a fixed cadence reads the
//! utilization of the cgroup's GPU process and feeds it to the feedback law.

use crate::cgroup::CgroupResolver;
use crate::config::Config;
use crate::controller::feedback::FeedbackController;
use crate::controller::nvml::UtilizationSource;
use crate::domain::{CoreLimit, ProcessSample};
use crate::error::{NvmlError, ShmError};
use crate::shm::{ShmRegion, TokenAttr};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch, the clock NVML stamps samples with
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Control loop for one minor and cgroup
pub struct Monitor {
    limit: CoreLimit,
    cgroup_id: String,
    interval: Duration,
    attr: ShmRegion<TokenAttr>,
    controller: FeedbackController,
}

impl Monitor {
    /// Attach to the cgroup's token region and take ownership of its parameters
    pub fn attach(config: &Config, limit: CoreLimit, cgroup_id: &str) -> Result<Self, ShmError> {
        let name = config.shm.token_path(limit.minor, cgroup_id);
        let attr = ShmRegion::<TokenAttr>::open(&name, &(), config.throttle.ready_timeout())?;
        log::debug!("Token region {} (created: {})", name, attr.created());
        Self::from_region(config, limit, cgroup_id, attr)
    }

    /// Take ownership of an already mapped token region
    pub fn from_region(
        config: &Config,
        limit: CoreLimit,
        cgroup_id: &str,
        attr: ShmRegion<TokenAttr>,
    ) -> Result<Self, ShmError> {
        if !attr.initialize(limit.limit, config.throttle.wait_interval())? {
            attr.wait_ready()?;
            attr.retarget(limit.limit);
        }
        // Restarted monitors republish so consumers resynchronize.
        let version = attr.publish();
        log::info!(
            "core_limit {}, add_per_cycle {}, version {}",
            attr.core_limit(),
            attr.add_per_cycle(),
            version
        );

        Ok(Self {
            limit,
            cgroup_id: cgroup_id.to_string(),
            interval: config.monitor.interval(),
            attr,
            controller: FeedbackController::from_config(&config.monitor),
        })
    }

    pub fn limit(&self) -> CoreLimit {
        self.limit
    }

    pub fn attr(&self) -> &TokenAttr {
        &self.attr
    }

    /// Find the newest-window sample belonging to this cgroup
    pub fn target_sample<S, R>(
        &self,
        source: &mut S,
        resolver: &R,
        since_us: u64,
    ) -> Result<Option<ProcessSample>, NvmlError>
    where
        S: UtilizationSource + ?Sized,
        R: CgroupResolver + ?Sized,
    {
        let samples = source.process_samples(since_us)?;
        Ok(samples.into_iter().find(|s| {
            s.is_fresh(since_us)
                && resolver
                    .cgroup_id(s.pid)
                    .is_some_and(|id| id == self.cgroup_id)
        }))
    }

    /// Poll once and run the feedback law
    ///
    /// Returns the newly published rate, if any. Missing samples skip the
    /// tick.
    pub fn poll<S, R>(&self, source: &mut S, resolver: &R, since_us: u64) -> Option<u32>
    where
        S: UtilizationSource + ?Sized,
        R: CgroupResolver + ?Sized,
    {
        let sample = match self.target_sample(source, resolver, since_us) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                log::debug!("No sample for cgroup {}", self.cgroup_id);
                return None;
            }
            Err(NvmlError::NoSamples) => {
                log::trace!("no samples since {}", since_us);
                return None;
            }
            Err(e) => {
                log::error!("Cannot read utilization samples: {}", e);
                return None;
            }
        };

        log::trace!("{}", sample);
        self.controller
            .delta_change(&self.attr, sample.sm_util, self.limit.limit)
    }

    /// Run for the lifetime of the process
    pub fn run<S, R>(&self, source: &mut S, resolver: &R) -> !
    where
        S: UtilizationSource + ?Sized,
        R: CgroupResolver + ?Sized,
    {
        log::info!(
            "Monitoring cgroup {} on minor {} every {:?}",
            self.cgroup_id,
            self.limit.minor,
            self.interval
        );
        loop {
            let since = now_us();
            std::thread::sleep(self.interval);
            if let Some(rate) = self.poll(source, resolver, since) {
                log::debug!("Published add_per_cycle {}", rate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FixedCgroups, MockUtilization};

    fn config() -> Config {
        Config::default()
    }

    fn monitor(limit: u32) -> Monitor {
        let attr = ShmRegion::<TokenAttr>::anonymous(&()).unwrap();
        Monitor::from_region(&config(), CoreLimit::new(0, limit), "abc123", attr).unwrap()
    }

    #[test]
    fn test_attach_initializes_region() {
        let monitor = monitor(30);
        assert!(monitor.attr().is_inited());
        assert_eq!(monitor.attr().core_limit(), 30);
        assert_eq!(monitor.attr().add_per_cycle(), 1);
        assert!(monitor.attr().pending());
    }

    #[test]
    fn test_restart_with_new_limit_rescales() {
        let attr = ShmRegion::<TokenAttr>::anonymous(&()).unwrap();
        attr.initialize(20, Duration::from_millis(100)).unwrap();
        attr.set_add_per_cycle(10);

        let monitor = Monitor::from_region(&config(), CoreLimit::new(0, 40), "abc123", attr).unwrap();
        assert_eq!(monitor.attr().core_limit(), 40);
        assert_eq!(monitor.attr().add_per_cycle(), 20);
        assert_eq!(monitor.attr().mod_times(), 0);
    }

    #[test]
    fn test_target_sample_matches_cgroup() {
        let monitor = monitor(30);
        let resolver = FixedCgroups::new(&[(10, "other"), (11, "abc123")]);
        let mut source = MockUtilization::new();
        source.push(vec![
            ProcessSample::new(10, 2_000, 90),
            ProcessSample::new(11, 500, 70),
            ProcessSample::new(11, 2_000, 25),
        ]);

        let sample = monitor
            .target_sample(&mut source, &resolver, 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(sample.pid, 11);
        assert_eq!(sample.sm_util, 25);
        assert_eq!(source.last_seen(), Some(1_000));
    }

    #[test]
    fn test_poll_skips_without_samples() {
        let monitor = monitor(30);
        monitor.attr().consume(0);
        let resolver = FixedCgroups::new(&[(11, "abc123")]);
        let mut source = MockUtilization::new();

        // Nothing queued: the source reports no samples.
        assert_eq!(monitor.poll(&mut source, &resolver, 0), None);
        assert_eq!(monitor.attr().mod_times(), 0);

        source.push(vec![ProcessSample::new(12, 10, 50)]);
        assert_eq!(monitor.poll(&mut source, &resolver, 0), None);
        assert_eq!(monitor.attr().mod_times(), 0);
    }

    #[test]
    fn test_poll_drives_bootstrap_ramp() {
        let monitor = monitor(30);
        monitor.attr().consume(0);
        let resolver = FixedCgroups::new(&[(11, "abc123")]);
        let mut source = MockUtilization::new();

        source.push(vec![ProcessSample::new(11, 10, 5)]);
        assert_eq!(monitor.poll(&mut source, &resolver, 0), Some(2));

        // Unconsumed publication: the next sample is ignored.
        source.push(vec![ProcessSample::new(11, 20, 5)]);
        assert_eq!(monitor.poll(&mut source, &resolver, 0), None);
    }

    #[test]
    fn test_now_us_is_wall_clock() {
        // Later than 2020-01-01.
        assert!(now_us() > 1_577_836_800_000_000);
    }
}
