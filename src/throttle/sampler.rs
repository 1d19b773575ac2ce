//! Launch-rate sampling

/// Number of refill cycles kept in the ring
pub const LAUNCH_SAMPLES: usize = 10;

/// Ring of per-cycle launch counts
#[derive(Debug, Clone, Default)]
pub struct LaunchSampler {
    ring: [u32; LAUNCH_SAMPLES],
    cycle: usize,
}

impl LaunchSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one cycle's launch count and return the rolling average
    ///
    /// Idle cycles are left out of the average. The denominator carries a
    /// `+ 1`, so an all-idle ring averages to zero, which is reported as 1.
    pub fn record(&mut self, launches: u32) -> u32 {
        self.cycle = self.cycle.wrapping_add(1);
        self.ring[self.cycle % LAUNCH_SAMPLES] = launches;

        let (sum, busy) = self
            .ring
            .iter()
            .filter(|&&n| n > 0)
            .fold((0u64, 0u64), |(sum, busy), &n| (sum + n as u64, busy + 1));
        let avg = (sum / (busy + 1)) as u32;
        avg.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_idle_averages_to_one() {
        let mut sampler = LaunchSampler::new();
        for _ in 0..LAUNCH_SAMPLES * 2 {
            assert_eq!(sampler.record(0), 1);
        }
    }

    #[test]
    fn test_idle_cycles_ignored() {
        let mut sampler = LaunchSampler::new();
        assert_eq!(sampler.record(30), 15);
        assert_eq!(sampler.record(0), 15);
        assert_eq!(sampler.record(30), 20);
    }

    #[test]
    fn test_old_samples_roll_out() {
        let mut sampler = LaunchSampler::new();
        sampler.record(1000);
        for _ in 0..LAUNCH_SAMPLES {
            sampler.record(9);
        }
        // 10 samples of 9, the 1000 overwritten: 90 / 11.
        assert_eq!(sampler.record(9), 8);
    }
}
