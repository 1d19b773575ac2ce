//! Token rate feedback law
//!
//! Runs once per monitor tick with the target process's SM utilization.
//! During the bootstrap window the rate ramps up by one per tick while it is
//! small; afterwards it is retuned once per sample window by a quarter of the
//! error, expressed in kernels, and damped when the launch rate itself moved
//! less than the proposed rate change.

use crate::config::MonitorConfig;
use crate::shm::TokenAttr;

/// Adjusts `add_per_cycle` in a token region
#[derive(Debug, Clone, Copy)]
pub struct FeedbackController {
    sample_ticks: i32,
    bootstrap_max_rate: i32,
}

impl FeedbackController {
    pub fn new(sample_ticks: i32, bootstrap_max_rate: i32) -> Self {
        Self {
            sample_ticks: sample_ticks.max(1),
            bootstrap_max_rate,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.sample_ticks(), config.bootstrap_max_rate)
    }

    pub fn sample_ticks(&self) -> i32 {
        self.sample_ticks
    }

    /// Feed one utilization sample
    ///
    /// Returns the new rate when one was published. Nothing happens while a
    /// previous publication is still unconsumed.
    pub fn delta_change(&self, attr: &TokenAttr, util: u32, limit: u32) -> Option<u32> {
        if attr.pending() {
            log::trace!("previous rate not consumed yet");
            return None;
        }

        let old = attr.add_per_cycle() as i32;
        let ticks = attr.tick();

        if ticks <= self.sample_ticks {
            if old > self.bootstrap_max_rate {
                return None;
            }
            return Some(self.publish(attr, old + 1));
        }
        if ticks % self.sample_ticks != 0 {
            return None;
        }

        let err = limit as i32 - util as i32;
        if err == 0 {
            log::debug!("tick {}: util {} on target, holding {}", ticks, util, old);
            return None;
        }

        let (cur_avg, last_avg) = attr.averages();
        let new = next_rate(old, err, util, cur_avg, last_avg);
        log::debug!(
            "tick {}: err {} util {} add_per_cycle {} -> {} avg launches {}:{}",
            ticks,
            err,
            util,
            old,
            new,
            cur_avg,
            last_avg
        );
        Some(self.publish(attr, new))
    }

    fn publish(&self, attr: &TokenAttr, rate: i32) -> u32 {
        let rate = rate.max(1) as u32;
        attr.set_add_per_cycle(rate);
        attr.publish();
        rate
    }
}

/// Rate after one retune, never below 1
///
/// `cur_avg` and `last_avg` are the newest and previous rolling averages of
/// launches per refill cycle.
pub fn next_rate(old: i32, err: i32, util: u32, cur_avg: u32, last_avg: u32) -> i32 {
    let sign = if err > 0 { 1 } else { -1 };
    let util_per_kernel = util.max(1) as f32 / cur_avg.max(1) as f32;
    // A quarter of the error, in kernels.
    let delta = ((err.unsigned_abs() as f32 / util_per_kernel) / 4.0) as i32;
    let mut new = old + delta.max(1) * sign;

    let avg_delta_ratio = cur_avg.abs_diff(last_avg) as f32 / (last_avg + 1) as f32;
    let cycle_delta_ratio = new.abs_diff(old) as f32 / old.max(1) as f32;
    if cur_avg != last_avg && cycle_delta_ratio > avg_delta_ratio {
        new = (old as f32 + last_avg as f32 * avg_delta_ratio * sign as f32) as i32;
    }
    new.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRegion;
    use std::time::Duration;

    const TICKS: i32 = 50;

    fn region(limit: u32) -> ShmRegion<TokenAttr> {
        let attr = ShmRegion::<TokenAttr>::anonymous(&()).unwrap();
        attr.initialize(limit, Duration::from_millis(100)).unwrap();
        attr.consume(0).unwrap();
        attr
    }

    fn consume(attr: &TokenAttr) {
        attr.consume(attr.version().saturating_sub(1));
    }

    #[test]
    fn test_pending_publication_blocks_update() {
        let attr = region(50);
        attr.publish();
        let ctl = FeedbackController::new(TICKS, 3);
        assert_eq!(ctl.delta_change(&attr, 10, 50), None);
        assert_eq!(attr.mod_times(), 0);
    }

    #[test]
    fn test_bootstrap_ramp() {
        let attr = region(50);
        let ctl = FeedbackController::new(TICKS, 3);

        let mut published = vec![];
        for _ in 0..10 {
            if let Some(rate) = ctl.delta_change(&attr, 10, 50) {
                published.push(rate);
            }
            consume(&attr);
        }
        assert_eq!(published, vec![2, 3, 4]);
        assert_eq!(attr.add_per_cycle(), 4);
        assert_eq!(attr.mod_times(), 10);
    }

    #[test]
    fn test_retune_only_on_window_boundary() {
        let attr = region(50);
        let ctl = FeedbackController::new(TICKS, 3);
        for _ in 0..TICKS {
            ctl.delta_change(&attr, 10, 50);
            consume(&attr);
        }
        assert_eq!(ctl.delta_change(&attr, 10, 50), None);
        for _ in (TICKS + 2)..(2 * TICKS) {
            assert_eq!(ctl.delta_change(&attr, 10, 50), None);
        }
        assert!(ctl.delta_change(&attr, 10, 50).is_some());
    }

    #[test]
    fn test_retune_publishes_next_rate() {
        let attr = region(50);
        let ctl = FeedbackController::new(TICKS, 3);
        for _ in 0..(2 * TICKS - 1) {
            ctl.delta_change(&attr, 10, 50);
            consume(&attr);
        }
        assert_eq!(attr.add_per_cycle(), 4);

        // No launches sampled yet: one kernel stands for all 10%, err 40 -> +1.
        assert_eq!(ctl.delta_change(&attr, 10, 50), Some(5));
        assert_eq!(attr.add_per_cycle(), 5);
        assert!(attr.pending());
    }

    #[test]
    fn test_next_rate_grows_under_limit() {
        // 20 kernels per cycle at 10% util: 0.5% per kernel, err 40 -> +20.
        assert_eq!(next_rate(10, 40, 10, 20, 20), 30);
    }

    #[test]
    fn test_next_rate_shrinks_over_limit() {
        assert_eq!(next_rate(30, -20, 60, 30, 30), 28);
        assert_eq!(next_rate(1, -50, 100, 1, 1), 1);
    }

    #[test]
    fn test_next_rate_damped_by_launch_drift() {
        // Launches moved 20 -> 22: ratio 2/21, far below the proposed change.
        let undamped = next_rate(10, 40, 10, 20, 20);
        let damped = next_rate(10, 40, 10, 22, 20);
        assert!(damped < undamped);
        assert_eq!(damped, 11);
    }

    #[test]
    fn test_zero_samples_do_not_divide_by_zero() {
        assert!(next_rate(5, 30, 0, 0, 0) >= 1);
    }

    #[test]
    fn test_converges_at_target() {
        let attr = region(40);
        let ctl = FeedbackController::new(TICKS, 3);
        for _ in 0..TICKS {
            ctl.delta_change(&attr, 0, 40);
            consume(&attr);
        }
        let settled = attr.add_per_cycle();
        for _ in 0..(20 * TICKS) {
            ctl.delta_change(&attr, 40, 40);
            consume(&attr);
        }
        assert_eq!(attr.add_per_cycle(), settled);
        assert!(settled >= 1);
    }
}
