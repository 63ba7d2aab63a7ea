//! Channel-usage backpressure monitor with hysteresis.
//!
//! Entering the backpressure state at `usage >= threshold_pct` and leaving it
//! only once usage drops under `threshold_pct * 0.7` avoids flapping in and
//! out of the state on every frame when usage sits right at the threshold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::config::{BackpressureAction, BackpressureConfig};
use super::ingress::IngressBuffer;

/// Fraction of `threshold_pct` at which the monitor clears backpressure
/// again, below the entry point.
const HYSTERESIS_FACTOR: f64 = 0.7;

pub struct BackpressureMonitor {
    config: BackpressureConfig,
    engaged: AtomicBool,
    dropped_since_action: AtomicU64,
}

impl BackpressureMonitor {
    #[must_use]
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            engaged: AtomicBool::new(false),
            dropped_since_action: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Relaxed)
    }

    /// Samples an ingress buffer's usage and updates the engaged state,
    /// returning the action to take if usage just crossed into backpressure
    /// or dropped events crossed `max_dropped` while already engaged.
    ///
    /// `dropped_since_action` is a baseline subtracted from the buffer's
    /// cumulative `dropped_count` to get the count *since the last time an
    /// action fired*; an action only fires once that delta reaches
    /// `max_dropped` again. `SlowDown` advances the baseline only halfway to
    /// the current count instead of all the way, so its relief is temporary:
    /// the next action re-fires after half as many further drops as the
    /// other actions would need.
    pub fn sample(&self, buffer: &IngressBuffer) -> Option<BackpressureAction> {
        let usage = buffer.usage_pct();
        let was_engaged = self.engaged.load(Ordering::Relaxed);

        let now_engaged = if was_engaged {
            usage >= self.config.threshold_pct * HYSTERESIS_FACTOR
        } else {
            usage >= self.config.threshold_pct
        };
        self.engaged.store(now_engaged, Ordering::Relaxed);

        if !now_engaged {
            self.dropped_since_action.store(0, Ordering::Relaxed);
            return None;
        }

        let dropped = buffer.dropped_count();
        let baseline = self.dropped_since_action.load(Ordering::Relaxed);
        let since_last_action = dropped.saturating_sub(baseline);
        if since_last_action < self.config.max_dropped {
            return None;
        }

        match self.config.action {
            BackpressureAction::SlowDown => {
                self.dropped_since_action
                    .store(dropped.saturating_sub(since_last_action / 2), Ordering::Relaxed);
            }
            BackpressureAction::Log | BackpressureAction::Reconnect | BackpressureAction::Stop => {
                self.dropped_since_action.store(dropped, Ordering::Relaxed);
            }
        }

        Some(self.config.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold_pct: f64) -> BackpressureMonitor {
        BackpressureMonitor::new(BackpressureConfig {
            threshold_pct,
            max_dropped: 1,
            ..BackpressureConfig::default()
        })
    }

    #[test]
    fn engages_at_threshold_and_requires_hysteresis_to_clear() {
        let mon = monitor(80.0);
        let buf = IngressBuffer::new(10);
        for i in 0..8u8 {
            buf.push(vec![i]);
        }
        mon.sample(&buf);
        assert!(mon.is_engaged());

        buf.try_pop();
        mon.sample(&buf);
        assert!(mon.is_engaged(), "still above hysteresis floor of 56%");

        for _ in 0..4 {
            buf.try_pop();
        }
        mon.sample(&buf);
        assert!(!mon.is_engaged());
    }

    #[test]
    fn does_not_engage_below_threshold() {
        let mon = monitor(80.0);
        let buf = IngressBuffer::new(10);
        buf.push(vec![1]);
        mon.sample(&buf);
        assert!(!mon.is_engaged());
    }

    fn monitor_with(action: BackpressureAction) -> BackpressureMonitor {
        BackpressureMonitor::new(BackpressureConfig {
            threshold_pct: 0.0,
            max_dropped: 2,
            action,
            ..BackpressureConfig::default()
        })
    }

    #[test]
    fn action_does_not_refire_until_max_dropped_more_events_drop() {
        let mon = monitor_with(BackpressureAction::Log);
        let buf = IngressBuffer::new(1);
        buf.push(vec![1]);
        buf.push(vec![2]);
        buf.push(vec![3]);
        assert_eq!(buf.dropped_count(), 2);
        assert_eq!(mon.sample(&buf), Some(BackpressureAction::Log));

        buf.push(vec![4]);
        assert_eq!(mon.sample(&buf), None, "only one more drop since the last action, need two");

        buf.push(vec![5]);
        assert_eq!(mon.sample(&buf), Some(BackpressureAction::Log));
    }

    #[test]
    fn slow_down_halves_the_wait_before_refiring() {
        let mon = monitor_with(BackpressureAction::SlowDown);
        let buf = IngressBuffer::new(1);
        buf.push(vec![1]);
        buf.push(vec![2]);
        buf.push(vec![3]);
        assert_eq!(mon.sample(&buf), Some(BackpressureAction::SlowDown));

        buf.push(vec![4]);
        assert_eq!(
            mon.sample(&buf),
            Some(BackpressureAction::SlowDown),
            "slow down only halves the baseline, so it refires after half as many drops"
        );
    }
}
