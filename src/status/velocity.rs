//! Per-pane token velocity (tokens/second, exponentially smoothed)

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::panes::PaneId;

/// Smoothing factor for new samples
const EMA_ALPHA: f64 = 0.3;

/// Gap between samples after which history is discarded
pub const RESET_AFTER: Duration = Duration::from_secs(60);

/// Velocity drops to zero when tokens have not grown for this long
pub const INCREASE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Sample {
    tokens: u64,
    at: DateTime<Utc>,
    ema: f64,
    last_increase: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct VelocityTracker {
    samples: HashMap<PaneId, Sample>,
}

fn within(earlier: DateTime<Utc>, later: DateTime<Utc>, limit: Duration) -> bool {
    (later - earlier)
        .to_std()
        .map(|d| d <= limit)
        .unwrap_or(true)
}

impl VelocityTracker {
    /// Record a token count and return the smoothed velocity
    pub fn observe(&mut self, pane_id: &str, tokens: u64, at: DateTime<Utc>) -> f64 {
        let Some(prev) = self.samples.get(pane_id).copied() else {
            self.samples.insert(
                pane_id.to_string(),
                Sample {
                    tokens,
                    at,
                    ema: 0.0,
                    last_increase: None,
                },
            );
            return 0.0;
        };

        let dt = (at - prev.at).num_milliseconds() as f64 / 1000.0;
        if dt <= 0.0 {
            return Self::visible(&prev, at);
        }

        // Truncated scrollback or a long gap invalidates the history
        if tokens < prev.tokens || !within(prev.at, at, RESET_AFTER) {
            self.samples.insert(
                pane_id.to_string(),
                Sample {
                    tokens,
                    at,
                    ema: 0.0,
                    last_increase: None,
                },
            );
            return 0.0;
        }

        let delta = (tokens - prev.tokens) as f64;
        let rate = delta / dt;
        let sample = Sample {
            tokens,
            at,
            ema: EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * prev.ema,
            last_increase: if delta > 0.0 { Some(at) } else { prev.last_increase },
        };
        self.samples.insert(pane_id.to_string(), sample);
        Self::visible(&sample, at)
    }

    fn visible(sample: &Sample, now: DateTime<Utc>) -> f64 {
        match sample.last_increase {
            Some(t) if within(t, now, INCREASE_WINDOW) => sample.ema.max(0.0),
            _ => 0.0,
        }
    }

    /// Last smoothed velocity without recording a sample
    pub fn current(&self, pane_id: &str, now: DateTime<Utc>) -> f64 {
        self.samples
            .get(pane_id)
            .map_or(0.0, |s| Self::visible(s, now))
    }

    pub fn forget(&mut self, pane_id: &str) {
        self.samples.remove(pane_id);
    }

    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.samples.retain(|id, _| keep(id));
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_first_sample_is_zero() {
        let mut v = VelocityTracker::default();
        assert_eq!(v.observe("%1", 100, t(0)), 0.0);
    }

    #[test]
    fn test_current_reads_without_recording() {
        let mut v = VelocityTracker::default();
        v.observe("%1", 100, t(0));
        let rate = v.observe("%1", 200, t(10));
        assert!(rate > 0.0);
        assert_eq!(v.current("%1", t(12)), rate);
        // A later real sample still measures against t(10)
        assert!(v.observe("%1", 300, t(20)) > 0.0);
        assert_eq!(v.current("%9", t(20)), 0.0);
    }

    #[test]
    fn test_increasing_tokens_give_positive_velocity() {
        let mut v = VelocityTracker::default();
        v.observe("%1", 100, t(0));
        let vel = v.observe("%1", 200, t(10));
        // 10 tok/s smoothed from zero
        assert!((vel - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_truncation_resets() {
        let mut v = VelocityTracker::default();
        v.observe("%1", 100, t(0));
        v.observe("%1", 200, t(10));
        assert_eq!(v.observe("%1", 50, t(20)), 0.0);
        assert_eq!(v.observe("%1", 50, t(25)), 0.0);
    }

    #[test]
    fn test_long_gap_resets() {
        let mut v = VelocityTracker::default();
        v.observe("%1", 100, t(0));
        assert_eq!(v.observe("%1", 500, t(120)), 0.0);
    }

    #[test]
    fn test_stale_increase_reads_zero() {
        let mut v = VelocityTracker::default();
        v.observe("%1", 100, t(0));
        assert!(v.observe("%1", 200, t(10)) > 0.0);
        // No growth for longer than the window
        assert!(v.observe("%1", 200, t(35)) > 0.0);
        assert_eq!(v.observe("%1", 200, t(50)), 0.0);
    }
}
