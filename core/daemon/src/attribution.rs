use chrono::{DateTime, Utc};

use crate::reconcile::Counters;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attribution {
    pub walk_secs: f64,
    pub stair_secs: f64,
}

/// Seconds since the previous sample, or zero when there is no previous
/// sample, the clock went backwards, or the gap is long enough to mean the
/// device was disconnected.
pub fn elapsed_secs(last_at: Option<DateTime<Utc>>, now: DateTime<Utc>, max_gap_secs: f64) -> f64 {
    let Some(last_at) = last_at else {
        return 0.0;
    };
    let elapsed = now.signed_duration_since(last_at).num_milliseconds() as f64 / 1000.0;
    if !elapsed.is_finite() || elapsed < 0.0 || elapsed > max_gap_secs {
        return 0.0;
    }
    elapsed
}

/// Stairs win over walking when both counters advanced in the same sample.
pub fn attribute(elapsed_secs: f64, deltas: &Counters) -> Attribution {
    if deltas.stairs > 0 {
        Attribution {
            walk_secs: 0.0,
            stair_secs: elapsed_secs,
        }
    } else if deltas.steps > 0 {
        Attribution {
            walk_secs: elapsed_secs,
            stair_secs: 0.0,
        }
    } else {
        Attribution::default()
    }
}

/// Counts per minute, reported only once the bucket holds more than
/// `min_secs` of attributed time.
pub fn pace(count: u64, active_secs: f64, min_secs: f64) -> u64 {
    if active_secs <= min_secs {
        return 0;
    }
    (count as f64 / (active_secs / 60.0)).round() as u64
}

/// Whole-session average; the divisor is floored at one second.
pub fn average_pace(count: u64, active_secs: f64) -> u64 {
    (count as f64 / (active_secs.max(1.0) / 60.0)).round() as u64
}
