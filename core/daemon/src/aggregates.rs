use serde::Serialize;

use crate::attribution::Attribution;
use crate::reconcile::Counters;

/// Additive increments produced by one sample. Added to the day row and,
/// while a session is open, to its history row; stored counts saturate at
/// `i64::MAX`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Increments {
    pub total_steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    pub alerts_count: u64,
    pub active_walk_seconds: f64,
    pub active_stair_seconds: f64,
}

impl Increments {
    pub fn from_sample(deltas: &Counters, attribution: &Attribution, alerts: u64) -> Self {
        Self {
            total_steps: deltas.steps,
            stairs_count: deltas.stairs,
            falls_count: deltas.falls,
            alerts_count: alerts,
            active_walk_seconds: attribution.walk_secs.max(0.0),
            active_stair_seconds: attribution.stair_secs.max(0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_steps == 0
            && self.stairs_count == 0
            && self.falls_count == 0
            && self.alerts_count == 0
            && self.active_walk_seconds <= 0.0
            && self.active_stair_seconds <= 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub patient_id: String,
    pub date_key: String,
    pub sessions_count: u64,
    pub total_steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    pub alerts_count: u64,
    pub active_walk_seconds: f64,
    pub active_stair_seconds: f64,
    pub last_updated_at: String,
}
