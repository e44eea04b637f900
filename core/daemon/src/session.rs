//! Session state machine.
//!
//! A patient has at most one current-session record. It flips between
//! inactive and active on start/stop (or auto-stop) and carries the counter
//! views the reconciler works against. Transitions here are pure: they take
//! the stored record plus an explicit `now` and return what must be written.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attribution::average_pace;
use crate::calendar::{parse_rfc3339, timestamp};
use crate::reconcile::{CounterState, Counters};

pub const START_SOURCE: &str = "start";
pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveView {
    pub steps: u64,
    pub stairs: u64,
    pub falls: u64,
    pub imu_moving: bool,
    pub source: String,
    pub steps_pace: u64,
    pub stairs_pace: u64,
}

impl Default for LiveView {
    fn default() -> Self {
        Self {
            steps: 0,
            stairs: 0,
            falls: 0,
            imu_moving: false,
            source: START_SOURCE.to_string(),
            steps_pace: 0,
            stairs_pace: 0,
        }
    }
}

impl LiveView {
    pub fn counts(&self) -> Counters {
        Counters {
            steps: self.steps,
            stairs: self.stairs,
            falls: self.falls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSession {
    pub patient_id: String,
    pub active: bool,
    pub session_id: Option<String>,
    pub date_key: Option<String>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
    pub last_at: Option<String>,
    pub baseline: Counters,
    pub carried: Counters,
    pub last_absolute: Counters,
    pub live: LiveView,
    pub active_walk_seconds: f64,
    pub active_stair_seconds: f64,
    pub ok_pending: bool,
    pub auto_stopped: bool,
    pub last_type: Option<String>,
    pub last: Option<Value>,
}

impl CurrentSession {
    /// Record for a patient that has never been seen.
    pub fn empty(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            active: false,
            session_id: None,
            date_key: None,
            started_at: None,
            updated_at: None,
            last_at: None,
            baseline: Counters::default(),
            carried: Counters::default(),
            last_absolute: Counters::default(),
            live: LiveView {
                source: UNKNOWN_SOURCE.to_string(),
                ..LiveView::default()
            },
            active_walk_seconds: 0.0,
            active_stair_seconds: 0.0,
            ok_pending: false,
            auto_stopped: false,
            last_type: None,
            last: None,
        }
    }

    pub fn counter_state(&self) -> CounterState {
        CounterState {
            baseline: self.baseline,
            carried: self.carried,
            last_absolute: self.last_absolute,
            live: self.live.counts(),
        }
    }

    pub fn last_at_time(&self) -> Option<DateTime<Utc>> {
        self.last_at.as_deref().and_then(parse_rfc3339)
    }

    pub fn started_at_time(&self) -> Option<DateTime<Utc>> {
        self.started_at.as_deref().and_then(parse_rfc3339)
    }
}

/// Fields a sample rewrites on the current-session record. Everything else
/// (active flag, session identity, okPending) belongs to the start/stop and
/// acknowledgment paths and is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdate {
    pub patient_id: String,
    pub counters: CounterState,
    pub live: LiveView,
    pub active_walk_seconds: f64,
    pub active_stair_seconds: f64,
    pub last_at: String,
    pub updated_at: String,
    pub last_type: String,
    pub last: Value,
}

/// Per-session history row. Totals are running increments while the session
/// is open and are overwritten with the final live values on close.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSession {
    pub session_id: String,
    pub patient_id: String,
    pub date_key: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub total_steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    pub alerts_count: u64,
    pub active_walk_seconds: f64,
    pub active_stair_seconds: f64,
    pub avg_steps_pace: Option<u64>,
    pub avg_stairs_pace: Option<u64>,
    pub auto_stopped: bool,
    pub last_updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOpening {
    pub current: CurrentSession,
    pub record: HistoricalSession,
}

#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum StartOutcome {
    AlreadyActive { session_id: String },
    Started(SessionOpening),
}

/// Final figures written to the history row when a session closes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub session_id: String,
    pub end_time: String,
    pub total_steps: u64,
    pub stairs_count: u64,
    pub falls_count: u64,
    pub active_walk_seconds: f64,
    pub active_stair_seconds: f64,
    pub avg_steps_pace: u64,
    pub avg_stairs_pace: u64,
    pub auto_stopped: bool,
}

pub fn open_session(
    current: Option<&CurrentSession>,
    patient_id: &str,
    new_session_id: String,
    date_key: String,
    now: DateTime<Utc>,
) -> StartOutcome {
    if let Some(existing) = current {
        if existing.active {
            if let Some(session_id) = existing.session_id.clone() {
                return StartOutcome::AlreadyActive { session_id };
            }
        }
    }

    let now_str = timestamp(now);
    // Device counters keep running between sessions; the new session is
    // measured from wherever they were last seen.
    let start = current.map(|c| c.last_absolute).unwrap_or_default();

    let session = CurrentSession {
        patient_id: patient_id.to_string(),
        active: true,
        session_id: Some(new_session_id.clone()),
        date_key: Some(date_key.clone()),
        started_at: Some(now_str.clone()),
        updated_at: Some(now_str.clone()),
        last_at: Some(now_str.clone()),
        baseline: start,
        carried: Counters::default(),
        last_absolute: start,
        live: LiveView::default(),
        active_walk_seconds: 0.0,
        active_stair_seconds: 0.0,
        ok_pending: false,
        auto_stopped: false,
        last_type: current.and_then(|c| c.last_type.clone()),
        last: current.and_then(|c| c.last.clone()),
    };

    let record = HistoricalSession {
        session_id: new_session_id,
        patient_id: patient_id.to_string(),
        date_key,
        start_time: now_str.clone(),
        end_time: None,
        total_steps: 0,
        stairs_count: 0,
        falls_count: 0,
        alerts_count: 0,
        active_walk_seconds: 0.0,
        active_stair_seconds: 0.0,
        avg_steps_pace: None,
        avg_stairs_pace: None,
        auto_stopped: false,
        last_updated_at: now_str,
    };

    StartOutcome::Started(SessionOpening {
        current: session,
        record,
    })
}

/// Returns `None` when there is nothing to close.
pub fn close_session(
    current: &CurrentSession,
    now: DateTime<Utc>,
    auto_stopped: bool,
) -> Option<SessionClose> {
    if !current.active {
        return None;
    }
    let session_id = current.session_id.clone()?;
    let live = &current.live;

    Some(SessionClose {
        session_id,
        end_time: timestamp(now),
        total_steps: live.steps,
        stairs_count: live.stairs,
        falls_count: live.falls,
        active_walk_seconds: current.active_walk_seconds,
        active_stair_seconds: current.active_stair_seconds,
        avg_steps_pace: average_pace(live.steps, current.active_walk_seconds),
        avg_stairs_pace: average_pace(live.stairs, current.active_stair_seconds),
        auto_stopped,
    })
}

pub fn should_auto_stop(current: &CurrentSession, now: DateTime<Utc>, ceiling: Duration) -> bool {
    if !current.active {
        return false;
    }
    match current.started_at_time() {
        Some(started_at) => now.signed_duration_since(started_at) >= ceiling,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        parse_rfc3339("2026-03-02T08:00:00Z").expect("timestamp")
    }

    fn started(prev: Option<&CurrentSession>) -> SessionOpening {
        match open_session(
            prev,
            "p1",
            "s-1".to_string(),
            "2026-03-02".to_string(),
            now(),
        ) {
            StartOutcome::Started(opening) => opening,
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn start_seeds_baseline_from_last_absolute() {
        let mut prev = CurrentSession::empty("p1");
        prev.last_absolute = Counters {
            steps: 100,
            stairs: 7,
            falls: 1,
        };
        prev.ok_pending = true;
        prev.live.steps = 55;

        let opening = started(Some(&prev));
        let current = opening.current;
        assert!(current.active);
        assert_eq!(current.baseline.steps, 100);
        assert_eq!(current.last_absolute.stairs, 7);
        assert_eq!(current.live, LiveView::default());
        assert!(!current.ok_pending);
        assert_eq!(current.last_at, current.started_at);
        assert_eq!(opening.record.total_steps, 0);
        assert!(opening.record.end_time.is_none());
    }

    #[test]
    fn start_is_idempotent_while_active() {
        let opening = started(None);
        let outcome = open_session(
            Some(&opening.current),
            "p1",
            "s-2".to_string(),
            "2026-03-02".to_string(),
            now(),
        );
        assert_eq!(
            outcome,
            StartOutcome::AlreadyActive {
                session_id: "s-1".to_string()
            }
        );
    }

    #[test]
    fn close_computes_average_pace() {
        let mut current = started(None).current;
        current.live.steps = 150;
        current.live.stairs = 0;
        current.active_walk_seconds = 120.0;

        let close = close_session(&current, now(), false).expect("close");
        assert_eq!(close.session_id, "s-1");
        assert_eq!(close.total_steps, 150);
        assert_eq!(close.avg_steps_pace, 75);
        assert_eq!(close.avg_stairs_pace, 0);
        assert_eq!(close.active_stair_seconds, 0.0);
    }

    #[test]
    fn close_is_noop_when_inactive() {
        let mut current = started(None).current;
        current.active = false;
        assert!(close_session(&current, now(), false).is_none());
    }

    #[test]
    fn auto_stop_after_ceiling() {
        let current = started(None).current;
        let ceiling = Duration::minutes(60);
        assert!(!should_auto_stop(&current, now() + Duration::minutes(59), ceiling));
        assert!(should_auto_stop(&current, now() + Duration::minutes(60), ceiling));
        assert!(should_auto_stop(&current, now() + Duration::minutes(70), ceiling));

        let mut stopped = current;
        stopped.active = false;
        assert!(!should_auto_stop(&stopped, now() + Duration::minutes(70), ceiling));
    }
}
