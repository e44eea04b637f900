//! SQLite persistence for carewalk-daemon.
//!
//! One row per patient for the current session, append-mostly history for
//! sessions and alerts, additive daily aggregates, device registrations, and
//! a sample log used for replay suppression. Counter triples live in JSON
//! text columns so the current-session row stays one read.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use crate::aggregates::{DailyAggregate, Increments};
use crate::alerts::{AlertRecord, HandledBy};
use crate::reconcile::Counters;
use crate::session::{CurrentSession, HistoricalSession, LiveUpdate, LiveView, SessionClose};

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenRow {
    pub token_id: String,
    pub token: String,
    pub role: String,
    pub platform: Option<String>,
    pub updated_at: String,
}

const CURRENT_SESSION_COLUMNS: &str = "patient_id, active, session_id, date_key, started_at, \
     updated_at, last_at, baseline, carried, last_absolute, live, active_walk_seconds, \
     active_stair_seconds, ok_pending, auto_stopped, last_type, last_payload";

const SESSION_COLUMNS: &str = "session_id, patient_id, date_key, start_time, end_time, \
     total_steps, stairs_count, falls_count, alerts_count, active_walk_seconds, \
     active_stair_seconds, avg_steps_pace, avg_stairs_pace, auto_stopped, last_updated_at";

const ALERT_COLUMNS: &str =
    "alert_id, patient_id, type, session_id, timestamp, handled, handled_at, handled_by, payload";

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn get_current_session(&self, patient_id: &str) -> Result<Option<CurrentSession>, String> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM current_session WHERE patient_id = ?1",
                CURRENT_SESSION_COLUMNS
            );
            conn.query_row(&sql, params![patient_id], current_session_from_row)
                .optional()
                .map_err(|err| format!("Failed to query current session: {}", err))
        })
    }

    /// Full overwrite, used when a session opens.
    pub fn put_current_session(&self, session: &CurrentSession) -> Result<(), String> {
        let baseline = encode_json(&session.baseline)?;
        let carried = encode_json(&session.carried)?;
        let last_absolute = encode_json(&session.last_absolute)?;
        let live = encode_json(&session.live)?;
        let last = session.last.as_ref().map(encode_json).transpose()?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO current_session \
                    (patient_id, active, session_id, date_key, started_at, updated_at, last_at, \
                     baseline, carried, last_absolute, live, active_walk_seconds, \
                     active_stair_seconds, ok_pending, auto_stopped, last_type, last_payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
                 ON CONFLICT(patient_id) DO UPDATE SET \
                    active = excluded.active, \
                    session_id = excluded.session_id, \
                    date_key = excluded.date_key, \
                    started_at = excluded.started_at, \
                    updated_at = excluded.updated_at, \
                    last_at = excluded.last_at, \
                    baseline = excluded.baseline, \
                    carried = excluded.carried, \
                    last_absolute = excluded.last_absolute, \
                    live = excluded.live, \
                    active_walk_seconds = excluded.active_walk_seconds, \
                    active_stair_seconds = excluded.active_stair_seconds, \
                    ok_pending = excluded.ok_pending, \
                    auto_stopped = excluded.auto_stopped, \
                    last_type = excluded.last_type, \
                    last_payload = excluded.last_payload",
                params![
                    session.patient_id,
                    session.active,
                    session.session_id,
                    session.date_key,
                    session.started_at,
                    session.updated_at,
                    session.last_at,
                    baseline,
                    carried,
                    last_absolute,
                    live,
                    session.active_walk_seconds,
                    session.active_stair_seconds,
                    session.ok_pending,
                    session.auto_stopped,
                    session.last_type,
                    last
                ],
            )
            .map_err(|err| format!("Failed to write current session: {}", err))?;
            Ok(())
        })
    }

    /// Merge write of the counter and live columns. Creates the row for a
    /// patient that has never started a session.
    pub fn write_sample_state(&self, update: &LiveUpdate) -> Result<(), String> {
        let baseline = encode_json(&update.counters.baseline)?;
        let carried = encode_json(&update.counters.carried)?;
        let last_absolute = encode_json(&update.counters.last_absolute)?;
        let live = encode_json(&update.live)?;
        let last = encode_json(&update.last)?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO current_session \
                    (patient_id, active, updated_at, last_at, baseline, carried, last_absolute, \
                     live, active_walk_seconds, active_stair_seconds, ok_pending, auto_stopped, \
                     last_type, last_payload) \
                 VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?11) \
                 ON CONFLICT(patient_id) DO UPDATE SET \
                    updated_at = excluded.updated_at, \
                    last_at = excluded.last_at, \
                    baseline = excluded.baseline, \
                    carried = excluded.carried, \
                    last_absolute = excluded.last_absolute, \
                    live = excluded.live, \
                    active_walk_seconds = excluded.active_walk_seconds, \
                    active_stair_seconds = excluded.active_stair_seconds, \
                    last_type = excluded.last_type, \
                    last_payload = excluded.last_payload",
                params![
                    update.patient_id,
                    update.updated_at,
                    update.last_at,
                    baseline,
                    carried,
                    last_absolute,
                    live,
                    update.active_walk_seconds,
                    update.active_stair_seconds,
                    update.last_type,
                    last
                ],
            )
            .map_err(|err| format!("Failed to write sample state: {}", err))?;
            Ok(())
        })
    }

    /// Flips the current session to inactive and clears `okPending`. Leaves
    /// counters alone so the next start can seed from them.
    pub fn deactivate_session(
        &self,
        patient_id: &str,
        updated_at: &str,
        auto_stopped: bool,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE current_session SET \
                    active = 0, ok_pending = 0, updated_at = ?2, \
                    auto_stopped = CASE WHEN ?3 THEN 1 ELSE auto_stopped END \
                 WHERE patient_id = ?1",
                params![patient_id, updated_at, auto_stopped],
            )
            .map_err(|err| format!("Failed to deactivate session: {}", err))?;
            Ok(())
        })
    }

    pub fn set_ok_pending(
        &self,
        patient_id: &str,
        ok_pending: bool,
        updated_at: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE current_session SET ok_pending = ?2, updated_at = ?3 \
                 WHERE patient_id = ?1",
                params![patient_id, ok_pending, updated_at],
            )
            .map_err(|err| format!("Failed to update okPending: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_session(&self, record: &HistoricalSession) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions \
                    (session_id, patient_id, date_key, start_time, end_time, total_steps, \
                     stairs_count, falls_count, alerts_count, active_walk_seconds, \
                     active_stair_seconds, avg_steps_pace, avg_stairs_pace, auto_stopped, \
                     last_updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                 ON CONFLICT(session_id) DO NOTHING",
                params![
                    record.session_id,
                    record.patient_id,
                    record.date_key,
                    record.start_time,
                    record.end_time,
                    to_sql_count(record.total_steps),
                    to_sql_count(record.stairs_count),
                    to_sql_count(record.falls_count),
                    to_sql_count(record.alerts_count),
                    record.active_walk_seconds,
                    record.active_stair_seconds,
                    record.avg_steps_pace.map(to_sql_count),
                    record.avg_stairs_pace.map(to_sql_count),
                    record.auto_stopped,
                    record.last_updated_at
                ],
            )
            .map_err(|err| format!("Failed to insert session: {}", err))?;
            Ok(())
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<HistoricalSession>, String> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS);
            conn.query_row(&sql, params![session_id], historical_session_from_row)
                .optional()
                .map_err(|err| format!("Failed to query session: {}", err))
        })
    }

    pub fn list_sessions(
        &self,
        patient_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoricalSession>, String> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM sessions WHERE patient_id = ?1 \
                 ORDER BY start_time DESC, rowid DESC LIMIT ?2",
                SESSION_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|err| format!("Failed to prepare sessions query: {}", err))?;
            let rows = stmt
                .query_map(params![patient_id, limit as i64], historical_session_from_row)
                .map_err(|err| format!("Failed to query sessions: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })
    }

    /// Adds sample increments to an open history row. Closed rows are final.
    pub fn increment_session(
        &self,
        session_id: &str,
        increments: &Increments,
        updated_at: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            // Counts saturate at i64::MAX; an overflowing `+` would turn the
            // column into REAL and break every later read.
            conn.execute(
                "UPDATE sessions SET \
                    total_steps = MIN(total_steps, 9223372036854775807 - ?2) + ?2, \
                    stairs_count = MIN(stairs_count, 9223372036854775807 - ?3) + ?3, \
                    falls_count = MIN(falls_count, 9223372036854775807 - ?4) + ?4, \
                    alerts_count = MIN(alerts_count, 9223372036854775807 - ?5) + ?5, \
                    active_walk_seconds = active_walk_seconds + ?6, \
                    active_stair_seconds = active_stair_seconds + ?7, \
                    last_updated_at = ?8 \
                 WHERE session_id = ?1 AND end_time IS NULL",
                params![
                    session_id,
                    to_sql_count(increments.total_steps),
                    to_sql_count(increments.stairs_count),
                    to_sql_count(increments.falls_count),
                    to_sql_count(increments.alerts_count),
                    increments.active_walk_seconds,
                    increments.active_stair_seconds,
                    updated_at
                ],
            )
            .map_err(|err| format!("Failed to increment session: {}", err))?;
            Ok(())
        })
    }

    /// Overwrites running totals with the final live values. `alertsCount`
    /// keeps its accumulated value.
    pub fn finalize_session(&self, close: &SessionClose) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET \
                    end_time = ?2, \
                    total_steps = ?3, \
                    stairs_count = ?4, \
                    falls_count = ?5, \
                    active_walk_seconds = ?6, \
                    active_stair_seconds = ?7, \
                    avg_steps_pace = ?8, \
                    avg_stairs_pace = ?9, \
                    auto_stopped = ?10, \
                    last_updated_at = ?2 \
                 WHERE session_id = ?1 AND end_time IS NULL",
                params![
                    close.session_id,
                    close.end_time,
                    to_sql_count(close.total_steps),
                    to_sql_count(close.stairs_count),
                    to_sql_count(close.falls_count),
                    close.active_walk_seconds,
                    close.active_stair_seconds,
                    to_sql_count(close.avg_steps_pace),
                    to_sql_count(close.avg_stairs_pace),
                    close.auto_stopped
                ],
            )
            .map_err(|err| format!("Failed to finalize session: {}", err))?;
            Ok(())
        })
    }

    pub fn increment_daily(
        &self,
        patient_id: &str,
        date_key: &str,
        increments: &Increments,
        updated_at: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO daily \
                    (patient_id, date_key, sessions_count, total_steps, stairs_count, \
                     falls_count, alerts_count, active_walk_seconds, active_stair_seconds, \
                     last_updated_at) \
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(patient_id, date_key) DO UPDATE SET \
                    total_steps = MIN(daily.total_steps, \
                        9223372036854775807 - excluded.total_steps) + excluded.total_steps, \
                    stairs_count = MIN(daily.stairs_count, \
                        9223372036854775807 - excluded.stairs_count) + excluded.stairs_count, \
                    falls_count = MIN(daily.falls_count, \
                        9223372036854775807 - excluded.falls_count) + excluded.falls_count, \
                    alerts_count = MIN(daily.alerts_count, \
                        9223372036854775807 - excluded.alerts_count) + excluded.alerts_count, \
                    active_walk_seconds = daily.active_walk_seconds + excluded.active_walk_seconds, \
                    active_stair_seconds = daily.active_stair_seconds + excluded.active_stair_seconds, \
                    last_updated_at = excluded.last_updated_at",
                params![
                    patient_id,
                    date_key,
                    to_sql_count(increments.total_steps),
                    to_sql_count(increments.stairs_count),
                    to_sql_count(increments.falls_count),
                    to_sql_count(increments.alerts_count),
                    increments.active_walk_seconds,
                    increments.active_stair_seconds,
                    updated_at
                ],
            )
            .map_err(|err| format!("Failed to increment daily aggregate: {}", err))?;
            Ok(())
        })
    }

    pub fn bump_sessions_count(
        &self,
        patient_id: &str,
        date_key: &str,
        updated_at: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO daily \
                    (patient_id, date_key, sessions_count, total_steps, stairs_count, \
                     falls_count, alerts_count, active_walk_seconds, active_stair_seconds, \
                     last_updated_at) \
                 VALUES (?1, ?2, 1, 0, 0, 0, 0, 0, 0, ?3) \
                 ON CONFLICT(patient_id, date_key) DO UPDATE SET \
                    sessions_count = daily.sessions_count + 1, \
                    last_updated_at = excluded.last_updated_at",
                params![patient_id, date_key, updated_at],
            )
            .map_err(|err| format!("Failed to bump sessions count: {}", err))?;
            Ok(())
        })
    }

    pub fn get_daily(
        &self,
        patient_id: &str,
        date_key: &str,
    ) -> Result<Option<DailyAggregate>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT patient_id, date_key, sessions_count, total_steps, stairs_count, \
                        falls_count, alerts_count, active_walk_seconds, active_stair_seconds, \
                        last_updated_at \
                 FROM daily WHERE patient_id = ?1 AND date_key = ?2",
                params![patient_id, date_key],
                |row| {
                    Ok(DailyAggregate {
                        patient_id: row.get(0)?,
                        date_key: row.get(1)?,
                        sessions_count: from_sql_count(row.get(2)?),
                        total_steps: from_sql_count(row.get(3)?),
                        stairs_count: from_sql_count(row.get(4)?),
                        falls_count: from_sql_count(row.get(5)?),
                        alerts_count: from_sql_count(row.get(6)?),
                        active_walk_seconds: row.get(7)?,
                        active_stair_seconds: row.get(8)?,
                        last_updated_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query daily aggregate: {}", err))
        })
    }

    pub fn insert_alert(&self, alert: &AlertRecord) -> Result<(), String> {
        let payload = encode_json(&alert.payload)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO alerts \
                    (alert_id, patient_id, type, session_id, timestamp, handled, handled_at, \
                     handled_by, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    alert.alert_id,
                    alert.patient_id,
                    alert.alert_type,
                    alert.session_id,
                    alert.timestamp,
                    alert.handled,
                    alert.handled_at,
                    alert.handled_by.map(|by| by.as_str()),
                    payload
                ],
            )
            .map_err(|err| format!("Failed to insert alert: {}", err))?;
            Ok(())
        })
    }

    pub fn get_alert(&self, patient_id: &str, alert_id: &str) -> Result<Option<AlertRecord>, String> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM alerts WHERE patient_id = ?1 AND alert_id = ?2",
                ALERT_COLUMNS
            );
            conn.query_row(&sql, params![patient_id, alert_id], alert_from_row)
                .optional()
                .map_err(|err| format!("Failed to query alert: {}", err))
        })
    }

    /// Newest unhandled alert; insertion order breaks timestamp ties.
    pub fn latest_unhandled_alert(&self, patient_id: &str) -> Result<Option<AlertRecord>, String> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM alerts WHERE patient_id = ?1 AND handled = 0 \
                 ORDER BY timestamp DESC, rowid DESC LIMIT 1",
                ALERT_COLUMNS
            );
            conn.query_row(&sql, params![patient_id], alert_from_row)
                .optional()
                .map_err(|err| format!("Failed to query unhandled alert: {}", err))
        })
    }

    /// Returns whether a row was updated. Handled alerts stay handled; a later
    /// acknowledgment only rewrites who and when.
    pub fn mark_alert_handled(
        &self,
        patient_id: &str,
        alert_id: &str,
        handled_by: HandledBy,
        handled_at: &str,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE alerts SET handled = 1, handled_at = ?3, handled_by = ?4 \
                 WHERE patient_id = ?1 AND alert_id = ?2",
                params![patient_id, alert_id, handled_at, handled_by.as_str()],
            )
            .map(|count| count > 0)
            .map_err(|err| format!("Failed to mark alert handled: {}", err))
        })
    }

    pub fn list_alerts(&self, patient_id: &str, limit: usize) -> Result<Vec<AlertRecord>, String> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM alerts WHERE patient_id = ?1 \
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
                ALERT_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|err| format!("Failed to prepare alerts query: {}", err))?;
            let rows = stmt
                .query_map(params![patient_id, limit as i64], alert_from_row)
                .map_err(|err| format!("Failed to query alerts: {}", err))?;

            let mut alerts = Vec::new();
            for row in rows {
                alerts.push(row.map_err(|err| format!("Failed to decode alert row: {}", err))?);
            }
            Ok(alerts)
        })
    }

    pub fn upsert_device_token(
        &self,
        patient_id: &str,
        row: &DeviceTokenRow,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO device_tokens (patient_id, token_id, token, role, platform, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(patient_id, token_id) DO UPDATE SET \
                    token = excluded.token, \
                    role = excluded.role, \
                    platform = excluded.platform, \
                    updated_at = excluded.updated_at",
                params![
                    patient_id,
                    row.token_id,
                    row.token,
                    row.role,
                    row.platform,
                    row.updated_at
                ],
            )
            .map_err(|err| format!("Failed to upsert device token: {}", err))?;
            Ok(())
        })
    }

    pub fn tokens_by_role(&self, patient_id: &str, role: &str) -> Result<Vec<DeviceTokenRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT token_id, token, role, platform, updated_at FROM device_tokens \
                     WHERE patient_id = ?1 AND role = ?2 ORDER BY updated_at ASC, token_id ASC",
                )
                .map_err(|err| format!("Failed to prepare device token query: {}", err))?;
            let rows = stmt
                .query_map(params![patient_id, role], |row| {
                    Ok(DeviceTokenRow {
                        token_id: row.get(0)?,
                        token: row.get(1)?,
                        role: row.get(2)?,
                        platform: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })
                .map_err(|err| format!("Failed to query device tokens: {}", err))?;

            let mut tokens = Vec::new();
            for row in rows {
                tokens.push(row.map_err(|err| format!("Failed to decode device token: {}", err))?);
            }
            Ok(tokens)
        })
    }

    pub fn delete_device_token(&self, patient_id: &str, token_id: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM device_tokens WHERE patient_id = ?1 AND token_id = ?2",
                params![patient_id, token_id],
            )
            .map_err(|err| format!("Failed to delete device token: {}", err))?;
            Ok(())
        })
    }

    /// Records a sample id for deduplication. Returns false when the id was
    /// already claimed, in which case nothing is written.
    pub fn claim_sample(
        &self,
        patient_id: &str,
        sample_id: &str,
        sample_type: &str,
        payload: &Value,
        recorded_at: &str,
    ) -> Result<bool, String> {
        let payload = encode_json(payload)?;
        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO samples (patient_id, sample_id, sample_type, recorded_at, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(patient_id, sample_id) DO NOTHING",
                    params![patient_id, sample_id, sample_type, recorded_at, payload],
                )
                .map_err(|err| format!("Failed to claim sample: {}", err))?;
            Ok(inserted == 1)
        })
    }

    /// Drops a claim so a sample whose processing failed can be retried.
    pub fn release_sample(&self, patient_id: &str, sample_id: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM samples WHERE patient_id = ?1 AND sample_id = ?2",
                params![patient_id, sample_id],
            )
            .map_err(|err| format!("Failed to release sample: {}", err))?;
            Ok(())
        })
    }

    /// Deletes sample ids recorded before `cutoff` (RFC 3339, UTC).
    pub fn prune_samples(&self, patient_id: &str, cutoff: &str) -> Result<usize, String> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM samples WHERE patient_id = ?1 AND recorded_at < ?2",
                params![patient_id, cutoff],
            )
            .map_err(|err| format!("Failed to prune samples: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS current_session (
                    patient_id TEXT PRIMARY KEY,
                    active INTEGER NOT NULL DEFAULT 0,
                    session_id TEXT,
                    date_key TEXT,
                    started_at TEXT,
                    updated_at TEXT,
                    last_at TEXT,
                    baseline TEXT NOT NULL,
                    carried TEXT NOT NULL,
                    last_absolute TEXT NOT NULL,
                    live TEXT NOT NULL,
                    active_walk_seconds REAL NOT NULL DEFAULT 0,
                    active_stair_seconds REAL NOT NULL DEFAULT 0,
                    ok_pending INTEGER NOT NULL DEFAULT 0,
                    auto_stopped INTEGER NOT NULL DEFAULT 0,
                    last_type TEXT,
                    last_payload TEXT
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    patient_id TEXT NOT NULL,
                    date_key TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT,
                    total_steps INTEGER NOT NULL DEFAULT 0,
                    stairs_count INTEGER NOT NULL DEFAULT 0,
                    falls_count INTEGER NOT NULL DEFAULT 0,
                    alerts_count INTEGER NOT NULL DEFAULT 0,
                    active_walk_seconds REAL NOT NULL DEFAULT 0,
                    active_stair_seconds REAL NOT NULL DEFAULT 0,
                    avg_steps_pace INTEGER,
                    avg_stairs_pace INTEGER,
                    auto_stopped INTEGER NOT NULL DEFAULT 0,
                    last_updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS sessions_by_patient
                    ON sessions (patient_id, start_time);
                 CREATE TABLE IF NOT EXISTS daily (
                    patient_id TEXT NOT NULL,
                    date_key TEXT NOT NULL,
                    sessions_count INTEGER NOT NULL DEFAULT 0,
                    total_steps INTEGER NOT NULL DEFAULT 0,
                    stairs_count INTEGER NOT NULL DEFAULT 0,
                    falls_count INTEGER NOT NULL DEFAULT 0,
                    alerts_count INTEGER NOT NULL DEFAULT 0,
                    active_walk_seconds REAL NOT NULL DEFAULT 0,
                    active_stair_seconds REAL NOT NULL DEFAULT 0,
                    last_updated_at TEXT NOT NULL,
                    PRIMARY KEY (patient_id, date_key)
                 );
                 CREATE TABLE IF NOT EXISTS alerts (
                    alert_id TEXT PRIMARY KEY,
                    patient_id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    session_id TEXT,
                    timestamp TEXT NOT NULL,
                    handled INTEGER NOT NULL DEFAULT 0,
                    handled_at TEXT,
                    handled_by TEXT,
                    payload TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS alerts_by_patient
                    ON alerts (patient_id, handled, timestamp);
                 CREATE TABLE IF NOT EXISTS device_tokens (
                    patient_id TEXT NOT NULL,
                    token_id TEXT NOT NULL,
                    token TEXT NOT NULL,
                    role TEXT NOT NULL,
                    platform TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (patient_id, token_id)
                 );
                 CREATE TABLE IF NOT EXISTS samples (
                    patient_id TEXT NOT NULL,
                    sample_id TEXT NOT NULL,
                    sample_type TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (patient_id, sample_id)
                 );
                 CREATE INDEX IF NOT EXISTS samples_by_recorded
                    ON samples (patient_id, recorded_at);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn current_session_from_row(row: &Row<'_>) -> rusqlite::Result<CurrentSession> {
    let baseline: Counters = decode_json_column(row, 7)?;
    let carried: Counters = decode_json_column(row, 8)?;
    let last_absolute: Counters = decode_json_column(row, 9)?;
    let live: LiveView = decode_json_column(row, 10)?;
    let last: Option<String> = row.get(16)?;
    let last = match last {
        Some(text) => Some(decode_json(16, &text)?),
        None => None,
    };

    Ok(CurrentSession {
        patient_id: row.get(0)?,
        active: row.get(1)?,
        session_id: row.get(2)?,
        date_key: row.get(3)?,
        started_at: row.get(4)?,
        updated_at: row.get(5)?,
        last_at: row.get(6)?,
        baseline,
        carried,
        last_absolute,
        live,
        active_walk_seconds: row.get(11)?,
        active_stair_seconds: row.get(12)?,
        ok_pending: row.get(13)?,
        auto_stopped: row.get(14)?,
        last_type: row.get(15)?,
        last,
    })
}

fn historical_session_from_row(row: &Row<'_>) -> rusqlite::Result<HistoricalSession> {
    Ok(HistoricalSession {
        session_id: row.get(0)?,
        patient_id: row.get(1)?,
        date_key: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        total_steps: from_sql_count(row.get(5)?),
        stairs_count: from_sql_count(row.get(6)?),
        falls_count: from_sql_count(row.get(7)?),
        alerts_count: from_sql_count(row.get(8)?),
        active_walk_seconds: row.get(9)?,
        active_stair_seconds: row.get(10)?,
        avg_steps_pace: row.get::<_, Option<i64>>(11)?.map(from_sql_count),
        avg_stairs_pace: row.get::<_, Option<i64>>(12)?.map(from_sql_count),
        auto_stopped: row.get(13)?,
        last_updated_at: row.get(14)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    let handled_by: Option<String> = row.get(7)?;
    let handled_by = match handled_by {
        Some(raw) => Some(HandledBy::parse(&raw).ok_or_else(|| {
            conversion_error(7, format!("Unknown alert handler: {}", raw))
        })?),
        None => None,
    };

    Ok(AlertRecord {
        alert_id: row.get(0)?,
        patient_id: row.get(1)?,
        alert_type: row.get(2)?,
        session_id: row.get(3)?,
        timestamp: row.get(4)?,
        handled: row.get(5)?,
        handled_at: row.get(6)?,
        handled_by,
        payload: decode_json_column(row, 8)?,
    })
}

fn decode_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(index)?;
    decode_json(index, &text)
}

fn decode_json<T: serde::de::DeserializeOwned>(index: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|err| conversion_error(index, err.to_string()))
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|err| format!("Failed to serialize column: {}", err))
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::CounterState;
    use crate::session::{open_session, StartOutcome};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, db)
    }

    fn now() -> DateTime<Utc> {
        crate::calendar::parse_rfc3339("2026-03-02T08:00:00Z").expect("timestamp")
    }

    fn opened(patient_id: &str, session_id: &str) -> (CurrentSession, HistoricalSession) {
        match open_session(
            None,
            patient_id,
            session_id.to_string(),
            "2026-03-02".to_string(),
            now(),
        ) {
            StartOutcome::Started(opening) => (opening.current, opening.record),
            other => panic!("expected start, got {:?}", other),
        }
    }

    fn alert(alert_id: &str, timestamp: &str) -> AlertRecord {
        AlertRecord {
            alert_id: alert_id.to_string(),
            patient_id: "p1".to_string(),
            alert_type: "fall_alert".to_string(),
            session_id: None,
            timestamp: timestamp.to_string(),
            handled: false,
            handled_at: None,
            handled_by: None,
            payload: json!({ "note": "Realtime" }),
        }
    }

    #[test]
    fn schema_includes_all_tables() {
        let (_dir, db) = test_db();
        let tables = db
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
                    .map_err(|err| format!("Failed to query sqlite_master: {}", err))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|err| format!("Failed to read sqlite_master rows: {}", err))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row.map_err(|err| format!("Failed to decode table name: {}", err))?);
                }
                Ok(names)
            })
            .expect("tables");

        for table in [
            "current_session",
            "sessions",
            "daily",
            "alerts",
            "device_tokens",
            "samples",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn current_session_round_trips() {
        let (_dir, db) = test_db();
        let (mut current, _) = opened("p1", "s-1");
        current.baseline.steps = 40;
        current.last = Some(json!({ "type": "telemetry", "steps": 40 }));

        db.put_current_session(&current).expect("put");
        let loaded = db
            .get_current_session("p1")
            .expect("query")
            .expect("row");
        assert_eq!(loaded, current);
        assert!(db.get_current_session("p2").expect("query").is_none());
    }

    #[test]
    fn sample_write_keeps_session_fields() {
        let (_dir, db) = test_db();
        let (mut current, _) = opened("p1", "s-1");
        current.ok_pending = true;
        db.put_current_session(&current).expect("put");

        let mut live = LiveView::default();
        live.steps = 12;
        live.source = "esp32".to_string();
        db.write_sample_state(&LiveUpdate {
            patient_id: "p1".to_string(),
            counters: CounterState {
                last_absolute: Counters {
                    steps: 12,
                    stairs: 0,
                    falls: 0,
                },
                live: live.counts(),
                ..CounterState::default()
            },
            live: live.clone(),
            active_walk_seconds: 4.0,
            active_stair_seconds: 0.0,
            last_at: "2026-03-02T08:00:04.000Z".to_string(),
            updated_at: "2026-03-02T08:00:04.000Z".to_string(),
            last_type: "telemetry".to_string(),
            last: json!({ "steps": 12 }),
        })
        .expect("write sample");

        let loaded = db.get_current_session("p1").expect("query").expect("row");
        assert!(loaded.active);
        assert!(loaded.ok_pending);
        assert_eq!(loaded.session_id.as_deref(), Some("s-1"));
        assert_eq!(loaded.live, live);
        assert_eq!(loaded.last_absolute.steps, 12);
        assert_eq!(loaded.active_walk_seconds, 4.0);
    }

    #[test]
    fn sample_write_creates_row_for_unknown_patient() {
        let (_dir, db) = test_db();
        db.write_sample_state(&LiveUpdate {
            patient_id: "p9".to_string(),
            counters: CounterState::default(),
            live: LiveView::default(),
            active_walk_seconds: 0.0,
            active_stair_seconds: 0.0,
            last_at: "2026-03-02T08:00:00.000Z".to_string(),
            updated_at: "2026-03-02T08:00:00.000Z".to_string(),
            last_type: "telemetry".to_string(),
            last: json!({}),
        })
        .expect("write sample");

        let loaded = db.get_current_session("p9").expect("query").expect("row");
        assert!(!loaded.active);
        assert!(loaded.session_id.is_none());
    }

    #[test]
    fn deactivate_clears_ok_pending_and_marks_auto_stop() {
        let (_dir, db) = test_db();
        let (mut current, _) = opened("p1", "s-1");
        current.ok_pending = true;
        db.put_current_session(&current).expect("put");

        db.deactivate_session("p1", "2026-03-02T09:00:00.000Z", true)
            .expect("deactivate");
        let loaded = db.get_current_session("p1").expect("query").expect("row");
        assert!(!loaded.active);
        assert!(!loaded.ok_pending);
        assert!(loaded.auto_stopped);
    }

    #[test]
    fn closed_session_ignores_further_increments() {
        let (_dir, db) = test_db();
        let (_, record) = opened("p1", "s-1");
        db.insert_session(&record).expect("insert");

        let increments = Increments {
            total_steps: 10,
            alerts_count: 1,
            active_walk_seconds: 5.0,
            ..Increments::default()
        };
        db.increment_session("s-1", &increments, "2026-03-02T08:00:05.000Z")
            .expect("increment");

        db.finalize_session(&SessionClose {
            session_id: "s-1".to_string(),
            end_time: "2026-03-02T08:10:00.000Z".to_string(),
            total_steps: 12,
            stairs_count: 0,
            falls_count: 0,
            active_walk_seconds: 6.0,
            active_stair_seconds: 0.0,
            avg_steps_pace: 120,
            avg_stairs_pace: 0,
            auto_stopped: false,
        })
        .expect("finalize");

        db.increment_session("s-1", &increments, "2026-03-02T08:11:00.000Z")
            .expect("late increment");

        let loaded = db.get_session("s-1").expect("query").expect("row");
        assert_eq!(loaded.total_steps, 12);
        assert_eq!(loaded.alerts_count, 1);
        assert_eq!(loaded.avg_steps_pace, Some(120));
        assert_eq!(loaded.end_time.as_deref(), Some("2026-03-02T08:10:00.000Z"));
    }

    #[test]
    fn daily_increments_are_additive() {
        let (_dir, db) = test_db();
        db.bump_sessions_count("p1", "2026-03-02", "t0").expect("bump");
        let increments = Increments {
            total_steps: 7,
            active_walk_seconds: 2.5,
            ..Increments::default()
        };
        db.increment_daily("p1", "2026-03-02", &increments, "t1")
            .expect("first");
        db.increment_daily("p1", "2026-03-02", &increments, "t2")
            .expect("second");

        let daily = db.get_daily("p1", "2026-03-02").expect("query").expect("row");
        assert_eq!(daily.sessions_count, 1);
        assert_eq!(daily.total_steps, 14);
        assert_eq!(daily.active_walk_seconds, 5.0);
        assert_eq!(daily.last_updated_at, "t2");
        assert!(db.get_daily("p1", "2026-03-03").expect("query").is_none());
    }

    #[test]
    fn latest_unhandled_alert_prefers_newest_insert_on_tie() {
        let (_dir, db) = test_db();
        db.insert_alert(&alert("a-1", "2026-03-02T08:00:00.000Z"))
            .expect("a-1");
        db.insert_alert(&alert("a-2", "2026-03-02T08:00:00.000Z"))
            .expect("a-2");
        db.insert_alert(&alert("a-0", "2026-03-02T07:00:00.000Z"))
            .expect("a-0");

        let latest = db
            .latest_unhandled_alert("p1")
            .expect("query")
            .expect("alert");
        assert_eq!(latest.alert_id, "a-2");

        assert!(db
            .mark_alert_handled("p1", "a-2", HandledBy::Patient, "t1")
            .expect("mark"));
        let latest = db
            .latest_unhandled_alert("p1")
            .expect("query")
            .expect("alert");
        assert_eq!(latest.alert_id, "a-1");

        let handled = db.get_alert("p1", "a-2").expect("query").expect("row");
        assert!(handled.handled);
        assert_eq!(handled.handled_by, Some(HandledBy::Patient));
        assert!(!db
            .mark_alert_handled("p1", "missing", HandledBy::Caregiver, "t2")
            .expect("mark missing"));
    }

    #[test]
    fn device_tokens_upsert_by_id_and_filter_by_role() {
        let (_dir, db) = test_db();
        let row = |token: &str, role: &str| DeviceTokenRow {
            token_id: format!("id-{}", token),
            token: token.to_string(),
            role: role.to_string(),
            platform: Some("android".to_string()),
            updated_at: "t0".to_string(),
        };
        db.upsert_device_token("p1", &row("a", "caregiver"))
            .expect("a");
        db.upsert_device_token("p1", &row("b", "patient")).expect("b");
        db.upsert_device_token("p1", &row("a", "patient"))
            .expect("a again");

        assert!(db.tokens_by_role("p1", "caregiver").expect("query").is_empty());
        assert_eq!(db.tokens_by_role("p1", "patient").expect("query").len(), 2);

        db.delete_device_token("p1", "id-a").expect("delete");
        let remaining = db.tokens_by_role("p1", "patient").expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].token, "b");
    }

    #[test]
    fn sample_claim_is_exclusive() {
        let (_dir, db) = test_db();
        let first = db
            .claim_sample("p1", "smp-1", "telemetry", &json!({ "steps": 1 }), "t0")
            .expect("claim");
        let again = db
            .claim_sample("p1", "smp-1", "telemetry", &json!({ "steps": 2 }), "t1")
            .expect("claim again");
        let other_patient = db
            .claim_sample("p2", "smp-1", "telemetry", &json!({ "steps": 1 }), "t0")
            .expect("claim other patient");
        assert!(first);
        assert!(!again);
        assert!(other_patient);

        db.release_sample("p1", "smp-1").expect("release");
        assert!(db
            .claim_sample("p1", "smp-1", "telemetry", &json!({ "steps": 1 }), "t2")
            .expect("reclaim"));
    }

    #[test]
    fn prune_drops_only_old_samples() {
        let (_dir, db) = test_db();
        db.claim_sample("p1", "old", "telemetry", &json!({}), "2026-03-01T08:00:00Z")
            .expect("old");
        db.claim_sample("p1", "new", "telemetry", &json!({}), "2026-03-03T08:00:00Z")
            .expect("new");
        db.claim_sample("p2", "old", "telemetry", &json!({}), "2026-03-01T08:00:00Z")
            .expect("other patient");

        let pruned = db
            .prune_samples("p1", "2026-03-02T08:00:00Z")
            .expect("prune");
        assert_eq!(pruned, 1);

        assert!(db
            .claim_sample("p1", "old", "telemetry", &json!({}), "2026-03-03T09:00:00Z")
            .expect("old id is free again"));
        assert!(!db
            .claim_sample("p1", "new", "telemetry", &json!({}), "2026-03-03T09:00:00Z")
            .expect("new id still held"));
        assert!(!db
            .claim_sample("p2", "old", "telemetry", &json!({}), "2026-03-03T09:00:00Z")
            .expect("other patient untouched"));
    }

    #[test]
    fn daily_counts_saturate_instead_of_overflowing() {
        let (_dir, db) = test_db();
        let huge = Increments {
            total_steps: u64::MAX,
            ..Increments::default()
        };
        db.increment_daily("p1", "2026-03-02", &huge, "t0").expect("first");
        db.increment_daily("p1", "2026-03-02", &huge, "t1").expect("second");

        let daily = db
            .get_daily("p1", "2026-03-02")
            .expect("daily reads")
            .expect("row");
        assert_eq!(daily.total_steps, i64::MAX as u64);
    }
}
