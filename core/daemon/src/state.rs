//! Request-level orchestration for the daemon.
//!
//! Each operation reads the stored records once, runs the pure transitions in
//! `session`, `reconcile`, `attribution` and `alerts` against a single `now`,
//! then applies the resulting writes. Writes are individually atomic but not
//! transactional with each other; every step is safe to repeat when a client
//! retries the whole request.

use carewalk_daemon_protocol::{DeviceRole, HistoryParams, RegisterTokenParams, SampleEnvelope};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread::JoinHandle;
use ulid::Ulid;

use crate::aggregates::{DailyAggregate, Increments};
use crate::alerts::{build_alert, decide_alert, AlertRecord, HandledBy};
use crate::attribution::{attribute, elapsed_secs, pace};
use crate::calendar::{date_key, timestamp};
use crate::config::RuntimeConfig;
use crate::db::{Db, DeviceTokenRow};
use crate::error::EngineError;
use crate::notify::{send_push_to_role, spawn_alert_fanout, token_doc_id, KIND_PATIENT_OK};
use crate::push::{PushChannel, PushNotification};
use crate::reconcile::reconcile;
use crate::session::{
    close_session, open_session, should_auto_stop, CurrentSession, HistoricalSession, LiveUpdate,
    LiveView, StartOutcome, UNKNOWN_SOURCE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterReply {
    pub ok: bool,
    pub token_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReply {
    pub active: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReply {
    pub active: bool,
    /// Session that this call closed, if any.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleReceipt {
    pub saved: bool,
    pub duplicate: bool,
    pub auto_stopped: bool,
    pub alert_id: Option<String>,
    pub live: LiveView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReply {
    pub ok: bool,
    pub alert_id: Option<String>,
}

#[derive(Debug)]
pub struct SampleOutcome {
    pub receipt: SampleReceipt,
    /// Caregiver notification for a new alert, already running.
    pub fanout: Option<JoinHandle<()>>,
}

pub struct SharedState {
    db: Db,
    config: RuntimeConfig,
    tz: Tz,
    push: Arc<dyn PushChannel>,
}

impl SharedState {
    pub fn new(db: Db, config: RuntimeConfig, push: Arc<dyn PushChannel>) -> Result<Self, String> {
        let tz = config.calendar.reference_timezone()?;
        Ok(Self {
            db,
            config,
            tz,
            push,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn session_state(&self, patient_id: &str) -> Result<CurrentSession, EngineError> {
        Ok(self
            .db
            .get_current_session(patient_id)?
            .unwrap_or_else(|| CurrentSession::empty(patient_id)))
    }

    pub fn register_token(
        &self,
        params: &RegisterTokenParams,
        now: DateTime<Utc>,
    ) -> Result<RegisterReply, EngineError> {
        let patient_id = params.patient_id();
        let row = DeviceTokenRow {
            token_id: token_doc_id(&params.token),
            token: params.token.clone(),
            role: params.role.as_str().to_string(),
            platform: params.platform.clone(),
            updated_at: timestamp(now),
        };
        self.db.upsert_device_token(patient_id, &row)?;
        tracing::info!(
            patient_id = %patient_id,
            role = %row.role,
            token_id = %row.token_id,
            "Device token registered"
        );
        Ok(RegisterReply {
            ok: true,
            token_id: row.token_id,
        })
    }

    pub fn start_session(
        &self,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StartReply, EngineError> {
        let current = self.db.get_current_session(patient_id)?;
        let day = date_key(now, self.tz);
        let outcome = open_session(
            current.as_ref(),
            patient_id,
            Ulid::new().to_string(),
            day.clone(),
            now,
        );

        match outcome {
            StartOutcome::AlreadyActive { session_id } => {
                tracing::debug!(
                    patient_id = %patient_id,
                    session_id = %session_id,
                    "Session already active"
                );
                Ok(StartReply {
                    active: true,
                    session_id,
                    already_active: true,
                })
            }
            StartOutcome::Started(opening) => {
                let now_str = timestamp(now);
                self.db.insert_session(&opening.record)?;
                self.db.bump_sessions_count(patient_id, &day, &now_str)?;
                self.db.put_current_session(&opening.current)?;
                tracing::info!(
                    patient_id = %patient_id,
                    session_id = %opening.record.session_id,
                    date_key = %day,
                    baseline_steps = opening.current.baseline.steps,
                    "Session started"
                );
                Ok(StartReply {
                    active: true,
                    session_id: opening.record.session_id,
                    already_active: false,
                })
            }
        }
    }

    pub fn stop_session(
        &self,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StopReply, EngineError> {
        let Some(current) = self.db.get_current_session(patient_id)? else {
            return Ok(StopReply {
                active: false,
                session_id: None,
            });
        };

        let close = close_session(&current, now, false);
        self.db
            .deactivate_session(patient_id, &timestamp(now), false)?;

        let Some(close) = close else {
            return Ok(StopReply {
                active: false,
                session_id: None,
            });
        };
        self.db.finalize_session(&close)?;
        tracing::info!(
            patient_id = %patient_id,
            session_id = %close.session_id,
            total_steps = close.total_steps,
            stairs_count = close.stairs_count,
            avg_steps_pace = close.avg_steps_pace,
            "Session stopped"
        );
        Ok(StopReply {
            active: false,
            session_id: Some(close.session_id),
        })
    }

    pub fn receive_sample(
        &self,
        sample: &SampleEnvelope,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> Result<SampleOutcome, EngineError> {
        sample.validate()?;
        let patient_id = sample.patient_id();
        let sample_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_else(|| sample.sample_type.as_str())
            .to_string();

        let Some(sample_id) = sample.sample_id.as_deref() else {
            return self.apply_sample(sample, raw, &sample_type, now);
        };

        // The id is claimed before any write so that concurrent deliveries of
        // the same sample apply it once.
        if !self
            .db
            .claim_sample(patient_id, sample_id, &sample_type, raw, &timestamp(now))?
        {
            tracing::debug!(
                patient_id = %patient_id,
                sample_id = %sample_id,
                "Duplicate sample ignored"
            );
            let current = self.session_state(patient_id)?;
            return Ok(SampleOutcome {
                receipt: SampleReceipt {
                    saved: true,
                    duplicate: true,
                    auto_stopped: false,
                    alert_id: None,
                    live: current.live,
                },
                fanout: None,
            });
        }
        self.prune_samples(patient_id, now);

        self.apply_sample(sample, raw, &sample_type, now)
            .inspect_err(|err| {
                if let Err(release_err) = self.db.release_sample(patient_id, sample_id) {
                    tracing::warn!(
                        patient_id = %patient_id,
                        sample_id = %sample_id,
                        error = %release_err,
                        sample_error = %err,
                        "Failed to release sample after error"
                    );
                }
            })
    }

    fn prune_samples(&self, patient_id: &str, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(self.config.session.sample_retention()) else {
            return;
        };
        match self.db.prune_samples(patient_id, &timestamp(cutoff)) {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(
                patient_id = %patient_id,
                pruned,
                "Pruned expired sample ids"
            ),
            Err(err) => tracing::warn!(
                patient_id = %patient_id,
                error = %err,
                "Failed to prune sample ids"
            ),
        }
    }

    fn apply_sample(
        &self,
        sample: &SampleEnvelope,
        raw: &Value,
        sample_type: &str,
        now: DateTime<Utc>,
    ) -> Result<SampleOutcome, EngineError> {
        let patient_id = sample.patient_id();
        let now_str = timestamp(now);
        let session_config = &self.config.session;

        let mut current = self.session_state(patient_id)?;

        let mut auto_stopped = false;
        if should_auto_stop(&current, now, session_config.auto_stop_after()) {
            if let Some(close) = close_session(&current, now, true) {
                self.db.deactivate_session(patient_id, &now_str, true)?;
                self.db.finalize_session(&close)?;
                tracing::info!(
                    patient_id = %patient_id,
                    session_id = %close.session_id,
                    started_at = ?current.started_at,
                    "Session auto-stopped"
                );
            }
            current.active = false;
            current.ok_pending = false;
            current.auto_stopped = true;
            auto_stopped = true;
        }

        let reconciled = reconcile(&current.counter_state(), sample.counters());
        if reconciled.reset {
            tracing::info!(
                patient_id = %patient_id,
                baseline = ?reconciled.state.baseline,
                "Device counter reset detected"
            );
        }

        let elapsed = elapsed_secs(current.last_at_time(), now, session_config.max_gap_secs);
        let attribution = attribute(elapsed, &reconciled.deltas);
        let walk_secs = current.active_walk_seconds + attribution.walk_secs;
        let stair_secs = current.active_stair_seconds + attribution.stair_secs;

        let counts = reconciled.state.live;
        let live = LiveView {
            steps: counts.steps,
            stairs: counts.stairs,
            falls: counts.falls,
            imu_moving: sample.imu_moving.unwrap_or(current.live.imu_moving),
            source: resolve_source(sample.source.as_deref(), &current.live.source),
            steps_pace: pace(counts.steps, walk_secs, session_config.pace_min_secs),
            stairs_pace: pace(counts.stairs, stair_secs, session_config.pace_min_secs),
        };

        self.db.write_sample_state(&LiveUpdate {
            patient_id: patient_id.to_string(),
            counters: reconciled.state,
            live: live.clone(),
            active_walk_seconds: walk_secs,
            active_stair_seconds: stair_secs,
            last_at: now_str.clone(),
            updated_at: now_str.clone(),
            last_type: sample_type.to_string(),
            last: merge_last(current.last.as_ref(), raw, sample.sample_type.as_str()),
        })?;

        let decision = decide_alert(sample.sample_type, reconciled.deltas.falls);
        let alerts = decision.as_ref().map(|d| d.alerts_increment).unwrap_or(0);
        let increments = Increments::from_sample(&reconciled.deltas, &attribution, alerts);
        if !increments.is_empty() {
            let day = match (current.active, current.date_key.as_ref()) {
                (true, Some(key)) => key.clone(),
                _ => date_key(now, self.tz),
            };
            self.db
                .increment_daily(patient_id, &day, &increments, &now_str)?;
            if current.active {
                if let Some(session_id) = current.session_id.as_deref() {
                    self.db
                        .increment_session(session_id, &increments, &now_str)?;
                }
            }
        }

        let mut fanout = None;
        let mut alert_id = None;
        if let Some(decision) = decision {
            let alert = build_alert(
                &decision,
                Ulid::new().to_string(),
                patient_id,
                current.session_id.clone(),
                raw,
                now,
            );
            self.db.insert_alert(&alert)?;
            if current.active {
                self.db.set_ok_pending(patient_id, true, &now_str)?;
            }
            tracing::warn!(
                patient_id = %patient_id,
                alert_id = %alert.alert_id,
                alert_type = %alert.alert_type,
                session_id = ?alert.session_id,
                "Alert raised"
            );
            fanout = spawn_alert_fanout(self.db.clone(), Arc::clone(&self.push), &alert);
            alert_id = Some(alert.alert_id);
        }

        tracing::debug!(
            patient_id = %patient_id,
            sample_type = %sample_type,
            steps_delta = reconciled.deltas.steps,
            stairs_delta = reconciled.deltas.stairs,
            falls_delta = reconciled.deltas.falls,
            elapsed_secs = elapsed,
            "Sample applied"
        );

        Ok(SampleOutcome {
            receipt: SampleReceipt {
                saved: true,
                duplicate: false,
                auto_stopped,
                alert_id,
                live,
            },
            fanout,
        })
    }

    /// Patient says they are fine: clears the pending flag, closes the newest
    /// open alert, and tells caregivers.
    pub fn im_ok(&self, patient_id: &str, now: DateTime<Utc>) -> Result<AckReply, EngineError> {
        let now_str = timestamp(now);
        self.db.set_ok_pending(patient_id, false, &now_str)?;

        let mut handled = None;
        if let Some(alert) = self.db.latest_unhandled_alert(patient_id)? {
            self.db
                .mark_alert_handled(patient_id, &alert.alert_id, HandledBy::Patient, &now_str)?;
            handled = Some(alert.alert_id);
        }

        let mut data = Map::new();
        data.insert("kind".to_string(), Value::String(KIND_PATIENT_OK.to_string()));
        match send_push_to_role(
            &self.db,
            self.push.as_ref(),
            patient_id,
            DeviceRole::Caregiver,
            PushNotification::new("PATIENT OK", "The patient confirmed they are fine."),
            &data,
        ) {
            Ok(report) => {
                tracing::debug!(patient_id = %patient_id, sent = report.sent, "Patient OK push sent");
            }
            Err(err) => {
                tracing::warn!(error = %err, patient_id = %patient_id, "Patient OK push failed");
            }
        }

        tracing::info!(
            patient_id = %patient_id,
            alert_id = ?handled,
            "Patient acknowledged"
        );
        Ok(AckReply {
            ok: true,
            alert_id: handled,
        })
    }

    pub fn caregiver_handle_alert(
        &self,
        patient_id: &str,
        alert_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AckReply, EngineError> {
        if self.db.get_alert(patient_id, alert_id)?.is_none() {
            return Err(EngineError::AlertNotFound {
                patient_id: patient_id.to_string(),
                alert_id: alert_id.to_string(),
            });
        }

        let now_str = timestamp(now);
        self.db
            .mark_alert_handled(patient_id, alert_id, HandledBy::Caregiver, &now_str)?;
        self.db.set_ok_pending(patient_id, false, &now_str)?;
        tracing::info!(
            patient_id = %patient_id,
            alert_id = %alert_id,
            "Caregiver handled alert"
        );
        Ok(AckReply {
            ok: true,
            alert_id: Some(alert_id.to_string()),
        })
    }

    /// Day totals, zeroed when nothing was recorded that day.
    pub fn daily_summary(
        &self,
        params: &HistoryParams,
        now: DateTime<Utc>,
    ) -> Result<DailyAggregate, EngineError> {
        let patient_id = params.patient_id();
        let day = params
            .date_key
            .clone()
            .unwrap_or_else(|| date_key(now, self.tz));
        Ok(self
            .db
            .get_daily(patient_id, &day)?
            .unwrap_or_else(|| DailyAggregate {
                patient_id: patient_id.to_string(),
                date_key: day,
                sessions_count: 0,
                total_steps: 0,
                stairs_count: 0,
                falls_count: 0,
                alerts_count: 0,
                active_walk_seconds: 0.0,
                active_stair_seconds: 0.0,
                last_updated_at: String::new(),
            }))
    }

    pub fn list_sessions(
        &self,
        params: &HistoryParams,
    ) -> Result<Vec<HistoricalSession>, EngineError> {
        Ok(self
            .db
            .list_sessions(params.patient_id(), params.limit())?)
    }

    pub fn list_alerts(&self, params: &HistoryParams) -> Result<Vec<AlertRecord>, EngineError> {
        Ok(self.db.list_alerts(params.patient_id(), params.limit())?)
    }
}

fn resolve_source(reported: Option<&str>, previous: &str) -> String {
    match reported {
        Some(source) if !source.trim().is_empty() => source.to_string(),
        _ if !previous.is_empty() => previous.to_string(),
        _ => UNKNOWN_SOURCE.to_string(),
    }
}

/// Newest sample layered over the previous one, so fields a device omits
/// keep their last reported value.
fn merge_last(previous: Option<&Value>, raw: &Value, sample_type: &str) -> Value {
    let mut merged = match previous {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(map) = raw {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.insert(
        "isFallActive".to_string(),
        Value::Bool(sample_type == crate::alerts::FALL_ALERT),
    );
    Value::Object(merged)
}
