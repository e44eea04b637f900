//! carewalk: command-line client for the carewalk daemon.
//!
//! Stands in for the wearable relay and the patient/caregiver apps: every
//! subcommand maps to one daemon method and prints the daemon's reply as JSON.
//!
//! ## Subcommands
//!
//! - `sample`: push one telemetry sample (counters are cumulative device totals)
//! - `start` / `stop`: open or close the patient's walking session
//! - `ok`: patient self-acknowledges the latest alert
//! - `handle-alert`: caregiver acknowledges a specific alert
//! - `state`, `daily`, `sessions`, `alerts`: read-side views

mod daemon_client;
mod logging;

use carewalk_daemon_protocol::{
    DeviceRole, HandleAlertParams, HistoryParams, Method, PatientParams, RegisterTokenParams,
    SampleEnvelope, SampleType,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "carewalk")]
#[command(about = "Carewalk rehabilitation telemetry client")]
#[command(version)]
struct Cli {
    /// Patient the command applies to (the daemon defaults to p1)
    #[arg(long, global = true)]
    patient: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,

    /// Show the patient's live session snapshot
    State,

    /// Start a walking session
    Start,

    /// Stop the active walking session
    Stop,

    /// Send one device sample
    Sample {
        #[arg(long = "type", value_enum, default_value_t = SampleKind::Telemetry)]
        kind: SampleKind,

        /// Cumulative step counter as reported by the device
        #[arg(long)]
        steps: Option<u64>,

        /// Cumulative stair counter
        #[arg(long)]
        stairs: Option<u64>,

        /// Cumulative fall counter
        #[arg(long)]
        falls: Option<u64>,

        #[arg(long)]
        imu_moving: Option<bool>,

        #[arg(long)]
        source: Option<String>,

        /// Deduplication id; generated when omitted
        #[arg(long)]
        sample_id: Option<String>,
    },

    /// Patient confirms they are fine
    Ok,

    /// Caregiver marks an alert as handled
    HandleAlert {
        #[arg(long)]
        alert_id: String,
    },

    /// Register a device for push notifications
    RegisterToken {
        #[arg(long)]
        token: String,

        #[arg(long, value_enum)]
        role: Role,

        #[arg(long)]
        platform: Option<String>,
    },

    /// Show a daily summary (today in the daemon's timezone by default)
    Daily {
        /// Day as YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },

    /// List recent sessions, newest first
    Sessions {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List recent alerts, newest first
    Alerts {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SampleKind {
    Telemetry,
    FallAlert,
    LongImmobility,
}

impl From<SampleKind> for SampleType {
    fn from(kind: SampleKind) -> Self {
        match kind {
            SampleKind::Telemetry => SampleType::Telemetry,
            SampleKind::FallAlert => SampleType::FallAlert,
            SampleKind::LongImmobility => SampleType::LongImmobility,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Patient,
    Caregiver,
}

impl From<Role> for DeviceRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Patient => DeviceRole::Patient,
            Role::Caregiver => DeviceRole::Caregiver,
        }
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let (method, params) = match build_request(cli.patient, cli.command) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("carewalk: {}", err);
            std::process::exit(2);
        }
    };

    match daemon_client::call(method, params) {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("carewalk: failed to render response: {}", err);
                std::process::exit(1);
            }
        },
        Err(err) => {
            tracing::error!(error = %err, method = ?method, "carewalk command failed");
            eprintln!("carewalk: {}", err);
            std::process::exit(1);
        }
    }
}

fn build_request(
    patient: Option<String>,
    command: Commands,
) -> Result<(Method, Option<Value>), String> {
    let patient_params = |patient_id: Option<String>| to_params(&PatientParams { patient_id });

    Ok(match command {
        Commands::Health => (Method::GetHealth, None),
        Commands::State => (Method::SessionState, patient_params(patient)?),
        Commands::Start => (Method::StartSession, patient_params(patient)?),
        Commands::Stop => (Method::StopSession, patient_params(patient)?),
        Commands::Ok => (Method::ImOk, patient_params(patient)?),
        Commands::Sample {
            kind,
            steps,
            stairs,
            falls,
            imu_moving,
            source,
            sample_id,
        } => {
            let sample = SampleEnvelope {
                patient_id: patient,
                sample_id: Some(sample_id.unwrap_or_else(daemon_client::make_sample_id)),
                sample_type: kind.into(),
                steps: steps.map(|n| n as f64),
                stairs_count: stairs.map(|n| n as f64),
                falls_count: falls.map(|n| n as f64),
                imu_moving,
                source,
            };
            (Method::ReceiveData, to_params(&sample)?)
        }
        Commands::HandleAlert { alert_id } => {
            // Caregiver acknowledgments always name the patient explicitly.
            let params = HandleAlertParams {
                patient_id: Some(patient.unwrap_or_else(|| {
                    carewalk_daemon_protocol::DEFAULT_PATIENT_ID.to_string()
                })),
                alert_id: Some(alert_id),
            };
            (Method::CaregiverHandleAlert, to_params(&params)?)
        }
        Commands::RegisterToken {
            token,
            role,
            platform,
        } => {
            let params = RegisterTokenParams {
                patient_id: patient,
                token,
                role: role.into(),
                platform,
            };
            (Method::RegisterToken, to_params(&params)?)
        }
        Commands::Daily { date } => (
            Method::GetDailySummary,
            to_params(&HistoryParams {
                patient_id: patient,
                date_key: date,
                limit: None,
            })?,
        ),
        Commands::Sessions { limit } => (
            Method::ListSessions,
            to_params(&HistoryParams {
                patient_id: patient,
                date_key: None,
                limit,
            })?,
        ),
        Commands::Alerts { limit } => (
            Method::ListAlerts,
            to_params(&HistoryParams {
                patient_id: patient,
                date_key: None,
                limit,
            })?,
        ),
    })
}

/// Serializes params, dropping unset fields so the daemon applies its own
/// defaults.
fn to_params<T: Serialize>(params: &T) -> Result<Option<Value>, String> {
    let mut value = serde_json::to_value(params)
        .map_err(|err| format!("Failed to serialize params: {}", err))?;
    if let Value::Object(map) = &mut value {
        map.retain(|_, field| !field.is_null());
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Method, Option<Value>) {
        let cli = Cli::try_parse_from(args).expect("args parse");
        build_request(cli.patient, cli.command).expect("request builds")
    }

    #[test]
    fn sample_command_builds_wire_payload() {
        let (method, params) = parse(&[
            "carewalk",
            "--patient",
            "p7",
            "sample",
            "--steps",
            "120",
            "--falls",
            "1",
            "--type",
            "fall-alert",
        ]);
        let params = params.expect("params");

        assert_eq!(method, Method::ReceiveData);
        assert_eq!(params["patientId"], "p7");
        assert_eq!(params["type"], "fall_alert");
        assert_eq!(params["steps"], 120.0);
        assert_eq!(params["fallsCount"], 1.0);
        assert!(params.get("stairsCount").is_none());
        assert!(params["sampleId"]
            .as_str()
            .is_some_and(|id| id.starts_with("smp-")));
    }

    #[test]
    fn explicit_sample_id_is_kept() {
        let (_, params) = parse(&["carewalk", "sample", "--sample-id", "dev-42"]);
        assert_eq!(params.expect("params")["sampleId"], "dev-42");
    }

    #[test]
    fn patient_scoped_commands_omit_unset_patient() {
        let (method, params) = parse(&["carewalk", "start"]);
        assert_eq!(method, Method::StartSession);
        assert_eq!(params, Some(serde_json::json!({})));
    }

    #[test]
    fn handle_alert_names_patient_explicitly() {
        let (method, params) = parse(&["carewalk", "handle-alert", "--alert-id", "A1"]);
        assert_eq!(method, Method::CaregiverHandleAlert);
        let params = params.expect("params");
        assert_eq!(params["patientId"], "p1");
        assert_eq!(params["alertId"], "A1");
    }

    #[test]
    fn history_commands_map_flags() {
        let (method, params) = parse(&["carewalk", "daily", "--date", "2026-03-02"]);
        assert_eq!(method, Method::GetDailySummary);
        assert_eq!(params.expect("params")["dateKey"], "2026-03-02");

        let (method, params) = parse(&["carewalk", "alerts", "--limit", "5"]);
        assert_eq!(method, Method::ListAlerts);
        assert_eq!(params.expect("params")["limit"], 5);
    }

    #[test]
    fn register_token_requires_role() {
        assert!(Cli::try_parse_from(["carewalk", "register-token", "--token", "abc"]).is_err());
        let (_, params) = parse(&[
            "carewalk",
            "register-token",
            "--token",
            "abc",
            "--role",
            "caregiver",
        ]);
        assert_eq!(params.expect("params")["role"], "caregiver");
    }
}
