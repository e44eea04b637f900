//! Runtime configuration for carewalk-daemon.
//!
//! Loaded once at startup from `~/.carewalk/daemon/config.toml` (or the path in
//! `CAREWALK_CONFIG`). Every section is optional and falls back to defaults.

use chrono::Duration;
use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".carewalk/daemon/config.toml";
const CONFIG_ENV: &str = "CAREWALK_CONFIG";
const DEFAULT_AUTO_STOP_MINUTES: i64 = 60;
const DEFAULT_SAMPLE_RETENTION_HOURS: i64 = 72;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub calendar: CalendarConfig,
    pub push: PushConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions still active this long after `startedAt` are closed by the
    /// next inbound sample.
    pub auto_stop_minutes: i64,
    /// Gaps between samples above this many seconds attribute no time.
    pub max_gap_secs: f64,
    /// Pace stays at zero until a bucket holds more than this many seconds.
    pub pace_min_secs: f64,
    /// Sample ids are remembered for deduplication this long.
    pub sample_retention_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_stop_minutes: DEFAULT_AUTO_STOP_MINUTES,
            max_gap_secs: 60.0,
            pace_min_secs: 5.0,
            sample_retention_hours: DEFAULT_SAMPLE_RETENTION_HOURS,
        }
    }
}

impl SessionConfig {
    /// Non-positive or out-of-range values fall back to the default.
    pub fn auto_stop_after(&self) -> Duration {
        positive(Duration::try_minutes(self.auto_stop_minutes))
            .unwrap_or_else(|| Duration::minutes(DEFAULT_AUTO_STOP_MINUTES))
    }

    pub fn sample_retention(&self) -> Duration {
        positive(Duration::try_hours(self.sample_retention_hours))
            .unwrap_or_else(|| Duration::hours(DEFAULT_SAMPLE_RETENTION_HOURS))
    }
}

fn positive(duration: Option<Duration>) -> Option<Duration> {
    duration.filter(|d| *d > Duration::zero())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub timezone: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Jerusalem".to_string(),
        }
    }
}

impl CalendarConfig {
    pub fn reference_timezone(&self) -> Result<Tz, String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|err| format!("Unknown calendar timezone {}: {}", self.timezone, err))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PushConfig {
    pub outbox_path: Option<PathBuf>,
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_runtime_config(path: Option<PathBuf>) -> Result<RuntimeConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(RuntimeConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<RuntimeConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        )
    })?;
    config.calendar.reference_timezone()?;
    Ok(config)
}
