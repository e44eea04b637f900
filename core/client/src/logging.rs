//! File logging for the CLI. Stdout is reserved for command output, so
//! tracing goes to a daily-rolled file under `~/.carewalk/logs`.

use fs_err as fs;
use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_DIR_ENV: &str = "CAREWALK_LOG_DIR";
const LOG_FILE_PREFIX: &str = "carewalk.log";

/// Returns the writer guard; logs are flushed when it drops. `None` means
/// logging is disabled for this run.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("carewalk: logging disabled: {}", err);
        return None;
    }

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var("CAREWALK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    if installed.is_err() {
        return None;
    }
    Some(guard)
}

fn log_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var(LOG_DIR_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::home_dir().map(|home| home.join(".carewalk").join("logs"))
}
