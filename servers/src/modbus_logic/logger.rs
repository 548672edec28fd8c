use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::modbus_logic::config::LogSettings;

pub const LOG_FILE_NAME: &str = "server_modbus.log";

/// Installs the global tracing subscriber: console output (plain or JSON) and
/// a daily-rolling file in `settings.dir`. `RUST_LOG` overrides the
/// configured level. Keep the returned guard alive or buffered file output
/// is lost.
pub fn setup_logging(settings: &LogSettings) -> Result<WorkerGuard> {
    if !settings.dir.exists() {
        fs::create_dir_all(&settings.dir)
            .with_context(|| format!("failed to create log directory {}", settings.dir.display()))?;
    }

    let removed = cleanup_old_logs(&settings.dir, settings.retention)
        .with_context(|| format!("failed to clean log directory {}", settings.dir.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .with_context(|| format!("invalid log level '{}'", settings.level))?;

    let file_appender = tracing_appender::rolling::daily(&settings.dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);

    let (json_console, plain_console) = if settings.json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(plain_console)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    if removed > 0 {
        info!(removed, dir = %settings.dir.display(), "deleted old log files");
    }
    Ok(guard)
}

/// Deletes all but the `keep` most recently modified gateway log files in
/// `log_dir`. Other files are left alone. Returns how many were deleted.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> io::Result<usize> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_NAME))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
