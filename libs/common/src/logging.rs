//! Unified logging for bridge services
//!
//! Console output plus an optional daily log file, both written as
//! `timestamp [LEVEL] message`. Files are named `{YYYYMMDD}_{service}.log`
//! and a new one is opened when the local date changes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Errors raised while installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Log directory error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[35m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Event formatter that outputs: `2025-12-02T00:50:44.809112Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(writer, "{}{}\x1b[0m ", level_color(level), format_level(level))?;
        } else {
            write!(writer, "{} ", format_level(level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// Keeps the non-blocking file worker alive for the lifetime of the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Resolve the log directory.
///
/// Priority: `env_key` environment variable, then the configured directory,
/// then `logs`.
pub fn resolve_log_dir(env_key: &str, configured: Option<&str>) -> PathBuf {
    std::env::var(env_key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(configured.unwrap_or("logs")))
}

/// File name for a service log on a given date
pub fn log_file_name(service_name: &str, date: chrono::NaiveDate) -> String {
    format!("{}_{}.log", date.format("%Y%m%d"), service_name)
}

struct OpenLog {
    date: chrono::NaiveDate,
    file: File,
}

/// Append-only writer that switches files at local midnight
#[derive(Clone)]
struct DailyFileWriter {
    service_name: String,
    log_dir: PathBuf,
    current: Arc<Mutex<OpenLog>>,
}

impl DailyFileWriter {
    fn new(service_name: &str, log_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let date = chrono::Local::now().date_naive();
        let file = open_append(&log_dir.join(log_file_name(service_name, date)))?;
        Ok(Self {
            service_name: service_name.to_string(),
            log_dir: log_dir.to_path_buf(),
            current: Arc::new(Mutex::new(OpenLog { date, file })),
        })
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for DailyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut current = self.current.lock();
        let today = chrono::Local::now().date_naive();
        if today != current.date {
            let path = self.log_dir.join(log_file_name(&self.service_name, today));
            current.file = open_append(&path)?;
            current.date = today;
        }
        current.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.lock().file.flush()
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file suffix and the debug filter target
    pub service_name: String,
    /// Directory for the daily log file; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Level used when neither `filter` nor `RUST_LOG` is set
    pub level: Level,
    /// Adds `{service}=debug` to the default filter
    pub debug: bool,
    /// Explicit filter directive (e.g. from `--log-level`), wins over everything
    pub filter: Option<String>,
    /// Colored console output
    pub ansi: bool,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: None,
            level: Level::INFO,
            debug: false,
            filter: None,
            ansi: true,
            enable_json: false,
        }
    }
}

impl LogConfig {
    /// Effective filter directive.
    ///
    /// Explicit filter > `RUST_LOG` > debug default > plain level.
    pub fn filter_directive(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        if let Ok(env) = std::env::var("RUST_LOG") {
            if !env.trim().is_empty() {
                return env;
            }
        }
        let level = self.level.as_str().to_ascii_lowercase();
        if self.debug {
            format!("{},{}=debug", level, self.service_name)
        } else {
            level
        }
    }
}

/// Install the global subscriber.
///
/// Can only succeed once per process.
pub fn init_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let directive = config.filter_directive();
    let env_filter = EnvFilter::try_new(&directive).map_err(|e| LoggingError::Filter {
        directive: directive.clone(),
        reason: e.to_string(),
    })?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            let writer = DailyFileWriter::new(&config.service_name, dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            // A second init fails below, so a lost guard here is never the live one
            let _ = FILE_GUARD.set(guard);
            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_log_file_name() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(log_file_name("dnp3srv", date), "20250307_dnp3srv.log");
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = LogConfig {
            service_name: "dnp3srv".to_string(),
            debug: true,
            filter: Some("warn".to_string()),
            ..LogConfig::default()
        };
        assert_eq!(config.filter_directive(), "warn");
    }

    #[test]
    fn test_resolve_log_dir_falls_back_to_configured() {
        let dir = resolve_log_dir("COMMON_TEST_UNSET_LOG_DIR", Some("/var/log/bridge"));
        assert_eq!(dir, PathBuf::from("/var/log/bridge"));
        let dir = resolve_log_dir("COMMON_TEST_UNSET_LOG_DIR", None);
        assert_eq!(dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_daily_writer_creates_dated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = DailyFileWriter::new("unit", tmp.path()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        let today = chrono::Local::now().date_naive();
        let path = tmp.path().join(log_file_name("unit", today));
        assert_eq!(fs::read_to_string(path).unwrap(), "hello\n");
    }
}
