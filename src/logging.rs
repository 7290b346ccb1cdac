//! Logging for the parent and every role process.
//!
//! Severities follow syslog numbering, 0 (emerg) through 7 (debug). The
//! current severity is process-wide and can be changed at runtime through the
//! `loglevel=N` control command, which reloads the subscriber's level filter.
//!
//! Formatted events destined for the log file are handed to a
//! [`MessageQueue`] so the thread that logs never waits on disk I/O. Events at
//! WARN and above are mirrored to stderr.
//!
//! # Environment Variables
//!
//! - `CKPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `CKPOOL_LOG_FILE` - Path to the log file
//!
//! # Example
//!
//! ```no_run
//! use ckpool::logging::{LogConfig, init};
//!
//! let config = LogConfig::default()
//!     .with_file("logs/ckpool.log".into())
//!     .with_env_overrides();
//! init(&config).unwrap();
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, reload};

use crate::error::{PoolError, Result};
use crate::msgq::MessageQueue;

pub const LOG_EMERG: u8 = 0;
pub const LOG_ALERT: u8 = 1;
pub const LOG_CRIT: u8 = 2;
pub const LOG_ERR: u8 = 3;
pub const LOG_WARNING: u8 = 4;
pub const LOG_NOTICE: u8 = 5;
pub const LOG_INFO: u8 = 6;
pub const LOG_DEBUG: u8 = 7;

/// Severity used until told otherwise.
pub const DEFAULT_SEVERITY: u8 = LOG_NOTICE;

static SEVERITY: AtomicU8 = AtomicU8::new(DEFAULT_SEVERITY);
static STATE: OnceLock<LogState> = OnceLock::new();

/// Why a requested severity was not applied.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeverityError {
    #[error("'{0}' is not a number")]
    Unparsable(String),

    #[error("severity {0} is outside 0..=7")]
    OutOfRange(i64),
}

/// Parse and range-check a severity as given to `loglevel=N`.
pub fn parse_severity(s: &str) -> std::result::Result<u8, SeverityError> {
    let n: i64 = s
        .trim()
        .parse()
        .map_err(|_| SeverityError::Unparsable(s.to_string()))?;
    if !(i64::from(LOG_EMERG)..=i64::from(LOG_DEBUG)).contains(&n) {
        return Err(SeverityError::OutOfRange(n));
    }
    Ok(n as u8)
}

/// Map a syslog severity onto the closest tracing level.
pub fn level_filter(severity: u8) -> LevelFilter {
    match severity {
        0..=3 => LevelFilter::ERROR,
        4 => LevelFilter::WARN,
        5 => LevelFilter::INFO,
        6 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// The process-wide severity.
pub fn current_severity() -> u8 {
    SEVERITY.load(Ordering::SeqCst)
}

/// Whether a message at `severity` would currently be emitted.
pub fn enabled(severity: u8) -> bool {
    severity <= current_severity()
}

/// Change the process-wide severity and reload the subscriber filter.
pub fn set_severity(severity: u8) -> std::result::Result<(), SeverityError> {
    if severity > LOG_DEBUG {
        return Err(SeverityError::OutOfRange(i64::from(severity)));
    }
    SEVERITY.store(severity, Ordering::SeqCst);
    if let Some(state) = STATE.get()
        && let Err(e) = state.reload.reload(level_filter(severity))
    {
        eprintln!("Failed to reload log level: {e}");
    }
    Ok(())
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Full single-line format with timestamps (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    /// Single file (default)
    #[default]
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Syslog severity (default: 5, notice)
    pub severity: u8,
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    pub show_target: bool,
    pub show_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            severity: DEFAULT_SEVERITY,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Never,
            show_target: false,
            show_thread_ids: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity.min(LOG_DEBUG);
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// `CKPOOL_LOG_FORMAT` replaces the format when it parses;
    /// `CKPOOL_LOG_FILE` replaces the file path.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(format) = std::env::var("CKPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("CKPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }
}

/// Runtime handles kept alive for the lifetime of the subscriber.
pub struct LogState {
    reload: reload::Handle<LevelFilter, Registry>,
    queue: Option<Arc<MessageQueue<Vec<u8>>>>,
}

impl LogState {
    /// Wait until queued log lines have been written to the file.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(queue) = &self.queue else {
            return true;
        };
        let start = Instant::now();
        while !queue.idle() {
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

/// Makes one [`QueueWriter`] per event.
#[derive(Clone)]
struct QueueMakeWriter {
    queue: Arc<MessageQueue<Vec<u8>>>,
}

/// Collects one formatted event and enqueues it when dropped.
struct QueueWriter {
    queue: Arc<MessageQueue<Vec<u8>>>,
    buf: Vec<u8>,
}

impl Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for QueueWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.queue.enqueue(std::mem::take(&mut self.buf));
        }
    }
}

impl<'a> MakeWriter<'a> for QueueMakeWriter {
    type Writer = QueueWriter;

    fn make_writer(&'a self) -> Self::Writer {
        QueueWriter {
            queue: Arc::clone(&self.queue),
            buf: Vec::new(),
        }
    }
}

type Base = Layered<reload::Layer<LevelFilter, Registry>, Registry>;

fn format_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(config.show_target)
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}

fn open_log_queue(config: &LogConfig) -> Result<Option<Arc<MessageQueue<Vec<u8>>>>> {
    let Some(path) = config.file_path.as_ref() else {
        return Ok(None);
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(std::path::Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("ckpool.log");
    let (prefix, suffix) = file_name.rsplit_once('.').unwrap_or((file_name, ""));

    let mut builder = RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(prefix);
    if !suffix.is_empty() {
        builder = builder.filename_suffix(suffix);
    }
    let mut appender = builder
        .build(dir)
        .map_err(|e| PoolError::Config(format!("cannot open log file {}: {e}", path.display())))?;

    let queue = MessageQueue::create("logger", move |line: Vec<u8>| {
        if let Err(e) = appender.write_all(&line) {
            eprintln!("Failed to write to log file: {e}");
        }
    })?;
    Ok(Some(Arc::new(queue)))
}

/// Build the subscriber for `config` without installing it.
pub fn build(config: &LogConfig) -> Result<(impl Subscriber + Send + Sync + 'static, LogState)> {
    let (filter, reload) = reload::Layer::new(level_filter(config.severity));
    let queue = open_log_queue(config)?;

    let mut layers: Vec<Box<dyn Layer<Base> + Send + Sync>> = Vec::new();
    layers.push(Box::new(
        format_layer::<Base, _>(config, std::io::stderr, true).with_filter(LevelFilter::WARN),
    ));
    if let Some(queue) = &queue {
        let writer = QueueMakeWriter {
            queue: Arc::clone(queue),
        };
        layers.push(format_layer::<Base, _>(config, writer, false));
    }

    let subscriber = tracing_subscriber::registry().with(filter).with(layers);
    Ok((subscriber, LogState { reload, queue }))
}

/// Install the global subscriber and set the process-wide severity.
///
/// A second call leaves the first subscriber in place.
pub fn init(config: &LogConfig) -> Result<()> {
    let (subscriber, state) = build(config)?;
    SEVERITY.store(config.severity, Ordering::SeqCst);
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        let _ = STATE.set(state);
    }
    Ok(())
}

/// Give queued log lines up to `timeout` to reach the file.
pub fn flush(timeout: Duration) {
    if let Some(state) = STATE.get() {
        state.flush(timeout);
    }
}
