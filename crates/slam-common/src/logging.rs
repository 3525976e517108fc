//! ---
//! slam_section: "01-core-functionality"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Tracing subscriber setup for the node daemon."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

const LOG_ENV: &str = "SLAM_NODE_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Stdout format of the daemon. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::StructuredJson => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "structured-json" => Ok(LogFormat::StructuredJson),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Where and how the daemon writes its logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub format: LogFormat,
    /// Distinguishes the log files of nodes sharing one directory.
    pub file_prefix: Option<String>,
}

impl LoggingConfig {
    pub fn new(directory: impl Into<PathBuf>, format: LogFormat) -> Self {
        Self {
            directory: directory.into(),
            format,
            file_prefix: None,
        }
    }

    /// Name the log file after the configuration the node was started with,
    /// so `backpack_2d.toml` logs to `<service>-backpack_2d.log`.
    pub fn with_configuration(mut self, configuration_basename: &str) -> Self {
        self.file_prefix = Path::new(configuration_basename.trim())
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .map(str::to_owned);
        self
    }

    /// File name handed to the daily appender, before its date suffix.
    pub fn file_name(&self, service_name: &str) -> String {
        match &self.file_prefix {
            Some(prefix) => format!("{}-{}.log", service_name, prefix),
            None => format!("{}.log", service_name),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new("target/logs", LogFormat::default())
    }
}

// `SLAM_NODE_LOG` wins over `RUST_LOG`. A malformed node directive falls back
// to the default rather than to `RUST_LOG`.
fn resolve_filter(node_directive: Option<String>, rust_log: Option<String>) -> EnvFilter {
    if let Some(directive) = node_directive {
        return EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to {} logging",
                LOG_ENV, err, DEFAULT_DIRECTIVE
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        });
    }
    rust_log
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber: stdout in `config.format` plus a daily
/// rolling JSON file under `config.directory`.
///
/// The filter comes from `SLAM_NODE_LOG`, then `RUST_LOG`, then `info`.
/// Calling this twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("failed to create log directory {}", config.directory.display())
    })?;
    let file_name = config.file_name(service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let filter = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => tracing_fmt::layer()
            .with_target(false)
            .with_timer(tracing_fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => tracing_fmt::layer()
            .with_target(true)
            .with_timer(tracing_fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = tracing_fmt::layer()
        .with_target(true)
        .with_timer(tracing_fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        log_file = %file_name,
        format = %config.format,
        "tracing initialised"
    );
    Ok(())
}
