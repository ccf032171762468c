//! Process-wide `tracing` setup.
//!
//! Library code only emits events; binaries and tests opt in by calling
//! [`init_observability`].

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "assist-stream.logs.jsonl";

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogSink {
    /// Compact human-readable lines on stderr.
    Console,
    /// JSON lines appended to a file.
    JsonFile(PathBuf),
}

/// Resolved logging settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub enabled: bool,
    /// Filter directive; `None` falls back to `RUST_LOG`, then `info`.
    pub level: Option<String>,
    pub sink: LogSink,
}

impl ObservabilitySettings {
    /// Reads `ASSIST_OBSERVABILITY_ENABLED`, `ASSIST_LOG_LEVEL` and
    /// `ASSIST_JSON_LOG_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("ASSIST_OBSERVABILITY_ENABLED")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(true);
        let level = lookup("ASSIST_LOG_LEVEL").filter(|v| !v.trim().is_empty());
        let sink = match lookup("ASSIST_JSON_LOG_PATH").filter(|v| !v.trim().is_empty()) {
            Some(path) => LogSink::JsonFile(PathBuf::from(path)),
            None => LogSink::Console,
        };
        Self {
            enabled,
            level,
            sink,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(level) = self.level.as_deref()
            && let Ok(filter) = EnvFilter::try_new(level)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Installs the global subscriber once per process using
/// [`ObservabilitySettings::from_env`]. Later calls are no-ops, and an
/// already-installed foreign subscriber is left in place.
pub fn init_observability() {
    INIT.get_or_init(|| install(ObservabilitySettings::from_env()));
}

fn install(settings: ObservabilitySettings) {
    if !settings.enabled {
        return;
    }
    let filter = settings.env_filter();
    match &settings.sink {
        LogSink::JsonFile(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_LOG_FILE);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init();
        }
        LogSink::Console => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init();
        }
    }
}
