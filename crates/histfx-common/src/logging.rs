//! Logging setup shared by the histfx binary and its stage workers
//!
//! The orchestrator logs to stdout (optionally also to a daily rolling file).
//! A stage worker must keep its stdout free for the JSON-lines message pipe,
//! so [`LogConfig::worker`] sends everything to stderr, which the parent
//! inherits.
//!
//! Every setting can be overridden through `LOG_*` environment variables, see
//! [`LogConfig::merge_env`].
//!
//! Prefer structured fields over interpolated strings:
//!
//! ```rust,ignore
//! info!(stage = %kind, workers, units, "Starting thread pool");
//! warn!(url = %record.url, error = %err, "Dropping unit");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use histfx_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::cli(LogLevel::Info).merge_env()?)?;
//!     tracing::info!("histfx started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Look `input` up in a keyword table, case-insensitively.
///
/// The first keyword listed for a value is its display name.
fn keyword<T: Copy>(table: &[(&str, T)], what: &str, input: &str) -> Result<T> {
    let wanted = input.trim().to_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow::anyhow!("Invalid log {}: {}", what, input))
}

fn display_name<T: Copy + PartialEq>(table: &[(&'static str, T)], value: T) -> &'static str {
    table
        .iter()
        .find(|(_, v)| *v == value)
        .map(|(name, _)| *name)
        .unwrap_or("?")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

const LEVELS: &[(&str, LogLevel)] = &[
    ("trace", LogLevel::Trace),
    ("debug", LogLevel::Debug),
    ("info", LogLevel::Info),
    ("warn", LogLevel::Warn),
    ("warning", LogLevel::Warn),
    ("error", LogLevel::Error),
];

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        keyword(LEVELS, "level", s)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(display_name(LEVELS, *self))
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    /// For processes whose stdout is a data channel
    Stderr,
    /// Daily rolling file only
    File,
    /// Console and the rolling file
    Both,
}

const OUTPUTS: &[(&str, LogOutput)] = &[
    ("console", LogOutput::Console),
    ("stdout", LogOutput::Console),
    ("stderr", LogOutput::Stderr),
    ("file", LogOutput::File),
    ("both", LogOutput::Both),
    ("all", LogOutput::Both),
];

impl LogOutput {
    fn writes_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        keyword(OUTPUTS, "output", s)
    }
}

impl fmt::Display for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(display_name(OUTPUTS, *self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

const FORMATS: &[(&str, LogFormat)] = &[
    ("text", LogFormat::Text),
    ("pretty", LogFormat::Text),
    ("json", LogFormat::Json),
];

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        keyword(FORMATS, "format", s)
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(display_name(FORMATS, *self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory of the rolling file
    pub log_dir: PathBuf,
    /// Rolling file name prefix, e.g. `histfx` gives `histfx.2024-05-28`
    pub log_file_prefix: String,
    /// Comma-separated directives on top of the level, e.g. `reqwest=warn,histfx_ingest::pool=debug`
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "histfx".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr<Err = anyhow::Error>,
{
    env_value(key)
        .map(|v| v.parse().with_context(|| format!("Invalid {}", key)))
        .transpose()
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    env_value(key)
        .map(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("Invalid {}: expected true or false, got {}", key, v)),
        })
        .transpose()
}

impl LogConfig {
    /// Orchestrator defaults: console output at `level`.
    pub fn cli(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Stage worker defaults: stderr output, own file prefix.
    pub fn worker(level: LogLevel) -> Self {
        Self {
            level,
            output: LogOutput::Stderr,
            log_file_prefix: "histfx-worker".to_string(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply environment overrides.
    ///
    /// | Variable | Values |
    /// |---|---|
    /// | `LOG_LEVEL` | trace, debug, info, warn, error |
    /// | `LOG_OUTPUT` | console, stderr, file, both |
    /// | `LOG_FORMAT` | text, json |
    /// | `LOG_DIR`, `LOG_FILE_PREFIX` | rolling file location |
    /// | `LOG_FILTER` | extra filter directives |
    /// | `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS`, `LOG_INCLUDE_TARGETS` | true / false |
    ///
    /// Empty variables are ignored; unparsable ones are an error.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_parse("LOG_LEVEL")? {
            self.level = level;
        }
        if let Some(output) = env_parse("LOG_OUTPUT")? {
            self.output = output;
        }
        if let Some(format) = env_parse("LOG_FORMAT")? {
            self.format = format;
        }
        if let Some(dir) = env_value("LOG_DIR") {
            self.log_dir = dir.into();
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_value("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Some(on) = env_flag("LOG_INCLUDE_LOCATION")? {
            self.include_location = on;
        }
        if let Some(on) = env_flag("LOG_INCLUDE_THREAD_IDS")? {
            self.include_thread_ids = on;
        }
        if let Some(on) = env_flag("LOG_INCLUDE_TARGETS")? {
            self.include_targets = on;
        }
        Ok(self)
    }

    /// Keep the stdout message pipe of a stage worker clean.
    ///
    /// Console output becomes stderr; file output is left alone.
    pub fn off_stdout(mut self) -> Self {
        self.output = match self.output {
            LogOutput::Console => LogOutput::Stderr,
            LogOutput::Both => LogOutput::File,
            other => other,
        };
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());
        let directives = self.filter_directives.as_deref().unwrap_or_default();
        for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let parsed = directive
                .parse()
                .with_context(|| format!("Invalid filter directive '{}'", directive))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let terminal = match config.output {
        LogOutput::Console | LogOutput::Both => Some(fmt_layer(config, std::io::stdout, true)),
        LogOutput::Stderr => Some(fmt_layer(config, std::io::stderr, false)),
        LogOutput::File => None,
    };

    let file = if config.output.writes_file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The subscriber is process-wide, so its flush guard must be too.
        std::mem::forget(guard);
        Some(fmt_layer(config, writer, false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(config.env_filter()?)
        .with(terminal)
        .with(file)
        .try_init()
        .context("A global logger is already installed")?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_parse_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!("all".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn test_display_uses_canonical_name() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogOutput::Console.to_string(), "console");
        assert_eq!(LogOutput::Stderr.to_string(), "stderr");
        for format in [LogFormat::Text, LogFormat::Json] {
            assert_eq!(format.to_string().parse::<LogFormat>().unwrap(), format);
        }
    }

    #[test]
    fn test_worker_config_avoids_stdout() {
        let worker = LogConfig::worker(LogLevel::Debug);
        assert_eq!(worker.output, LogOutput::Stderr);
        assert_eq!(worker.level, LogLevel::Debug);
        assert_eq!(worker.log_file_prefix, "histfx-worker");

        let both = LogConfig {
            output: LogOutput::Both,
            ..LogConfig::default()
        };
        assert_eq!(both.off_stdout().output, LogOutput::File);
        assert_eq!(LogConfig::cli(LogLevel::Info).off_stdout().output, LogOutput::Stderr);
    }

    #[test]
    fn test_bad_filter_directive_is_reported() {
        let config = LogConfig {
            filter_directives: Some("reqwest=warn, =[".to_string()),
            ..LogConfig::default()
        };
        let err = config.env_filter().unwrap_err();
        assert!(err.to_string().contains("=["));
    }
}
