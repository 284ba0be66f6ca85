//! Tracing initialization.
//!
//! Structured logging via `tracing` + `tracing-subscriber`. The filter
//! honors `RUST_LOG` when set, otherwise the level passed in (normally from
//! the command line or the batch settings file).

use tracing_subscriber::EnvFilter;

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-oriented, with ANSI colors.
    Pretty,
    /// Single-line, no colors; suited to log files.
    Compact,
    /// One JSON object per event, for log aggregation.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (pretty|compact|json)")),
        }
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(level: &str, format: LogFormat) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| format!("invalid log filter '{level}': {e}"))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().with_ansi(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| format!("failed to install tracing subscriber: {e}"))
}
