//! Logging initialization for nocturne.
//!
//! The server logs through `tracing`. Nothing is printed until a subscriber
//! is installed, so binaries call one of the functions below once at startup.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nocturne::logging::init_logging;
//!
//! init_logging();
//! ```
//!
//! ## Configuration
//!
//! The filter is read from `RUST_LOG`:
//!
//! ```bash
//! # Per-connection state transitions and wake forwarding
//! RUST_LOG=nocturne=trace nocturne
//!
//! # Accepts, worker lifecycle and request summaries
//! RUST_LOG=debug nocturne
//!
//! # Only warnings and errors (production)
//! RUST_LOG=warn nocturne
//! ```

use std::str::FromStr;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "compact" | "text" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize compact logging at `info` unless `RUST_LOG` says otherwise.
///
/// Worker threads are named `nocturne-worker-N`, and the thread name is part
/// of every line so interleaved worker output stays readable.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize compact logging with an explicit default level.
///
/// `RUST_LOG` still wins when it is set.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize pretty-formatted logging (recommended for development).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_pretty() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(true),
        )
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}

/// Initialize logging in the given format.
pub fn init_logging_with_format(format: LogFormat) {
    match format {
        LogFormat::Compact => init_logging(),
        LogFormat::Pretty => init_logging_pretty(),
        LogFormat::Json => init_logging_json(),
    }
}

/// Install a test-writer subscriber, ignoring an already installed one.
///
/// Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(filter("debug"))
        .with(tracing_subscriber::fmt::layer().with_test_writer().with_thread_names(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!("".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
