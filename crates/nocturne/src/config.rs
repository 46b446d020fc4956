use crate::error::{NocturneError, NocturneResult};
use std::path::PathBuf;

/// Capacity of one pooled memory block.
pub const CLIENT_BUFFER_SIZE: usize = 8 * 1024;

/// Longest request line the worker scans before answering 413.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Longest single header line the worker scans before answering 413.
pub const MAX_HEADER_LINE: usize = 64 * 1024;

/// Events fetched by one `epoll_wait` call.
pub const MAX_EVENTS: usize = 16;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_SERVER_NAME: &str = "nocturne";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address: `unix:<path>`, `/abs/path`, or `host[:port]`.
    pub listen: String,

    /// Number of worker threads (default: half the cores, at least 2).
    pub workers: usize,

    /// Value of the `Server` response header.
    pub server_name: String,

    /// Capacity of pooled buffer blocks in bytes (default: 8 KiB).
    pub buffer_size: usize,

    /// Request line scan limit in bytes (default: 64 KiB).
    pub max_request_line: usize,

    /// Header line scan limit in bytes (default: 64 KiB).
    pub max_header_line: usize,

    /// Pin each worker thread to a CPU core.
    pub pin_workers: bool,

    /// Events fetched per `epoll_wait` call.
    pub max_events: usize,

    /// Directory served by the bundled binary.
    pub document_root: Option<PathBuf>,
}

/// Per-connection protocol limits handed to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub buffer_size: usize,
    pub max_request_line: usize,
    pub max_header_line: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer_size: CLIENT_BUFFER_SIZE,
            max_request_line: MAX_REQUEST_LINE,
            max_header_line: MAX_HEADER_LINE,
        }
    }
}

pub fn default_workers() -> usize {
    (num_cpus::get() / 2).max(2)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            workers: default_workers(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            buffer_size: CLIENT_BUFFER_SIZE,
            max_request_line: MAX_REQUEST_LINE,
            max_header_line: MAX_HEADER_LINE,
            pin_workers: false,
            max_events: MAX_EVENTS,
            document_root: None,
        }
    }
}

impl ServerConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            ..Self::default()
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.buffer_size = limits.buffer_size;
        self.max_request_line = limits.max_request_line;
        self.max_header_line = limits.max_header_line;
        self
    }

    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> NocturneResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys fall back to defaults; keys that are set but do not parse
    /// are reported as [`NocturneError::Config`].
    pub fn from_lookup<F>(lookup: F) -> NocturneResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            listen: lookup("NOCTURNE_LISTEN").unwrap_or(defaults.listen),
            workers: parse_var(&lookup, "NOCTURNE_WORKERS")?.unwrap_or(defaults.workers),
            server_name: lookup("NOCTURNE_SERVER_NAME").unwrap_or(defaults.server_name),
            buffer_size: parse_var(&lookup, "NOCTURNE_BUFFER_SIZE")?
                .unwrap_or(defaults.buffer_size),
            max_request_line: parse_var(&lookup, "NOCTURNE_MAX_REQUEST_LINE")?
                .unwrap_or(defaults.max_request_line),
            max_header_line: parse_var(&lookup, "NOCTURNE_MAX_HEADER_LINE")?
                .unwrap_or(defaults.max_header_line),
            pin_workers: lookup("NOCTURNE_PIN_WORKERS")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.pin_workers),
            max_events: parse_var(&lookup, "NOCTURNE_MAX_EVENTS")?.unwrap_or(defaults.max_events),
            document_root: lookup("NOCTURNE_DOCUMENT_ROOT").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NocturneResult<()> {
        if self.listen.trim().is_empty() {
            return Err(NocturneError::Config("listen address is empty".into()));
        }
        if self.workers == 0 {
            return Err(NocturneError::Config("workers must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(NocturneError::Config("buffer size must be positive".into()));
        }
        if self.max_request_line == 0 || self.max_header_line == 0 {
            return Err(NocturneError::Config("line limits must be positive".into()));
        }
        if self.max_events == 0 {
            return Err(NocturneError::Config("max events must be positive".into()));
        }
        Ok(())
    }

    pub fn protocol_limits(&self) -> Limits {
        Limits {
            buffer_size: self.buffer_size,
            max_request_line: self.max_request_line,
            max_header_line: self.max_header_line,
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> NocturneResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| NocturneError::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert!(config.workers >= 2);
        assert_eq!(config.buffer_size, 8 * 1024);
        assert_eq!(config.max_request_line, 64 * 1024);
        assert_eq!(config.max_header_line, 64 * 1024);
        assert!(!config.pin_workers);
        assert!(config.document_root.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("NOCTURNE_LISTEN", "unix:/tmp/nocturne.sock"),
            ("NOCTURNE_WORKERS", "3"),
            ("NOCTURNE_MAX_HEADER_LINE", "1024"),
            ("NOCTURNE_PIN_WORKERS", "yes"),
            ("NOCTURNE_DOCUMENT_ROOT", "/srv/www"),
        ]))
        .unwrap();
        assert_eq!(config.listen, "unix:/tmp/nocturne.sock");
        assert_eq!(config.workers, 3);
        assert_eq!(config.protocol_limits().max_header_line, 1024);
        assert!(config.pin_workers);
        assert_eq!(config.document_root, Some(PathBuf::from("/srv/www")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServerConfig::from_lookup(lookup_from(&[("NOCTURNE_WORKERS", "many")]));
        assert!(matches!(err, Err(NocturneError::Config(_))));

        let err = ServerConfig::from_lookup(lookup_from(&[("NOCTURNE_WORKERS", "0")]));
        assert!(matches!(err, Err(NocturneError::Config(_))));
    }
}
