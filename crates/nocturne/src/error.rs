// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the nocturne connection server.
///
/// Only setup and loop-level failures surface here. Per-connection protocol
/// and I/O errors are mapped to HTTP statuses or a half-close and never leave
/// the owning client.
#[derive(Debug, Error)]
pub enum NocturneError {
    /// Underlying I/O error from the OS.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Listening socket could not be created, bound or put into listen mode.
    #[error("failed to open listening socket {addr}: {source}")]
    Socket {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Listen address did not match `unix:<path>`, `/path` or `host[:port]`.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    /// Configuration value was present but unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker thread could not be spawned or terminated abnormally.
    #[error("worker error: {0}")]
    Worker(String),
}

pub type NocturneResult<T> = Result<T, NocturneError>;
