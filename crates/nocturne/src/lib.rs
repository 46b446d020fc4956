// src/lib.rs
//! nocturne: a non-blocking epoll HTTP/1.1 connection server.
//!
//! A [`ConnectionQueue`] owns the listening socket and a fixed set of worker
//! threads. Each worker runs its own epoll loop, parses requests with
//! [`RequestFilter`] and hands them to the application's [`Root`]. Slow work
//! is pushed to the shared task queue as [`AsyncTask`]s.

pub mod buffer;
pub mod completion;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod request;
pub mod server;
pub mod signals;
pub mod slab;
pub mod status;
pub mod syscalls;
pub mod task;
pub mod worker;

// Re-exports for users
pub use buffer::{Buffer, BufferChain, BufferFlags};
pub use completion::Completion;
pub use config::{Limits, ServerConfig};
pub use error::{NocturneError, NocturneResult};
pub use http::{Method, RequestInfo, RequestUrl};
pub use parser::{ParseError, RequestFilter};
pub use request::{Cookie, CookieFlags, InputFilter, Request, Root};
pub use server::{ConnectionQueue, ListenAddr};
pub use status::Status;
pub use task::{AsyncTask, AsyncTaskGroup, TaskHandle, TaskQueue};
