// src/completion.rs
//! Finishing a suspended request from another thread.
//!
//! A request never leaves the worker that parsed it. A handler that wants to
//! answer later takes a [`Completion`] and returns `Status::Suspended`; the
//! connection is parked until someone calls [`Completion::complete`]. The
//! closure passed there is posted to the owning worker's mailbox and runs on
//! that worker against the parked request.

use crate::request::Request;
use crate::status::Status;
use crate::syscalls;
use libc::c_int;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, trace, warn};

pub type FinishFn = Box<dyn FnOnce(&mut Request) -> Status + Send>;

pub(crate) struct Resumption {
    pub token: u64,
    pub finish: FinishFn,
}

/// Per-worker queue of resumptions, announced through the worker's own
/// eventfd.
pub(crate) struct Mailbox {
    event_fd: c_int,
    queue: Mutex<Vec<Resumption>>,
}

impl Mailbox {
    pub fn new() -> io::Result<Arc<Self>> {
        let event_fd = syscalls::create_eventfd()?;
        Ok(Arc::new(Self {
            event_fd,
            queue: Mutex::new(Vec::new()),
        }))
    }

    pub fn event_fd(&self) -> c_int {
        self.event_fd
    }

    fn post(&self, resumption: Resumption) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resumption);
        if let Err(e) = syscalls::eventfd_write(self.event_fd, 1) {
            error!("failed to signal worker mailbox: {}", e);
        }
    }

    /// Everything posted so far, oldest first. Resets the eventfd.
    pub fn drain(&self) -> Vec<Resumption> {
        if let Err(e) = syscalls::eventfd_read(self.event_fd) {
            warn!("failed to read worker mailbox: {}", e);
        }
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        syscalls::close(self.event_fd);
    }
}

/// Handle that finishes one suspended request.
///
/// `Send`, so it can travel into an [`AsyncTask`](crate::AsyncTask) or any
/// other thread. Dropping it unused answers the request with a 500.
pub struct Completion {
    mailbox: Option<Arc<Mailbox>>,
    token: u64,
}

impl Completion {
    pub(crate) fn new(mailbox: Arc<Mailbox>, token: u64) -> Self {
        Self {
            mailbox: Some(mailbox),
            token,
        }
    }

    /// Run `finish` on the owning worker with the parked request.
    ///
    /// The returned status is handled like the one from
    /// [`Root::process_request`](crate::Root::process_request): `Declined`
    /// becomes a 404, `Suspended` keeps the request parked, anything else
    /// submits the response.
    pub fn complete<F>(mut self, finish: F)
    where
        F: FnOnce(&mut Request) -> Status + Send + 'static,
    {
        self.post(Box::new(finish));
    }

    /// Submit the response with whatever the request holds.
    pub fn finish(self, status: Status) {
        self.complete(move |_| status);
    }

    fn post(&mut self, finish: FinishFn) {
        if let Some(mailbox) = self.mailbox.take() {
            mailbox.post(Resumption {
                token: self.token,
                finish,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.mailbox.is_some() {
            trace!(token = self.token, "completion dropped unused");
            self.post(Box::new(|_| Status::INTERNAL_SERVER_ERROR));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token)
            .field("pending", &self.mailbox.is_some())
            .finish()
    }
}
