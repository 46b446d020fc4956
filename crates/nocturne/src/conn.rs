// src/conn.rs
//! One accepted connection and its HTTP request state machine.

use crate::buffer::{BufferChain, Consume};
use crate::completion::{FinishFn, Mailbox};
use crate::config::Limits;
use crate::http::RequestInfo;
use crate::metrics::WorkerMetrics;
use crate::parser::RequestFilter;
use crate::pool::Pool;
use crate::request::{Request, Root, write_status_response};
use crate::status::Status;
use crate::syscalls;
use crate::task::TaskHandle;
use libc::c_int;
use std::net::{IpAddr, Shutdown, SocketAddrV4};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReadState {
    RequestLine,
    RequestHeaders,
    RequestProcess,
    RequestInput,
    /// Handler returned `Suspended`; waiting for its completion.
    RequestSuspended,
    Closed,
    Invalid,
}

/// Per-worker state every client of that worker needs.
pub struct WorkerContext {
    pub root: Arc<dyn Root>,
    pub limits: Limits,
    pub server_name: Arc<str>,
    pub tasks: TaskHandle,
    pub metrics: Arc<WorkerMetrics>,
    /// Parent of every request pool created on this worker.
    pub thread_pool: Pool,
    /// Where completions of suspended requests are posted.
    pub(crate) mailbox: Arc<Mailbox>,
}

pub struct Client {
    fd: c_int,
    /// Epoll token, carried by completions back to this client.
    token: u64,
    peer: Option<SocketAddrV4>,
    pool: Pool,
    input: BufferChain,
    output: BufferChain,
    request: Option<Request>,
    state: RequestReadState,
    /// Stream position where the line being scanned starts.
    bytes_read: usize,
    bytes_sent: usize,
    shutdown_read: bool,
    shutdown_write: bool,
    peer_closed: bool,
    valid: bool,
}

impl Client {
    /// Take ownership of a connected non-blocking socket.
    pub fn new(fd: c_int, peer: Option<SocketAddrV4>, pool: Pool) -> Self {
        Self {
            fd,
            token: 0,
            peer,
            pool,
            input: BufferChain::new(),
            output: BufferChain::new(),
            request: None,
            state: RequestReadState::RequestLine,
            bytes_read: 0,
            bytes_sent: 0,
            shutdown_read: false,
            shutdown_write: false,
            peer_closed: false,
            valid: true,
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn set_token(&mut self, token: u64) {
        self.token = token;
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn state(&self) -> RequestReadState {
        self.state
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_write_shutdown(&self) -> bool {
        self.shutdown_write
    }

    /// Response bytes queued but not yet accepted by the socket.
    pub fn has_pending_output(&self) -> bool {
        !self.shutdown_write && self.valid && !self.output.is_empty()
    }

    /// Nothing more can happen on this connection. A half-closed peer still
    /// waits for a suspended request to be answered.
    pub fn is_finished(&self) -> bool {
        !self.valid
            || (self.peer_closed
                && !self.has_pending_output()
                && self.state != RequestReadState::RequestSuspended)
    }

    /// The peer closed its write side.
    pub fn on_peer_closed(&mut self) {
        self.peer_closed = true;
    }

    pub fn shutdown_read(&mut self) {
        if !self.shutdown_read {
            self.shutdown_read = true;
            let _ = syscalls::shutdown(self.fd, Shutdown::Read);
        }
    }

    pub fn shutdown_write(&mut self) {
        if !self.shutdown_write {
            self.shutdown_write = true;
            let _ = syscalls::shutdown(self.fd, Shutdown::Write);
        }
    }

    pub fn shutdown_all(&mut self) {
        if !self.shutdown_read && !self.shutdown_write {
            self.shutdown_read = true;
            self.shutdown_write = true;
            let _ = syscalls::shutdown(self.fd, Shutdown::Both);
        } else {
            self.shutdown_read();
            self.shutdown_write();
        }
    }

    /// Drain the socket and advance the state machine.
    pub fn perform_read(&mut self, ctx: &WorkerContext) {
        if self.shutdown_read {
            return;
        }

        match self.input.read_from_fd(&self.pool, self.fd) {
            Ok(read) => {
                if read.eof {
                    self.peer_closed = true;
                }
            }
            Err(e) => {
                debug!(fd = self.fd, "read failed: {}", e);
                self.shutdown_read();
                self.valid = false;
                return;
            }
        }

        if self.input.size() > 0 {
            match self.run_input_filter(ctx) {
                Status::Ok | Status::Done | Status::Declined | Status::Suspended => {}
                Status::Http(code) => self.cancel_with_result(ctx, code),
            }
        }
    }

    /// Push queued output to the socket.
    pub fn perform_write(&mut self, metrics: &WorkerMetrics) {
        if self.shutdown_write || !self.valid {
            return;
        }

        let mut sent = 0;
        let status = self.output.write_to_fd(self.fd, &mut sent);
        self.bytes_sent += sent;
        metrics.add_bytes(sent);
        match status {
            // drained, or waiting for EPOLLOUT
            Status::Ok | Status::Declined => {}
            Status::Done => self.shutdown_write(),
            Status::Suspended | Status::Http(_) => {
                debug!(fd = self.fd, "write failed, closing write side");
                self.shutdown_write();
                self.valid = false;
            }
        }
    }

    /// Queue `source` behind the current output and try to send it.
    fn write_chain(&mut self, source: &mut BufferChain, metrics: &WorkerMetrics) -> bool {
        if self.output.is_closed() || self.shutdown_write {
            return false;
        }
        self.output.append_chain(source);
        self.perform_write(metrics);
        true
    }

    /// Answer with a JSON status document and stop reading requests.
    pub fn cancel_with_result(&mut self, ctx: &WorkerContext, code: u16) {
        self.state = RequestReadState::Closed;
        self.request = None;
        if self.output.is_closed() || self.shutdown_write {
            return;
        }
        debug!(fd = self.fd, code, "cancelling request");
        let mut staging = BufferChain::new();
        write_status_response(&mut staging, &self.pool, &ctx.server_name, code);
        self.write_chain(&mut staging, &ctx.metrics);
        self.input.clear();
    }

    /// Consume buffered input until more bytes are needed.
    ///
    /// Returns `Suspended` when waiting for input, `Done` once the response
    /// has been submitted, or an HTTP status for a protocol error.
    fn run_input_filter(&mut self, ctx: &WorkerContext) -> Status {
        loop {
            if self.input.size() == 0 && self.state != RequestReadState::RequestProcess {
                return Status::Suspended;
            }

            match self.state {
                RequestReadState::RequestLine => {
                    match self.scan_line(ctx.limits.max_request_line) {
                        Status::Declined => return Status::PAYLOAD_TOO_LARGE,
                        Status::Done => {
                            if let Err(status) = self.read_request(ctx) {
                                self.shutdown_read();
                                return status;
                            }
                        }
                        _ => return Status::Suspended,
                    }
                }
                RequestReadState::RequestHeaders => {
                    match self.scan_line(ctx.limits.max_header_line) {
                        Status::Declined => return Status::PAYLOAD_TOO_LARGE,
                        Status::Done => {
                            if let Err(status) = self.parse_request_header() {
                                return status;
                            }
                        }
                        _ => return Status::Suspended,
                    }
                }
                RequestReadState::RequestProcess => {
                    let status = self.process_request(ctx);
                    let awaiting_body = matches!(status, Status::Ok | Status::Suspended)
                        && self.request.as_ref().is_some_and(|r| {
                            r.has_input_filter() && r.info().content_length > 0
                        });
                    if awaiting_body {
                        trace!(fd = self.fd, "streaming request body");
                        self.state = RequestReadState::RequestInput;
                        continue;
                    }
                    return self.answer(ctx, status);
                }
                RequestReadState::RequestInput => {
                    match self.feed_input() {
                        Status::Ok => {}
                        Status::Done => {
                            self.submit_response(ctx, Status::Done);
                            return Status::Done;
                        }
                        Status::Suspended => return self.answer(ctx, Status::Suspended),
                        Status::Declined => return Status::BAD_REQUEST,
                        other => return other,
                    }
                }
                RequestReadState::RequestSuspended => {
                    // one request per connection; later bytes are dropped
                    self.input.clear();
                    return Status::Suspended;
                }
                RequestReadState::Closed | RequestReadState::Invalid => {
                    self.input.clear();
                    return Status::Done;
                }
            }
        }
    }

    /// Act on a handler result: park on `Suspended`, otherwise respond.
    fn answer(&mut self, ctx: &WorkerContext, status: Status) -> Status {
        match status {
            Status::Suspended => {
                trace!(fd = self.fd, "request suspended");
                self.state = RequestReadState::RequestSuspended;
                Status::Suspended
            }
            Status::Declined => {
                self.submit_response(ctx, Status::NOT_FOUND);
                Status::Done
            }
            other => {
                self.submit_response(ctx, other);
                Status::Done
            }
        }
    }

    /// Run a posted completion against the suspended request.
    ///
    /// Ignored unless the client is parked; the request may already have
    /// been answered or cancelled.
    pub fn resume(&mut self, ctx: &WorkerContext, finish: FinishFn) {
        if self.state != RequestReadState::RequestSuspended {
            trace!(fd = self.fd, state = ?self.state, "completion for a request that is not suspended");
            return;
        }
        let Some(request) = self.request.as_mut() else {
            return;
        };
        let status = match panic::catch_unwind(AssertUnwindSafe(|| finish(request))) {
            Ok(status) => status,
            Err(_) => {
                warn!(fd = self.fd, "completion panicked");
                Status::INTERNAL_SERVER_ERROR
            }
        };
        self.answer(ctx, status);
    }

    /// Look for the end of the current line within `limit` bytes.
    ///
    /// `Done` when the line feed was found, `Declined` when the line cannot
    /// end within the limit, `Ok` when more input is needed.
    fn scan_line(&mut self, limit: usize) -> Status {
        let mut scanned = self.input.bytes_read() - self.bytes_read;
        let status = self.input.read(false, |_, src| {
            let window = limit.saturating_sub(scanned);
            if window == 0 {
                return Consume::Stop(Status::Declined);
            }
            let view = &src[..src.len().min(window)];
            match memchr::memchr(b'\n', view) {
                Some(pos) => Consume::Done(pos + 1),
                None if src.len() >= window => Consume::Stop(Status::Declined),
                None => {
                    scanned += src.len();
                    Consume::Continue(src.len())
                }
            }
        });
        match status {
            Status::Done | Status::Declined => status,
            _ => Status::Ok,
        }
    }

    /// Parse the request line just found and create the request.
    fn read_request(&mut self, ctx: &WorkerContext) -> Result<(), Status> {
        let start = self.bytes_read;
        let end = self.input.bytes_read();
        let line = self.input.slice(start, end - start).ok_or(Status::INTERNAL_SERVER_ERROR)?;

        if RequestFilter::is_end_of_headers(&line) {
            // stray empty line before the request
            drop(line);
            self.bytes_read = end;
            self.input.release_empty();
            return Ok(());
        }

        let mut info = RequestInfo::default();
        if let Err(e) = RequestFilter::read_request_line(&line, &mut info) {
            debug!(fd = self.fd, "bad request line: {}", e);
            return Err(Status::BAD_REQUEST);
        }
        drop(line);

        if let Some(peer) = self.peer {
            info.useragent_ip = Some(IpAddr::V4(*peer.ip()));
            info.useragent_port = peer.port();
        }
        trace!(fd = self.fd, request = %info.request_line, "request line");

        let mut request = Request::new(info, ctx.thread_pool.child(), ctx.tasks.clone());
        request.attach_mailbox(ctx.mailbox.clone(), self.token);
        self.request = Some(request);
        self.state = RequestReadState::RequestHeaders;
        self.bytes_read = end;
        self.input.release_empty();
        Ok(())
    }

    fn parse_request_header(&mut self) -> Result<(), Status> {
        let start = self.bytes_read;
        let end = self.input.bytes_read();
        let line = self.input.slice(start, end - start).ok_or(Status::INTERNAL_SERVER_ERROR)?;
        let request = self.request.as_mut().ok_or(Status::INTERNAL_SERVER_ERROR)?;

        if RequestFilter::is_end_of_headers(&line) {
            self.state = RequestReadState::RequestProcess;
        } else {
            let (_, name, value) = RequestFilter::read_request_header(&line).map_err(|e| {
                debug!(fd = self.fd, "bad header line: {}", e);
                Status::BAD_REQUEST
            })?;
            if !request.set_request_header(name, value) {
                return Err(Status::BAD_REQUEST);
            }
        }
        drop(line);

        self.bytes_read = end;
        self.input.release_empty();
        Ok(())
    }

    fn process_request(&mut self, ctx: &WorkerContext) -> Status {
        ctx.metrics.inc_req();
        let Some(request) = self.request.as_mut() else {
            return Status::INTERNAL_SERVER_ERROR;
        };
        let root = &ctx.root;
        match panic::catch_unwind(AssertUnwindSafe(|| root.process_request(request))) {
            Ok(status) => status,
            Err(_) => {
                warn!(fd = self.fd, "request handler panicked");
                Status::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stream buffered body bytes into the request's input filter.
    fn feed_input(&mut self) -> Status {
        let Some(request) = self.request.as_mut() else {
            return Status::INTERNAL_SERVER_ERROR;
        };
        let mut finished = Status::Done;
        let status = self.input.read(true, |_, src| {
            let (used, status) = request.process_input(src);
            match status {
                Status::Ok => Consume::Continue(used),
                Status::Done | Status::Suspended => {
                    finished = status;
                    Consume::Done(used)
                }
                other => Consume::Stop(other),
            }
        });
        match status {
            Status::Done => finished,
            other => other,
        }
    }

    fn submit_response(&mut self, ctx: &WorkerContext, status: Status) {
        self.state = RequestReadState::Closed;
        let Some(mut request) = self.request.take() else {
            return;
        };

        let mut staging = BufferChain::new();
        let code = request.submit_response(status, &mut staging, &self.pool, &ctx.server_name);
        debug!(
            method = request.info().method.as_str(),
            path = %request.info().url.path,
            code,
            "request complete"
        );
        if !self.write_chain(&mut staging, &ctx.metrics) {
            warn!(fd = self.fd, "response dropped, output already closed");
        }
        self.input.clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        syscalls::close(self.fd);
    }
}
