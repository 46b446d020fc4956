// src/request.rs
//! The request controller handed to the [`Root`] collaborator.

use crate::buffer::{Buffer, BufferChain, BufferFlags};
use crate::completion::{Completion, Mailbox};
use crate::http::RequestInfo;
use crate::pool::Pool;
use crate::status::{Status, status_line};
use crate::task::{AsyncTask, TaskHandle};
use bitflags::bitflags;
use serde::Serialize;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Application entry point invoked once per request, after the headers.
///
/// Implementations must be shareable between worker threads. Returning
/// `Ok` or `Suspended` with an input filter installed makes the worker
/// stream the body into that filter before responding. `Suspended` without
/// one parks the request until its [`Completion`] fires. `Declined` becomes
/// a 404.
pub trait Root: Send + Sync {
    fn process_request(&self, request: &mut Request) -> Status;

    /// Overrides the configured `Server` header value.
    fn server_name(&self) -> Option<&str> {
        None
    }
}

impl<F> Root for F
where
    F: Fn(&mut Request) -> Status + Send + Sync,
{
    fn process_request(&self, request: &mut Request) -> Status {
        self(request)
    }
}

/// Receiver for a request body.
pub trait InputFilter {
    /// Consume one chunk of the body.
    fn step(&mut self, data: &[u8]) -> Status;

    /// Called once after the last byte; may write the response.
    fn finalize(&mut self, request: &mut Request) -> Status;
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every value of `name`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CookieFlags: u8 {
        const HTTP_ONLY = 1 << 0;
        const SAME_SITE_LAX = 1 << 1;
        const SAME_SITE_STRICT = 1 << 2;
        const SAME_SITE_NONE = 1 << 3;
        const SECURE = 1 << 4;
    }
}

impl CookieFlags {
    /// `HttpOnly; SameSite=Lax`
    pub const DEFAULT: CookieFlags =
        CookieFlags::HTTP_ONLY.union(CookieFlags::SAME_SITE_LAX);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub max_age: Option<Duration>,
    pub flags: CookieFlags,
}

impl Cookie {
    /// `Set-Cookie` header value.
    pub fn header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(max_age) = self.max_age {
            let _ = write!(out, "; Max-Age={}", max_age.as_secs());
        }
        if self.flags.contains(CookieFlags::HTTP_ONLY) {
            out.push_str("; HttpOnly");
        }
        if self.flags.contains(CookieFlags::SAME_SITE_STRICT) {
            out.push_str("; SameSite=Strict");
        } else if self.flags.contains(CookieFlags::SAME_SITE_LAX) {
            out.push_str("; SameSite=Lax");
        } else if self.flags.contains(CookieFlags::SAME_SITE_NONE) {
            out.push_str("; SameSite=None");
        }
        if self.flags.contains(CookieFlags::SECURE) {
            out.push_str("; Secure");
        }
        out
    }
}

#[derive(Serialize)]
struct StatusBody {
    date: u64,
    status: u16,
}

/// `{"date": <unix micros>, "status": <code>}`
pub fn status_body(code: u16) -> Vec<u8> {
    let date = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    serde_json::to_vec(&StatusBody { date, status: code }).unwrap_or_default()
}

/// Everything needed to emit a response head besides the status.
pub(crate) struct ResponseHead<'a> {
    pub server_name: &'a str,
    pub content_type: Option<&'a str>,
    pub content_encoding: Option<&'a str>,
    pub content_length: usize,
    pub headers: Option<&'a Headers>,
    pub cookies: &'a [Cookie],
}

/// Serialize the status line and headers, ending with the blank line.
pub(crate) fn write_head(out: &mut BufferChain, pool: &Pool, code: u16, head: &ResponseHead<'_>) {
    let mut text = String::with_capacity(256);
    text.push_str(&status_line(code));
    text.push_str("\r\nDate: ");
    text.push_str(&httpdate::fmt_http_date(SystemTime::now()));
    text.push_str("\r\nConnection: close\r\nServer: ");
    text.push_str(head.server_name);
    if let Some(content_type) = head.content_type {
        text.push_str("\r\nContent-Type: ");
        text.push_str(content_type);
    }
    if let Some(encoding) = head.content_encoding {
        text.push_str("\r\nContent-Encoding: ");
        text.push_str(encoding);
    }
    text.push_str("\r\nContent-Length: ");
    text.push_str(itoa::Buffer::new().format(head.content_length));
    text.push_str("\r\n");
    if let Some(headers) = head.headers {
        for (name, value) in headers.iter() {
            let _ = write!(text, "{name}: {value}\r\n");
        }
    }
    for cookie in head.cookies {
        let _ = write!(text, "Set-Cookie: {}\r\n", cookie.header_value());
    }
    text.push_str("\r\n");
    out.write(pool, text.as_bytes(), BufferFlags::empty());
}

/// Write a complete JSON status response and close the stream.
pub fn write_status_response(out: &mut BufferChain, pool: &Pool, server_name: &str, code: u16) {
    let body = status_body(code);
    let head = ResponseHead {
        server_name,
        content_type: Some(JSON_CONTENT_TYPE),
        content_encoding: None,
        content_length: body.len(),
        headers: None,
        cookies: &[],
    };
    write_head(out, pool, code, &head);
    out.write(pool, &body, BufferFlags::EOS);
}

/// Per-request controller.
///
/// Owns a child pool of the worker's thread pool and the response staging
/// chain; both go away with the request.
pub struct Request {
    info: RequestInfo,
    pool: Pool,
    tasks: TaskHandle,
    request_headers: Headers,
    response_headers: Headers,
    error_headers: Headers,
    cookies: Vec<Cookie>,
    request_cookies: Vec<(String, String)>,
    status: Option<u16>,
    response: BufferChain,
    input_filter: Option<Box<dyn InputFilter>>,
    input_remaining: u64,
    mailbox: Option<Arc<Mailbox>>,
    token: u64,
}

impl Request {
    pub fn new(info: RequestInfo, pool: Pool, tasks: TaskHandle) -> Self {
        Self {
            info,
            pool,
            tasks,
            request_headers: Headers::default(),
            response_headers: Headers::default(),
            error_headers: Headers::default(),
            cookies: Vec::new(),
            request_cookies: Vec::new(),
            status: None,
            response: BufferChain::new(),
            input_filter: None,
            input_remaining: 0,
            mailbox: None,
            token: 0,
        }
    }

    /// Route completions of this request to the worker owning `token`.
    pub(crate) fn attach_mailbox(&mut self, mailbox: Arc<Mailbox>, token: u64) {
        self.mailbox = Some(mailbox);
        self.token = token;
    }

    /// Handle for answering this request later, from any thread.
    ///
    /// Take it, hand it to the code doing the slow part and return
    /// `Status::Suspended`. `None` when the request is not served by a
    /// worker.
    pub fn completion(&self) -> Option<Completion> {
        self.mailbox
            .as_ref()
            .map(|mailbox| Completion::new(mailbox.clone(), self.token))
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut RequestInfo {
        &mut self.info
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Queue shared by all workers, for offloading work from a handler.
    pub fn tasks(&self) -> &TaskHandle {
        &self.tasks
    }

    pub fn push_task(&self, task: AsyncTask) {
        self.tasks.push_task(task);
    }

    /// Record a request header. `Host`, `Content-Length`, `Content-Type` and
    /// `Cookie` also update the request info. Returns `false` for an
    /// unparseable `Content-Length`.
    pub fn set_request_header(&mut self, name: &str, value: &str) -> bool {
        match name.to_ascii_lowercase().as_str() {
            "host" => {
                if self.info.url.set_authority(value).is_none() {
                    debug!(host = value, "ignoring malformed Host header");
                }
            }
            "content-length" => match value.parse::<u64>() {
                Ok(len) => self.info.content_length = len,
                Err(_) => return false,
            },
            "content-type" => self.info.content_type = Some(value.to_string()),
            "cookie" => self.parse_cookies(value),
            _ => {}
        }
        self.request_headers.append(name, value);
        true
    }

    fn parse_cookies(&mut self, value: &str) {
        for pair in value.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.request_cookies.push((name.to_string(), value.trim().to_string()));
                }
            }
        }
    }

    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name)
    }

    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    /// Cookie sent by the client.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.request_cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_status(&mut self, code: u16) {
        self.status = Some(code);
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn set_content_type(&mut self, value: impl Into<String>) {
        self.info.content_type = Some(value.into());
    }

    pub fn set_content_encoding(&mut self, value: impl Into<String>) {
        self.info.content_encoding = Some(value.into());
    }

    /// Header sent with responses below 400.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.set(name, value);
    }

    /// Header sent with responses of 400 and above.
    pub fn set_error_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.error_headers.set(name, value);
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    pub fn set_cookie(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        max_age: Option<Duration>,
        flags: CookieFlags,
    ) {
        let name = name.into();
        self.cookies.retain(|c| c.name != name);
        self.cookies.push(Cookie {
            name,
            value: value.into(),
            max_age,
            flags,
        });
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn set_document_root(&mut self, root: impl Into<PathBuf>) {
        self.info.document_root = Some(root.into());
    }

    /// Answer with the contents of `path`, sent zero-copy. Relative paths
    /// resolve against the document root.
    pub fn set_filename(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let resolved = match &self.info.document_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        };
        self.info.filename = Some(resolved);
    }

    /// Append bytes to the response body.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        self.response.write(&self.pool, bytes, BufferFlags::empty())
    }

    /// Serialize `value` as the response body.
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> bool {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.set_content_type(JSON_CONTENT_TYPE);
                self.write(&body)
            }
            Err(e) => {
                warn!("failed to serialize response body: {}", e);
                false
            }
        }
    }

    pub fn set_input_filter(&mut self, filter: Box<dyn InputFilter>) {
        self.input_remaining = self.info.content_length;
        self.input_filter = Some(filter);
    }

    pub fn has_input_filter(&self) -> bool {
        self.input_filter.is_some()
    }

    /// Body bytes still expected by the input filter.
    pub fn input_remaining(&self) -> u64 {
        self.input_remaining
    }

    /// Feed body bytes to the input filter.
    ///
    /// Takes at most the remaining content length and returns how many
    /// bytes were used. The status is `Ok` while more input is expected,
    /// `Done` once the filter was finalized, `Suspended` when the finalizer
    /// will answer through a [`Completion`], or the filter's error.
    pub fn process_input(&mut self, data: &[u8]) -> (usize, Status) {
        let Some(filter) = self.input_filter.as_mut() else {
            return (0, Status::Done);
        };

        let take = (data.len() as u64).min(self.input_remaining) as usize;
        if take > 0 {
            match filter.step(&data[..take]) {
                Status::Ok | Status::Done | Status::Suspended => {}
                other => return (take, other),
            }
            self.input_remaining -= take as u64;
        }

        if self.input_remaining > 0 {
            return (take, Status::Ok);
        }

        let status = match self.input_filter.take() {
            Some(mut filter) => filter.finalize(self),
            None => Status::Done,
        };
        match status {
            Status::Ok | Status::Done => (take, Status::Done),
            other => (take, other),
        }
    }

    /// Serialize the response for `status` into `out` and close it.
    ///
    /// An explicit [`set_status`](Self::set_status) wins over `status`.
    /// The body is the named file, or what was written to the request, or a
    /// JSON status document when neither is present. `HEAD` requests get the
    /// head only. Returns the code that was sent.
    pub fn submit_response(&mut self, status: Status, out: &mut BufferChain, pool: &Pool, server_name: &str) -> u16 {
        let mut code = self.status.unwrap_or_else(|| status.response_code());

        let mut file_body = None;
        if let Some(path) = self.info.filename.clone() {
            match Buffer::from_file(&path, 0, usize::MAX, 0) {
                Ok(buffer) => file_body = Some(buffer),
                Err(e) => {
                    debug!(path = %path.display(), "cannot open response file: {}", e);
                    code = if e.kind() == io::ErrorKind::NotFound { 404 } else { 500 };
                    self.response = BufferChain::new();
                }
            }
        }

        if file_body.is_none() && self.response.size() == 0 {
            let body = status_body(code);
            self.response = BufferChain::new();
            self.response.write(&self.pool, &body, BufferFlags::empty());
            self.info.content_type = Some(JSON_CONTENT_TYPE.to_string());
            self.info.content_encoding = None;
        }

        let content_length = match &file_body {
            Some(buffer) => buffer.len(),
            None => self.response.size(),
        };
        let headers = if code >= 400 {
            &self.error_headers
        } else {
            &self.response_headers
        };
        let head = ResponseHead {
            server_name,
            content_type: self.info.content_type.as_deref(),
            content_encoding: self.info.content_encoding.as_deref(),
            content_length,
            headers: Some(headers),
            cookies: &self.cookies,
        };
        write_head(out, pool, code, &head);

        if !self.info.header_request {
            match file_body {
                Some(buffer) => {
                    out.append(buffer);
                }
                None => {
                    out.append_chain(&mut self.response);
                }
            }
        }
        out.write(pool, b"", BufferFlags::EOS);
        self.info.status = Status::Http(code);
        code
    }
}
