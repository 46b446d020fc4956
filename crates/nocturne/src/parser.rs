// src/parser.rs
use crate::http::{Method, RequestInfo, RequestUrl, protocol_version_number};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown or missing request method")]
    InvalidMethod,
    #[error("malformed request target")]
    InvalidUrl,
    #[error("unsupported protocol")]
    InvalidProtocol,
    #[error("request line is not terminated by CR")]
    MissingTerminator,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("request line is not valid UTF-8")]
    InvalidEncoding,
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Byte cursor over one request line.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn skip_spaces(&mut self) {
        while self.pos < self.buf.len() && matches!(self.buf[self.pos], b' ' | b'\t') {
            self.pos += 1;
        }
    }

    fn read_while(&mut self, f: impl Fn(u8) -> bool) -> &'a [u8] {
        let start = self.pos;
        while self.pos < self.buf.len() && f(self.buf[self.pos]) {
            self.pos += 1;
        }
        &self.buf[start..self.pos]
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }
}

/// Scanner for the request line and header lines of an HTTP/1.x request.
pub struct RequestFilter;

impl RequestFilter {
    /// Parse `METHOD SP target SP HTTP/<version> CR [LF]` into `info`.
    ///
    /// Returns the number of bytes consumed. `HEAD` marks the request as
    /// header-only.
    pub fn read_request_line(line: &[u8], info: &mut RequestInfo) -> Result<usize, ParseError> {
        let mut cur = Cursor { buf: line, pos: 0 };
        cur.skip_spaces();

        let method_name = cur.read_while(|b| b.is_ascii_uppercase());
        let method = Method::from_bytes(method_name).ok_or(ParseError::InvalidMethod)?;
        cur.skip_spaces();

        let target = cur.read_while(|b| !is_space(b));
        let target = std::str::from_utf8(target).map_err(|_| ParseError::InvalidEncoding)?;
        let url = RequestUrl::parse(target).ok_or(ParseError::InvalidUrl)?;
        cur.skip_spaces();

        let protocol_start = cur.pos;
        let protocol_name = cur.read_while(|b| b.is_ascii_uppercase());
        let mut version: &[u8] = b"";
        if cur.peek() == Some(b'/') {
            cur.pos += 1;
            version = cur.read_while(|b| b.is_ascii_alphanumeric() || b == b'.');
        }
        if protocol_name != b"HTTP" {
            return Err(ParseError::InvalidProtocol);
        }
        let protocol = &line[protocol_start..cur.pos];

        if cur.peek() != Some(b'\r') {
            return Err(ParseError::MissingTerminator);
        }
        cur.pos += 1;
        if cur.peek() == Some(b'\n') {
            cur.pos += 1;
        }

        // all slices so far are ASCII or validated above
        let text = |b: &[u8]| String::from_utf8_lossy(b).into_owned();
        let version = text(version);

        info.header_request = method == Method::Head;
        info.request_time = SystemTime::now();
        info.method = method;
        info.method_name = text(method_name);
        info.protocol = text(protocol);
        info.protocol_version = protocol_version_number(&version);
        info.unparsed_uri = target.to_string();
        info.url = url;
        info.request_line = text(trim_line_end(&line[..cur.pos]));
        Ok(cur.pos)
    }

    /// Split `Name: Value LF` into a trimmed name and value.
    ///
    /// Returns the bytes consumed with the name and value. The line must
    /// contain a colon and end with a line feed.
    pub fn read_request_header(line: &[u8]) -> Result<(usize, &str, &str), ParseError> {
        let colon = memchr::memchr(b':', line).ok_or(ParseError::InvalidHeader)?;
        let rest = &line[colon + 1..];
        let lf = memchr::memchr(b'\n', rest).ok_or(ParseError::InvalidHeader)?;

        let name = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::InvalidHeader)?;
        let value = std::str::from_utf8(&rest[..lf]).map_err(|_| ParseError::InvalidHeader)?;
        let name = name.trim_matches(|c: char| c.is_ascii_whitespace());
        let value = value.trim_matches(|c: char| c.is_ascii_whitespace());
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::InvalidHeader);
        }
        Ok((colon + 1 + lf + 1, name, value))
    }

    /// Bare `CRLF` (or `LF`) closing the header block.
    pub fn is_end_of_headers(line: &[u8]) -> bool {
        matches!(line, b"\r\n" | b"\n")
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}
