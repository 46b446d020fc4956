// src/http.rs
use crate::status::Status;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
    Connect,
    Propfind,
    Proppatch,
    MkCol,
    Copy,
    Move,
    Lock,
    Unlock,
    Report,
    Merge,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        Some(match b {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            b"PROPFIND" => Method::Propfind,
            b"PROPPATCH" => Method::Proppatch,
            b"MKCOL" => Method::MkCol,
            b"COPY" => Method::Copy,
            b"MOVE" => Method::Move,
            b"LOCK" => Method::Lock,
            b"UNLOCK" => Method::Unlock,
            b"REPORT" => Method::Report,
            b"MERGE" => Method::Merge,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Propfind => "PROPFIND",
            Method::Proppatch => "PROPPATCH",
            Method::MkCol => "MKCOL",
            Method::Copy => "COPY",
            Method::Move => "MOVE",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
            Method::Report => "REPORT",
            Method::Merge => "MERGE",
        }
    }
}

/// Request target split into its parts.
///
/// Origin-form (`/path?query`) targets leave `scheme` and `host` empty until a
/// `Host` header fills them; absolute-form targets carry them directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestUrl {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl RequestUrl {
    /// Parse a request target. Returns `None` for anything that is neither
    /// origin-form, absolute-form nor `*`.
    pub fn parse(target: &str) -> Option<RequestUrl> {
        if target.is_empty() || target.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return None;
        }

        let mut url = RequestUrl::default();
        let mut rest = target;

        if let Some(idx) = rest.find('#') {
            url.fragment = Some(rest[idx + 1..].to_string());
            rest = &rest[..idx];
        }
        if let Some(idx) = rest.find('?') {
            url.query = Some(rest[idx + 1..].to_string());
            rest = &rest[..idx];
        }

        if rest == "*" {
            url.path = rest.to_string();
            return Some(url);
        }

        if let Some(idx) = rest.find("://") {
            let scheme = &rest[..idx];
            if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.') {
                return None;
            }
            url.scheme = scheme.to_ascii_lowercase();
            rest = &rest[idx + 3..];
            let path_start = rest.find('/').unwrap_or(rest.len());
            url.set_authority(&rest[..path_start])?;
            rest = &rest[path_start..];
            if rest.is_empty() {
                rest = "/";
            }
        }

        if !rest.starts_with('/') {
            return None;
        }
        url.path = rest.to_string();
        Some(url)
    }

    /// Apply a `host[:port]` authority, as sent in the `Host` header.
    pub fn set_authority(&mut self, authority: &str) -> Option<()> {
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        if authority.is_empty() {
            return None;
        }
        match authority.rfind(':') {
            Some(idx) if !authority.ends_with(']') => {
                let port = authority[idx + 1..].parse().ok()?;
                self.host = authority[..idx].to_ascii_lowercase();
                self.port = Some(port);
            }
            _ => {
                self.host = authority.to_ascii_lowercase();
                self.port = None;
            }
        }
        Some(())
    }

    /// Non-empty path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }
}

/// Everything known about a request before its body arrives.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub method_name: String,
    pub request_line: String,
    pub protocol: String,
    /// `major * 1000 + minor`, so HTTP/1.1 is `1001`.
    pub protocol_version: u32,
    pub unparsed_uri: String,
    pub url: RequestUrl,
    pub request_time: SystemTime,
    /// `HEAD` request: the response carries headers only.
    pub header_request: bool,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub document_root: Option<PathBuf>,
    pub filename: Option<PathBuf>,
    pub useragent_ip: Option<IpAddr>,
    pub useragent_port: u16,
    pub status: Status,
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self {
            method: Method::Get,
            method_name: String::new(),
            request_line: String::new(),
            protocol: String::new(),
            protocol_version: 0,
            unparsed_uri: String::new(),
            url: RequestUrl::default(),
            request_time: SystemTime::now(),
            header_request: false,
            content_length: 0,
            content_type: None,
            content_encoding: None,
            document_root: None,
            filename: None,
            useragent_ip: None,
            useragent_port: 0,
            status: Status::Ok,
        }
    }
}

/// `"1.1"` → `1001`; missing parts count as zero.
pub fn protocol_version_number(version: &str) -> u32 {
    let mut parts = version.splitn(2, '.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    major * 1000 + minor
}
