// src/status.rs

/// Outcome of a processing step.
///
/// `Ok`, `Declined`, `Done` and `Suspended` are control results shared by the
/// buffer chain, the request state machine and the `Root` collaborator.
/// `Http` carries an explicit response status chosen by a handler or by the
/// protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Declined,
    Done,
    Suspended,
    Http(u16),
}

impl Status {
    pub const BAD_REQUEST: Status = Status::Http(400);
    pub const NOT_FOUND: Status = Status::Http(404);
    pub const PAYLOAD_TOO_LARGE: Status = Status::Http(413);
    pub const INTERNAL_SERVER_ERROR: Status = Status::Http(500);

    /// HTTP status code used when this result becomes a response.
    ///
    /// A completed request is `200`. A request nobody picked up is `400`, and
    /// so is a suspended one when it is forced out before its completion.
    pub fn response_code(self) -> u16 {
        match self {
            Status::Http(code) => code,
            Status::Ok | Status::Done => 200,
            Status::Declined | Status::Suspended => 400,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Status::Http(code) if code >= 400)
    }
}

/// Status line for `code`, without the trailing CRLF.
pub fn status_line(code: u16) -> String {
    format!("HTTP/1.1 {} {}", code, reason_phrase(code))
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
