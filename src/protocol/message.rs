//! RTSP request and response messages (RFC 2326 subset).
//!
//! Requests follow HTTP/1.1 syntax: a request line, CRLF-terminated header
//! lines, an empty line, then an optional body of exactly `Content-Length`
//! bytes. Responses mirror that with a status line. Header lookup is
//! case-insensitive per RFC 2326 §4.2; header order is preserved as
//! received so `parse(serialize(r)) == r` holds for canonical messages.

use crate::error::ProtocolError;

/// RTSP method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Announce,
    Describe,
    Setup,
    Play,
    Record,
    Pause,
    Teardown,
    /// Unrecognized methods are carried through and answered per the
    /// session's state rules rather than rejected at the parser.
    Extension(String),
}

impl Method {
    pub fn from_name(name: &str) -> Method {
        match name {
            "OPTIONS" => Method::Options,
            "ANNOUNCE" => Method::Announce,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "RECORD" => Method::Record,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            other => Method::Extension(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Announce => "ANNOUNCE",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Record => "RECORD",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::Extension(name) => name,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed RTSP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Request {
    /// Parse a request from its text form. `text` may carry the body after
    /// the blank line; it is truncated to `Content-Length` when present.
    pub fn parse(text: &str) -> Result<Request, ProtocolError> {
        let (head, rest) = match text.split_once("\r\n\r\n") {
            Some((head, rest)) => (head, rest),
            None => (text.trim_end_matches("\r\n"), ""),
        };
        let mut lines = head.lines();

        let request_line = lines.next().ok_or(ProtocolError::EmptyRequest)?;
        if request_line.trim().is_empty() {
            return Err(ProtocolError::EmptyRequest);
        }
        let mut parts = request_line.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (Method::from_name(m), u.to_string(), v.to_string()),
            _ => return Err(ProtocolError::InvalidRequestLine(request_line.to_string())),
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| ProtocolError::InvalidHeader(line.to_string()))?;
            headers.push((
                line[..colon].trim().to_string(),
                line[colon + 1..].trim().to_string(),
            ));
        }

        let mut request = Request {
            method,
            uri,
            version,
            headers,
            body: String::new(),
        };
        let len = request.content_length();
        if len > 0 {
            request.body = rest.get(..len).unwrap_or(rest).to_string();
        }
        Ok(request)
    }

    /// Serialize back to the wire form with headers in stored order.
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method.name(), self.uri, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }

    /// Declared body length; absent or unparsable means zero.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// An RTSP response under construction.
///
/// Every response carries the request's CSeq and the session id. The
/// reason phrase doubles as the error detail channel, matching what
/// clients in the field expect from this server family.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, reason: &str, cseq: &str, session_id: &str) -> Response {
        Response {
            status,
            reason: reason.to_string(),
            headers: vec![
                ("CSeq".to_string(), cseq.to_string()),
                ("Session".to_string(), session_id.to_string()),
            ],
            body: String::new(),
        }
    }

    pub fn ok(cseq: &str, session_id: &str) -> Response {
        Response::new(200, "OK", cseq, session_id)
    }

    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        self.status = status;
        self.reason = reason.into();
    }

    /// Set a header, replacing an existing one of the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            entry.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Attach a body; `Content-Length` is maintained automatically.
    pub fn set_body(&mut self, body: &str) {
        self.body = body.to_string();
        self.set_header("Content-Length", &body.len().to_string());
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}
