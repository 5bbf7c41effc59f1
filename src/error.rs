//! Error types for the relay server.
//!
//! Per-request failures are converted into RTSP responses by the session;
//! everything else terminates the connection.

use thiserror::Error;

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed RTSP message or interleaved framing.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Request carried no usable credentials.
    #[error("authorization required")]
    AuthRequired,

    /// Credentials were present but did not verify.
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    /// DESCRIBE for a path with no active publisher.
    #[error("no stream published on {0}")]
    NotFound(String),

    /// Publish rejected: the path already has a publisher and takeover is off.
    #[error("path {0} already has a publisher")]
    NotAcceptable(String),

    /// Request URL failed to parse.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Transport header missing or unusable.
    #[error("invalid transport header: {0}")]
    InvalidTransport(String),

    /// SETUP control URL matched neither the audio nor the video track.
    #[error("SETUP got UnKown control:{0}")]
    InvalidControl(String),

    /// Method issued before its prerequisites (SETUP without ANNOUNCE etc).
    #[error("bad state: {0}")]
    BadState(&'static str),

    /// UDP port allocation or queue saturation.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Idle read deadline exceeded.
    #[error("read deadline exceeded")]
    Timeout,

    /// Socket read/write failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Framing and message-grammar failures surfaced by the wire codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty request")]
    EmptyRequest,

    #[error("malformed request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("malformed header line: {0:?}")]
    InvalidHeader(String),

    #[error("header block exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("request body of {got} bytes exceeds limit of {limit}")]
    BodyTooLarge { got: usize, limit: usize },
}

impl Error {
    /// Status code and reason phrase used when this error is reported to the
    /// peer instead of killing the connection outright.
    pub fn status(&self) -> (u16, String) {
        match self {
            Error::AuthRequired | Error::AuthFailed(_) => (401, "Unauthorized".into()),
            Error::NotFound(_) => (404, "NOT FOUND".into()),
            Error::NotAcceptable(_) => (406, "Not Acceptable".into()),
            Error::InvalidUrl(_) => (500, "Invalid URL".into()),
            Error::InvalidControl(url) => (500, format!("SETUP got UnKown control:{url}")),
            Error::BadState(_) => (500, "Error Status".into()),
            other => (500, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::AuthRequired.status().0, 401);
        assert_eq!(Error::NotFound("/live/a".into()).status().0, 404);
        assert_eq!(Error::NotAcceptable("/live/a".into()).status().0, 406);
        assert_eq!(Error::BadState("SETUP before ANNOUNCE").status(), (500, "Error Status".into()));
    }

    #[test]
    fn test_unknown_control_reason() {
        let (code, reason) = Error::InvalidControl("rtsp://h:554/x".into()).status();
        assert_eq!(code, 500);
        assert!(reason.contains("UnKown control"));
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
