//! Classification of network failures
//!
//! Every failure coming back from the pipeline is mapped onto a closed set of
//! categories. The category decides whether a stale cached entry may be
//! served in place of the failed refresh.

use serde::Serialize;
use std::error::Error as StdError;
use thiserror::Error;

use crate::network::RawFailure;

/// Category of a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connectivity problem: refused, reset, timed out
    Network,
    /// The response body could not be decoded into the expected shape
    Serialization,
    /// The server answered with an error status
    Server,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Whether a stale cached entry may stand in for the failed call
    pub fn allows_stale_fallback(self) -> bool {
        match self {
            ErrorKind::Network | ErrorKind::Server => true,
            ErrorKind::Serialization | ErrorKind::Unknown => false,
        }
    }
}

/// A classified failure, attached to response metadata or returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind:?} error: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status, for server errors
    pub http_status: Option<u16>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn allows_stale_fallback(&self) -> bool {
        self.kind.allows_stale_fallback()
    }
}

/// Maps a raw pipeline failure onto an `ApiError`
pub fn classify(failure: &RawFailure) -> ApiError {
    match failure {
        RawFailure::Status { status, .. } => ApiError {
            kind: ErrorKind::Server,
            message: failure.to_string(),
            http_status: Some(*status),
        },
        RawFailure::Cancelled => ApiError::new(ErrorKind::Unknown, failure.to_string()),
        RawFailure::Other(error) => {
            let kind = classify_error(error.as_ref());
            let mut api_error = ApiError::new(kind, error.to_string());
            if kind == ErrorKind::Server {
                api_error.http_status = find_in_chain::<reqwest::Error>(error.as_ref())
                    .and_then(|e| e.status())
                    .map(|s| s.as_u16());
            }
            api_error
        }
    }
}

/// Inspects an arbitrary error and its source chain
fn classify_error(error: &(dyn StdError + 'static)) -> ErrorKind {
    if let Some(e) = find_in_chain::<reqwest::Error>(error) {
        if e.is_timeout() || e.is_connect() {
            return ErrorKind::Network;
        }
        if e.status().is_some() {
            return ErrorKind::Server;
        }
        if e.is_decode() {
            return ErrorKind::Serialization;
        }
    }

    if find_in_chain::<std::io::Error>(error).is_some() {
        return ErrorKind::Network;
    }
    if find_in_chain::<serde_json::Error>(error).is_some() {
        return ErrorKind::Serialization;
    }

    ErrorKind::Unknown
}

/// Returns the first error of type `E` in the source chain, starting at `error`
fn find_in_chain<'a, E: StdError + 'static>(error: &'a (dyn StdError + 'static)) -> Option<&'a E> {
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<E>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::io;

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "transport failed")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[derive(Debug)]
    struct Opaque;

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "something odd")
        }
    }

    impl StdError for Opaque {}

    #[test]
    fn test_status_is_server_error_with_http_status() {
        let error = classify(&RawFailure::Status {
            status: 503,
            body: "maintenance".to_string(),
        });

        assert_eq!(error.kind, ErrorKind::Server);
        assert_eq!(error.http_status, Some(503));
        assert!(error.message.contains("maintenance"));
    }

    #[test]
    fn test_io_error_is_network_error() {
        let failure = RawFailure::from(io::Error::new(io::ErrorKind::TimedOut, "timed out"));

        let error = classify(&failure);

        assert_eq!(error.kind, ErrorKind::Network);
        assert_eq!(error.http_status, None);
    }

    #[test]
    fn test_io_error_found_in_source_chain() {
        let failure = RawFailure::Other(Box::new(Wrapper(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        ))));

        assert_eq!(classify(&failure).kind, ErrorKind::Network);
    }

    #[test]
    fn test_json_error_is_serialization_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{oops")
            .expect_err("Invalid JSON should fail");

        let error = classify(&RawFailure::from(json_error));

        assert_eq!(error.kind, ErrorKind::Serialization);
    }

    #[test]
    fn test_unrecognised_error_is_unknown() {
        let error = classify(&RawFailure::Other(Box::new(Opaque)));

        assert_eq!(error.kind, ErrorKind::Unknown);
        assert_eq!(error.message, "something odd");
    }

    #[test]
    fn test_fallback_verdict_per_kind() {
        assert!(ErrorKind::Network.allows_stale_fallback());
        assert!(ErrorKind::Server.allows_stale_fallback());
        assert!(!ErrorKind::Serialization.allows_stale_fallback());
        assert!(!ErrorKind::Unknown.allows_stale_fallback());
    }

    #[test]
    fn test_api_error_display() {
        let error = ApiError::new(ErrorKind::Network, "connection refused");

        assert_eq!(error.to_string(), "Network error: connection refused");
    }
}
