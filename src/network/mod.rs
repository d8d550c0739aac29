//! Network collaborator seam
//!
//! The cache does not issue requests itself. It is handed a `RequestPipeline`
//! that turns a `Request` into either a typed response or a `RawFailure`.

pub mod http;

pub use http::HttpPipeline;

use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// Description of an outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Request {
    /// Creates a GET request with no parameters
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            params: Vec::new(),
            body: None,
        }
    }

    /// Creates a POST request carrying a JSON body
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            params: Vec::new(),
            body: Some(body.into()),
        }
    }

    /// Appends a query parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// Failure reported by the network collaborator, before classification
#[derive(Debug)]
pub enum RawFailure {
    /// The server answered with a non-success status
    Status { status: u16, body: String },
    /// The host cancelled the call
    Cancelled,
    /// Any other failure
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFailure::Status { status, body } if body.is_empty() => {
                write!(f, "HTTP status {}", status)
            }
            RawFailure::Status { status, body } => write!(f, "HTTP status {}: {}", status, body),
            RawFailure::Cancelled => write!(f, "request cancelled"),
            RawFailure::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RawFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RawFailure::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RawFailure {
    fn from(e: reqwest::Error) -> Self {
        RawFailure::Other(Box::new(e))
    }
}

impl From<std::io::Error> for RawFailure {
    fn from(e: std::io::Error) -> Self {
        RawFailure::Other(Box::new(e))
    }
}

impl From<serde_json::Error> for RawFailure {
    fn from(e: serde_json::Error) -> Self {
        RawFailure::Other(Box::new(e))
    }
}

/// Something able to execute a request and decode its response
///
/// Retries, if any, are the pipeline's concern.
pub trait RequestPipeline: Send + Sync {
    fn execute<T>(&self, request: &Request) -> impl Future<Output = Result<T, RawFailure>> + Send
    where
        T: DeserializeOwned + Send;
}

impl<P: RequestPipeline> RequestPipeline for Arc<P> {
    fn execute<T>(&self, request: &Request) -> impl Future<Output = Result<T, RawFailure>> + Send
    where
        T: DeserializeOwned + Send,
    {
        (**self).execute(request)
    }
}
