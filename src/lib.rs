//! Staleguard
//!
//! A transparent cache for network calls. Each request is identified by a
//! token derived from its shape; fresh stored responses are served without a
//! network call, expired ones are refreshed, and a failed refresh falls back
//! to the expired entry when the failure is a network or server fault.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod network;

pub use cache::{
    ApiError, CacheInterceptor, CacheManager, CacheMetadata, CacheStatus, CacheToken, CallOptions,
    ErrorKind, FetchError, RequestMode, Response, ResponseSource,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ConfigError};
pub use network::{HttpPipeline, RawFailure, Request, RequestPipeline};
