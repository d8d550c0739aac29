//! Response cache with TTL expiry and stale fallback
//!
//! This module provides the pieces of the cache: request tokens, payload
//! serialization, the persistent store, failure classification, and the
//! manager and interceptor that tie them together. Expired entries are kept
//! so that they can stand in for a refresh that fails for network or server
//! reasons.

mod classifier;
mod file_store;
mod interceptor;
mod manager;
mod response;
mod row;
mod serialization;
mod store;
mod token;

pub use classifier::{classify, ApiError, ErrorKind};
pub use file_store::{FileStore, APP_NAME};
pub use interceptor::{CacheInterceptor, CallOptions};
pub use manager::{CacheManager, FetchError};
pub use response::{CacheMetadata, Response, ResponseSource};
pub use row::{Row, StorableValue};
pub use serialization::{JsonCodec, PayloadCodec, SerializationError, SerializationManager};
pub use store::{CacheEntry, CacheStore, MemoryStore, StoreError};
pub use token::{response_type_name, CacheStatus, CacheToken, RequestMode};
