//! Response envelope returned to callers

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};

use super::classifier::ApiError;
use super::token::CacheStatus;

/// Where the returned payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Metadata describing how a response was obtained
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetadata {
    pub status: CacheStatus,
    pub source: ResponseSource,
    /// When the returned payload was written to the store, if it was
    pub cached_at: Option<DateTime<Utc>>,
    /// Failure of the refresh attempt, when a stale entry was served instead
    pub error: Option<ApiError>,
    #[serde(serialize_with = "serialize_millis")]
    pub call_duration: Duration,
}

/// A typed payload with its cache metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

impl<T> Response<T> {
    /// Whether the payload was served from the store
    pub fn is_from_cache(&self) -> bool {
        self.metadata.source == ResponseSource::Cache
    }

    /// Whether the payload is an expired entry served after a failed refresh
    pub fn is_stale(&self) -> bool {
        self.metadata.status == CacheStatus::Stale
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(duration.num_milliseconds())
}
