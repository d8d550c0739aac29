//! Request identity and lifecycle status
//!
//! A `CacheToken` is built once per logical request. Its identity key is a
//! SHA-256 digest over the URL, the sorted parameter set and the optional body,
//! so two requests that differ only in parameter order share a cache entry.

use chrono::Duration;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Resolved lifecycle status of a cached request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    /// Served from a stored entry younger than its TTL, or freshly fetched
    Fresh,
    /// Served from an expired entry because the refresh failed
    Stale,
    /// The request opted out of caching entirely
    DoNotCache,
    /// The caller bypassed the freshness check and the refresh succeeded
    ForceRefresh,
    /// The refresh failed and no usable stored entry existed
    CouldNotRefresh,
}

/// How the caller wants the cache to treat a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Serve fresh entries from the store, refresh stale or missing ones
    #[default]
    Cache,
    /// Skip the freshness check and always refresh, keeping stale fallback
    Refresh,
    /// Never read or write the store
    DoNotCache,
    /// Serve whatever is stored regardless of age, never call the network
    Offline,
}

/// Identifies a cacheable request and carries its resolved status
#[derive(Debug, Clone)]
pub struct CacheToken {
    response_type: String,
    identity_key: String,
    url: String,
    mode: RequestMode,
    ttl: Option<Duration>,
    fresh_only: bool,
    status: Option<CacheStatus>,
}

impl CacheToken {
    /// Creates a token for a request expecting a response of type `T`
    ///
    /// # Arguments
    /// * `url` - The request URL, without query parameters
    /// * `params` - Query parameters, in any order
    /// * `body` - Optional request body
    /// * `ttl` - Per-request TTL override; `None` uses the configured default
    pub fn new_request<T, I, K, V>(
        url: &str,
        params: I,
        body: Option<&str>,
        ttl: Option<Duration>,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params = canonical_params(params);
        Self {
            response_type: response_type_name::<T>().to_string(),
            identity_key: identity_key(url, &params, body),
            url: url.to_string(),
            mode: RequestMode::Cache,
            ttl,
            fresh_only: false,
            status: None,
        }
    }

    /// Sets the request mode
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Refuses expired entries, both as stale fallback and in offline mode
    pub fn with_fresh_only(mut self, fresh_only: bool) -> Self {
        self.fresh_only = fresh_only;
        self
    }

    /// Replaces the derived response type name with an explicit tag
    ///
    /// Entries are written and checked against this tag instead of the
    /// compiler-generated type name, so they stay readable across toolchain
    /// upgrades.
    pub fn with_response_type(mut self, tag: impl Into<String>) -> Self {
        self.response_type = tag.into();
        self
    }

    /// Name of the expected response type
    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    /// Store key derived from the request shape
    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    /// Request URL this token was built from
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    /// Per-request TTL override, if any
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn fresh_only(&self) -> bool {
        self.fresh_only
    }

    /// Resolved status, `None` until the cache manager has decided
    pub fn status(&self) -> Option<CacheStatus> {
        self.status
    }

    /// Records the outcome of the request
    ///
    /// A token resolves exactly once; later calls are ignored.
    pub(crate) fn resolve(&mut self, status: CacheStatus) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }
}

/// Default tag recorded with stored entries to identify their response shape
///
/// This is `std::any::type_name`, whose output may change between compiler
/// versions. Entries written by a different toolchain then fail the type
/// check and are refetched. Use `CacheToken::with_response_type` for a tag
/// that must survive upgrades.
pub fn response_type_name<T>() -> &'static str {
    std::any::type_name::<T>()
}

/// Sorts parameters so that insertion order never affects the key
fn canonical_params<I, K, V>(params: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    params.sort();
    params
}

/// Hashes the request shape into a hex-encoded key
///
/// Every field is length-prefixed so adjacent fields cannot run together,
/// and an absent body is distinct from an empty one.
fn identity_key(url: &str, params: &[(String, String)], body: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, url.as_bytes());

    hasher.update((params.len() as u64).to_le_bytes());
    for (key, value) in params {
        write_field(&mut hasher, key.as_bytes());
        write_field(&mut hasher, value.as_bytes());
    }

    match body {
        Some(body) => {
            hasher.update([1u8]);
            write_field(&mut hasher, body.as_bytes());
        }
        None => hasher.update([0u8]),
    }

    format!("{:x}", hasher.finalize())
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
