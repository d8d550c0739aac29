//! Cache manager deciding between stored and fresh responses
//!
//! Given a token and a way to fetch a fresh result, the `CacheManager`
//! reconciles the stored entry, the network outcome and the failure
//! classification into a single `Response` or a typed `FetchError`.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn, Dispatch};

use super::classifier::{classify, ApiError};
use super::response::{CacheMetadata, Response, ResponseSource};
use super::serialization::SerializationManager;
use super::store::{CacheEntry, CacheStore, StoreError};
use super::token::{response_type_name, CacheStatus, CacheToken, RequestMode};
use crate::clock::Clock;
use crate::network::RawFailure;

/// Terminal failure of a cached call
#[derive(Debug, Error)]
pub enum FetchError {
    /// The refresh failed and no usable stored entry could stand in
    #[error("Could not refresh: {0}")]
    CouldNotRefresh(ApiError),

    /// A request that opted out of caching failed
    #[error("Request failed: {0}")]
    NotCached(ApiError),

    /// The host cancelled the network call
    #[error("Request cancelled")]
    Cancelled,

    /// An offline request found no usable stored entry
    #[error("No cached response available offline")]
    OfflineMiss,
}

impl FetchError {
    /// Status the token resolved to, if the call got that far
    pub fn status(&self) -> Option<CacheStatus> {
        match self {
            FetchError::CouldNotRefresh(_) => Some(CacheStatus::CouldNotRefresh),
            FetchError::NotCached(_) => Some(CacheStatus::DoNotCache),
            FetchError::Cancelled | FetchError::OfflineMiss => None,
        }
    }

    /// The classified failure, if any
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            FetchError::CouldNotRefresh(e) | FetchError::NotCached(e) => Some(e),
            FetchError::Cancelled | FetchError::OfflineMiss => None,
        }
    }
}

/// Orchestrates store lookups, network refreshes and stale fallback
///
/// Holds no mutable state of its own beyond the store, so it is cheap to
/// clone and share between tasks.
#[derive(Debug, Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    serializer: SerializationManager,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    /// Receives the manager's log events; `None` uses the global dispatcher
    logger: Option<Dispatch>,
}

impl CacheManager {
    /// Creates a manager over an existing store
    ///
    /// Prefer `CacheConfig::build` or `CacheConfig::build_with_store`, which
    /// validate the settings first.
    pub fn new(
        store: Arc<dyn CacheStore>,
        serializer: SerializationManager,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            store,
            serializer,
            clock,
            default_ttl,
            logger: None,
        }
    }

    /// Routes this manager's log events to `logger` instead of the global dispatcher
    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = Some(logger);
        self
    }

    /// TTL applied to tokens without an override
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Runs `f` with the configured logger as the default dispatcher
    fn scoped<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.logger {
            Some(logger) => tracing::dispatcher::with_default(logger, f),
            None => f(),
        }
    }

    /// Resolves a request against the cache
    ///
    /// # Arguments
    /// * `token` - The request token; its status is set once resolved
    /// * `fetch` - Produces the network call; invoked at most once
    ///
    /// # Returns
    /// * `Ok(Response)` - Fresh, refreshed, or stale-fallback payload with metadata
    /// * `Err(FetchError)` - No usable network result and no usable stored entry
    ///
    /// # Behavior
    /// - `Cache` mode: a stored entry younger than the TTL is returned without
    ///   calling `fetch`; otherwise the network is called and the result stored
    /// - `Refresh` mode: the network is always called; stale fallback still applies
    /// - `DoNotCache` mode: the store is never read or written
    /// - `Offline` mode: the stored entry is returned whatever its age and
    ///   `fetch` is never called
    /// - Fresh-only tokens never receive an expired entry
    /// - Store read failures and undecodable entries count as a miss; store
    ///   write failures are logged and the fresh payload is still returned
    /// - Nothing is written if the network call is cancelled, whether reported
    ///   as `RawFailure::Cancelled` or by dropping the returned future
    pub async fn resolve<T, F, Fut>(
        &self,
        token: &mut CacheToken,
        fetch: F,
    ) -> Result<Response<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        match &self.logger {
            Some(logger) => {
                self.resolve_token(token, fetch)
                    .with_subscriber(logger.clone())
                    .await
            }
            None => self.resolve_token(token, fetch).await,
        }
    }

    async fn resolve_token<T, F, Fut>(
        &self,
        token: &mut CacheToken,
        fetch: F,
    ) -> Result<Response<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        let started = self.clock.now();

        match token.mode() {
            RequestMode::DoNotCache => self.fetch_uncached(token, fetch, started).await,
            RequestMode::Refresh => {
                let previous = self.lookup(token);
                debug!(key = %token.identity_key(), url = %token.url(), "Forced refresh");
                self.refresh(token, fetch, previous, CacheStatus::ForceRefresh, started)
                    .await
            }
            RequestMode::Offline => self.resolve_offline(token, started),
            RequestMode::Cache => {
                let previous = self.lookup(token);

                if let Some(entry) = &previous {
                    if self.is_fresh(token, entry, started) {
                        if let Some(data) = self.decode(token, entry) {
                            debug!(key = %token.identity_key(), url = %token.url(), "Cache hit");
                            token.resolve(CacheStatus::Fresh);
                            return Ok(self.envelope(
                                data,
                                CacheStatus::Fresh,
                                ResponseSource::Cache,
                                Some(entry.cached_at),
                                None,
                                started,
                            ));
                        }
                        return self
                            .refresh(token, fetch, None, CacheStatus::Fresh, started)
                            .await;
                    }
                    debug!(key = %token.identity_key(), url = %token.url(), "Cache entry expired");
                } else {
                    debug!(key = %token.identity_key(), url = %token.url(), "Cache miss");
                }

                self.refresh(token, fetch, previous, CacheStatus::Fresh, started)
                    .await
            }
        }
    }

    /// Serves the stored entry without touching the network
    fn resolve_offline<T: DeserializeOwned>(
        &self,
        token: &mut CacheToken,
        started: DateTime<Utc>,
    ) -> Result<Response<T>, FetchError> {
        if let Some(entry) = self.lookup(token) {
            let fresh = self.is_fresh(token, &entry, started);
            if fresh || !token.fresh_only() {
                if let Some(data) = self.decode(token, &entry) {
                    let status = if fresh {
                        CacheStatus::Fresh
                    } else {
                        CacheStatus::Stale
                    };
                    debug!(key = %token.identity_key(), ?status, "Offline cache hit");
                    token.resolve(status);
                    return Ok(self.envelope(
                        data,
                        status,
                        ResponseSource::Cache,
                        Some(entry.cached_at),
                        None,
                        started,
                    ));
                }
            }
        }

        debug!(key = %token.identity_key(), url = %token.url(), "No usable entry offline");
        Err(FetchError::OfflineMiss)
    }

    /// Whether `entry` is younger than the token's TTL at `now`
    fn is_fresh(&self, token: &CacheToken, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.cached_at < token.ttl().unwrap_or(self.default_ttl)
    }

    /// Calls the network and reconciles the outcome with the previous entry
    async fn refresh<T, F, Fut>(
        &self,
        token: &mut CacheToken,
        fetch: F,
        previous: Option<CacheEntry>,
        success_status: CacheStatus,
        started: DateTime<Utc>,
    ) -> Result<Response<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        match fetch().await {
            Ok(data) => {
                let now = self.clock.now();
                let cached_at = self.store_response(token, &data, now).then_some(now);
                token.resolve(success_status);
                Ok(self.envelope(
                    data,
                    success_status,
                    ResponseSource::Network,
                    cached_at,
                    None,
                    started,
                ))
            }
            Err(RawFailure::Cancelled) => {
                debug!(key = %token.identity_key(), "Refresh cancelled");
                Err(FetchError::Cancelled)
            }
            Err(failure) => {
                let error = classify(&failure);

                if error.allows_stale_fallback() && !token.fresh_only() {
                    if let Some(entry) = previous {
                        if let Some(data) = self.decode(token, &entry) {
                            warn!(
                                key = %token.identity_key(),
                                url = %token.url(),
                                error = %error,
                                "Refresh failed, serving stale entry"
                            );
                            token.resolve(CacheStatus::Stale);
                            return Ok(self.envelope(
                                data,
                                CacheStatus::Stale,
                                ResponseSource::Cache,
                                Some(entry.cached_at),
                                Some(error),
                                started,
                            ));
                        }
                    }
                }

                warn!(
                    key = %token.identity_key(),
                    url = %token.url(),
                    error = %error,
                    "Refresh failed with no usable cached entry"
                );
                token.resolve(CacheStatus::CouldNotRefresh);
                Err(FetchError::CouldNotRefresh(error))
            }
        }
    }

    async fn fetch_uncached<T, F, Fut>(
        &self,
        token: &mut CacheToken,
        fetch: F,
        started: DateTime<Utc>,
    ) -> Result<Response<T>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RawFailure>>,
    {
        match fetch().await {
            Ok(data) => {
                token.resolve(CacheStatus::DoNotCache);
                Ok(self.envelope(
                    data,
                    CacheStatus::DoNotCache,
                    ResponseSource::Network,
                    None,
                    None,
                    started,
                ))
            }
            Err(RawFailure::Cancelled) => Err(FetchError::Cancelled),
            Err(failure) => {
                token.resolve(CacheStatus::DoNotCache);
                Err(FetchError::NotCached(classify(&failure)))
            }
        }
    }

    /// Reads the stored entry, treating store failures as a miss
    fn lookup(&self, token: &CacheToken) -> Option<CacheEntry> {
        match self.store.get(token.identity_key()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %token.identity_key(), error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Decodes a stored entry, treating corrupt or mismatched data as a miss
    fn decode<T: DeserializeOwned>(&self, token: &CacheToken, entry: &CacheEntry) -> Option<T> {
        match self.serializer.deserialize_tagged(
            &entry.payload,
            &entry.response_type,
            token.response_type(),
        ) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(key = %token.identity_key(), error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Writes a fresh payload; returns whether it was stored
    fn store_response<T: Serialize>(&self, token: &CacheToken, data: &T, now: DateTime<Utc>) -> bool {
        let payload = match self.serializer.serialize(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %token.identity_key(), error = %e, "Response not cached");
                return false;
            }
        };

        let entry = CacheEntry {
            identity_key: token.identity_key().to_string(),
            response_type: token.response_type().to_string(),
            payload,
            cached_at: now,
        };

        match self.store.put(entry) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %token.identity_key(), error = %e, "Cache write failed");
                false
            }
        }
    }

    fn envelope<T>(
        &self,
        data: T,
        status: CacheStatus,
        source: ResponseSource,
        cached_at: Option<DateTime<Utc>>,
        error: Option<ApiError>,
        started: DateTime<Utc>,
    ) -> Response<T> {
        Response {
            data,
            metadata: CacheMetadata {
                status,
                source,
                cached_at,
                error,
                call_duration: self.clock.now() - started,
            },
        }
    }

    /// Deletes entries written `max_age` or longer ago
    pub fn clear_older_entries(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.scoped(|| {
            let removed = self.store.evict_older_than(max_age, self.clock.now())?;
            info!(removed, "Cleared old cache entries");
            Ok(removed)
        })
    }

    /// Deletes every entry stored for response type `T`
    pub fn clear_type<T>(&self) -> Result<usize, StoreError> {
        self.clear_tag(response_type_name::<T>())
    }

    /// Deletes every entry stored under an explicit type tag
    pub fn clear_tag(&self, tag: &str) -> Result<usize, StoreError> {
        self.scoped(|| self.store.clear_type(tag))
    }

    /// Expires every entry stored for response type `T`
    ///
    /// The next request for each entry refreshes it, and the old payload is
    /// still available as stale fallback.
    pub fn invalidate_type<T>(&self) -> Result<usize, StoreError> {
        self.invalidate_tag(response_type_name::<T>())
    }

    /// Expires every entry stored under an explicit type tag
    pub fn invalidate_tag(&self, tag: &str) -> Result<usize, StoreError> {
        self.scoped(|| {
            let expired = self.store.expire_type(tag)?;
            info!(expired, tag, "Invalidated cache entries");
            Ok(expired)
        })
    }

    /// Deletes the entry for one token
    pub fn clear(&self, token: &CacheToken) -> Result<bool, StoreError> {
        self.scoped(|| self.store.clear(token.identity_key()))
    }

    /// Deletes every entry
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        self.scoped(|| {
            let removed = self.store.clear_all()?;
            info!(removed, "Cleared all cache entries");
            Ok(removed)
        })
    }

    /// Number of stored entries
    pub fn entry_count(&self) -> Result<usize, StoreError> {
        self.scoped(|| self.store.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::cache::ErrorKind;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde::Deserialize;
    use std::cell::Cell;
    use std::io;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Joke {
        id: u32,
        setup: String,
    }

    /// Store whose operations always fail
    #[derive(Debug)]
    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _: &str) -> Result<Option<CacheEntry>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn put(&self, _: CacheEntry) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn evict_older_than(&self, _: Duration, _: DateTime<Utc>) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn clear(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn clear_type(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn expire_type(&self, _: &str) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn clear_all(&self) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn len(&self) -> Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap()
    }

    fn create_manager(store: Arc<dyn CacheStore>) -> (CacheManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let manager = CacheManager::new(
            store,
            SerializationManager::default(),
            clock.clone(),
            Duration::minutes(5),
        );
        (manager, clock)
    }

    fn token() -> CacheToken {
        CacheToken::new_request::<Joke, _, _, _>(
            "https://api.example.com/joke",
            [("lang", "en")],
            None,
            None,
        )
    }

    fn joke(id: u32) -> Joke {
        Joke {
            id,
            setup: format!("joke #{}", id),
        }
    }

    fn network_down() -> RawFailure {
        RawFailure::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());
        let mut token = token();

        let response = manager
            .resolve(&mut token, || async { Ok(joke(1)) })
            .await
            .expect("Miss should fetch");

        assert_eq!(response.data, joke(1));
        assert_eq!(response.metadata.status, CacheStatus::Fresh);
        assert_eq!(response.metadata.source, ResponseSource::Network);
        assert_eq!(response.metadata.cached_at, Some(start()));
        assert_eq!(token.status(), Some(CacheStatus::Fresh));
        assert_eq!(store.len().expect("Len should succeed"), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_network() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(4));

        let calls = Cell::new(0);
        let response = manager
            .resolve(&mut token(), || {
                calls.set(calls.get() + 1);
                async { Ok(joke(2)) }
            })
            .await
            .expect("Second call should hit");

        assert_eq!(calls.get(), 0);
        assert_eq!(response.data, joke(1));
        assert_eq!(response.metadata.source, ResponseSource::Cache);
        assert_eq!(response.metadata.cached_at, Some(start()));
    }

    #[tokio::test]
    async fn test_ttl_override_shortens_freshness() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(2));

        let mut short = CacheToken::new_request::<Joke, _, _, _>(
            "https://api.example.com/joke",
            [("lang", "en")],
            None,
            Some(Duration::minutes(1)),
        );
        let response = manager
            .resolve(&mut short, || async { Ok(joke(2)) })
            .await
            .expect("Expired entry should refresh");

        assert_eq!(response.data, joke(2));
        assert_eq!(response.metadata.cached_at, Some(start() + Duration::minutes(2)));
    }

    #[tokio::test]
    async fn test_entry_at_exact_ttl_is_stale() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(5));

        let response = manager
            .resolve(&mut token(), || async { Ok(joke(2)) })
            .await
            .expect("Refresh should succeed");

        assert_eq!(response.data, joke(2));
        assert_eq!(response.metadata.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_network_failure_serves_stale_entry() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(6));

        let mut stale_token = token();
        let response = manager
            .resolve(&mut stale_token, || async { Err::<Joke, _>(network_down()) })
            .await
            .expect("Stale fallback expected");

        assert_eq!(response.data, joke(1));
        assert_eq!(response.metadata.status, CacheStatus::Stale);
        assert_eq!(response.metadata.cached_at, Some(start()));
        assert_eq!(
            response.metadata.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Network)
        );
        assert_eq!(stale_token.status(), Some(CacheStatus::Stale));
    }

    #[tokio::test]
    async fn test_unknown_failure_does_not_fall_back() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(6));

        let mut failing = token();
        let result = manager
            .resolve(&mut failing, || async {
                Err::<Joke, _>(RawFailure::Other("unexpected".into()))
            })
            .await;

        match result {
            Err(FetchError::CouldNotRefresh(error)) => assert_eq!(error.kind, ErrorKind::Unknown),
            other => panic!("Expected CouldNotRefresh, got {:?}", other),
        }
        assert_eq!(failing.status(), Some(CacheStatus::CouldNotRefresh));
    }

    #[tokio::test]
    async fn test_failure_without_entry_is_could_not_refresh() {
        let (manager, _clock) = create_manager(Arc::new(MemoryStore::new()));

        let result = manager
            .resolve(&mut token(), || async { Err::<Joke, _>(network_down()) })
            .await;

        let error = result.expect_err("No fallback available");
        assert_eq!(error.status(), Some(CacheStatus::CouldNotRefresh));
        assert_eq!(error.api_error().map(|e| e.kind), Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_entry() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::seconds(10));

        let mut refresh = token().with_mode(RequestMode::Refresh);
        let response = manager
            .resolve(&mut refresh, || async { Ok(joke(2)) })
            .await
            .expect("Refresh should succeed");

        assert_eq!(response.data, joke(2));
        assert_eq!(response.metadata.status, CacheStatus::ForceRefresh);
        assert_eq!(refresh.status(), Some(CacheStatus::ForceRefresh));
    }

    #[tokio::test]
    async fn test_force_refresh_failure_falls_back_to_fresh_entry() {
        let (manager, _clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");

        let mut refresh = token().with_mode(RequestMode::Refresh);
        let response = manager
            .resolve(&mut refresh, || async {
                Err::<Joke, _>(RawFailure::Status {
                    status: 502,
                    body: String::new(),
                })
            })
            .await
            .expect("Server errors allow fallback");

        assert_eq!(response.data, joke(1));
        assert_eq!(response.metadata.status, CacheStatus::Stale);
        assert_eq!(
            response.metadata.error.as_ref().and_then(|e| e.http_status),
            Some(502)
        );
    }

    #[tokio::test]
    async fn test_do_not_cache_never_touches_store() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());

        let mut uncached = token().with_mode(RequestMode::DoNotCache);
        let response = manager
            .resolve(&mut uncached, || async { Ok(joke(1)) })
            .await
            .expect("Uncached call should succeed");

        assert_eq!(response.metadata.status, CacheStatus::DoNotCache);
        assert_eq!(response.metadata.cached_at, None);
        assert_eq!(store.len().expect("Len should succeed"), 0);

        let mut failing = token().with_mode(RequestMode::DoNotCache);
        let result = manager
            .resolve(&mut failing, || async { Err::<Joke, _>(network_down()) })
            .await;
        assert!(matches!(result, Err(FetchError::NotCached(_))));
        assert_eq!(store.len().expect("Len should succeed"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());

        let mut cancelled = token();
        let result = manager
            .resolve(&mut cancelled, || async { Err::<Joke, _>(RawFailure::Cancelled) })
            .await;

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(cancelled.status(), None);
        assert_eq!(store.len().expect("Len should succeed"), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_treated_as_miss() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());
        let token_for_key = token();
        store
            .put(CacheEntry {
                identity_key: token_for_key.identity_key().to_string(),
                response_type: token_for_key.response_type().to_string(),
                payload: b"{\"id\":".to_vec(),
                cached_at: start(),
            })
            .expect("Put should succeed");

        let response = manager
            .resolve(&mut token(), || async { Ok(joke(3)) })
            .await
            .expect("Corrupt entry should be refetched");

        assert_eq!(response.data, joke(3));
        assert_eq!(response.metadata.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_not_used_as_fallback() {
        let store = Arc::new(MemoryStore::new());
        let (manager, clock) = create_manager(store.clone());
        let token_for_key = token();
        store
            .put(CacheEntry {
                identity_key: token_for_key.identity_key().to_string(),
                response_type: "some::OtherType".to_string(),
                payload: b"{}".to_vec(),
                cached_at: start(),
            })
            .expect("Put should succeed");
        clock.advance(Duration::minutes(10));

        let result = manager
            .resolve(&mut token(), || async { Err::<Joke, _>(network_down()) })
            .await;

        assert!(matches!(result, Err(FetchError::CouldNotRefresh(_))));
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_network() {
        let (manager, _clock) = create_manager(Arc::new(BrokenStore));

        let response = manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("Store faults must not fail the call");

        assert_eq!(response.data, joke(1));
        assert_eq!(response.metadata.status, CacheStatus::Fresh);
        assert_eq!(response.metadata.cached_at, None);
    }

    #[tokio::test]
    async fn test_call_duration_uses_injected_clock() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));

        let response = manager
            .resolve(&mut token(), || {
                let clock = clock.clone();
                async move {
                    clock.advance(Duration::milliseconds(250));
                    Ok(joke(1))
                }
            })
            .await
            .expect("Fetch should succeed");

        assert_eq!(response.metadata.call_duration, Duration::milliseconds(250));
    }

    #[test]
    fn test_clear_older_entries_zero_empties_store() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());
        for key in ["a", "b"] {
            store
                .put(CacheEntry {
                    identity_key: key.to_string(),
                    response_type: response_type_name::<Joke>().to_string(),
                    payload: b"{}".to_vec(),
                    cached_at: start(),
                })
                .expect("Put should succeed");
        }

        let removed = manager
            .clear_older_entries(Duration::zero())
            .expect("Clear should succeed");

        assert_eq!(removed, 2);
        assert_eq!(manager.entry_count().expect("Count should succeed"), 0);
        assert!(store.get("a").expect("Get should succeed").is_none());
    }

    #[test]
    fn test_clear_older_entries_with_huge_age_removes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());
        store
            .put(CacheEntry {
                identity_key: "a".to_string(),
                response_type: response_type_name::<Joke>().to_string(),
                payload: b"{}".to_vec(),
                cached_at: start(),
            })
            .expect("Put should succeed");

        let removed = manager
            .clear_older_entries(Duration::seconds(i64::MAX / 1000))
            .expect("Clear should succeed");

        assert_eq!(removed, 0);
        assert_eq!(manager.entry_count().expect("Store should still be usable"), 1);
    }

    #[tokio::test]
    async fn test_offline_serves_expired_entry_without_network() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::hours(3));
        let called = Cell::new(false);

        let mut offline = token().with_mode(RequestMode::Offline);
        let response = manager
            .resolve(&mut offline, || {
                called.set(true);
                async { Ok(joke(2)) }
            })
            .await
            .expect("Offline should serve the stored entry");

        assert!(!called.get(), "Offline mode must not call the network");
        assert_eq!(response.data, joke(1));
        assert_eq!(response.metadata.status, CacheStatus::Stale);
        assert_eq!(response.metadata.source, ResponseSource::Cache);
        assert_eq!(offline.status(), Some(CacheStatus::Stale));
    }

    #[tokio::test]
    async fn test_offline_fresh_entry_and_miss() {
        let (manager, _clock) = create_manager(Arc::new(MemoryStore::new()));

        let mut missing = token().with_mode(RequestMode::Offline);
        let result = manager
            .resolve(&mut missing, || async { Ok(joke(1)) })
            .await;
        assert!(matches!(result, Err(FetchError::OfflineMiss)));
        assert_eq!(missing.status(), None);
        assert_eq!(manager.entry_count().expect("Count should succeed"), 0);

        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("Fetch should succeed");
        let response = manager
            .resolve(&mut token().with_mode(RequestMode::Offline), || async {
                Ok(joke(2))
            })
            .await
            .expect("Offline should serve the stored entry");
        assert_eq!(response.metadata.status, CacheStatus::Fresh);
    }

    #[tokio::test]
    async fn test_fresh_only_offline_refuses_expired_entry() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(6));

        let mut offline = token()
            .with_mode(RequestMode::Offline)
            .with_fresh_only(true);
        let result = manager
            .resolve(&mut offline, || async { Ok(joke(2)) })
            .await;

        assert!(matches!(result, Err(FetchError::OfflineMiss)));
    }

    #[tokio::test]
    async fn test_fresh_only_suppresses_stale_fallback() {
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(6));

        let mut strict = token().with_fresh_only(true);
        let result = manager
            .resolve(&mut strict, || async { Err::<Joke, _>(network_down()) })
            .await;

        match result {
            Err(FetchError::CouldNotRefresh(error)) => assert_eq!(error.kind, ErrorKind::Network),
            other => panic!("Expected CouldNotRefresh, got {:?}", other),
        }
        assert_eq!(strict.status(), Some(CacheStatus::CouldNotRefresh));
    }

    #[tokio::test]
    async fn test_invalidate_type_forces_refresh_but_keeps_fallback() {
        let (manager, _clock) = create_manager(Arc::new(MemoryStore::new()));
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");

        assert_eq!(manager.invalidate_type::<Joke>().expect("Invalidate should succeed"), 1);

        let refreshed = manager
            .resolve(&mut token(), || async { Ok(joke(2)) })
            .await
            .expect("Invalidated entry should refresh");
        assert_eq!(refreshed.data, joke(2));
        assert_eq!(refreshed.metadata.source, ResponseSource::Network);

        manager.invalidate_type::<Joke>().expect("Invalidate should succeed");
        let stale = manager
            .resolve(&mut token(), || async { Err::<Joke, _>(network_down()) })
            .await
            .expect("Invalidated entry is still a fallback");
        assert_eq!(stale.data, joke(2));
        assert_eq!(stale.metadata.status, CacheStatus::Stale);
    }

    #[tokio::test]
    async fn test_explicit_type_tag_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _clock) = create_manager(store.clone());
        let tagged = || token().with_response_type("joke.v1");

        manager
            .resolve(&mut tagged(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        let stored = store
            .get(tagged().identity_key())
            .expect("Get should succeed")
            .expect("Entry should exist");
        assert_eq!(stored.response_type, "joke.v1");

        let hit = manager
            .resolve(&mut tagged(), || async { Ok(joke(2)) })
            .await
            .expect("Tagged entry should hit");
        assert_eq!(hit.data, joke(1));

        assert_eq!(manager.clear_tag("joke.v1").expect("Clear should succeed"), 1);
    }

    /// Log sink collecting formatted output in memory
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("Log lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("Log lock")).to_string()
        }
    }

    fn capturing_logger() -> (Dispatch, CapturedLogs) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (Dispatch::new(subscriber), logs)
    }

    #[tokio::test]
    async fn test_stale_fallback_warning_reaches_configured_logger() {
        let (logger, logs) = capturing_logger();
        let (manager, clock) = create_manager(Arc::new(MemoryStore::new()));
        let manager = manager.with_logger(logger);
        manager
            .resolve(&mut token(), || async { Ok(joke(1)) })
            .await
            .expect("First call should fetch");
        clock.advance(Duration::minutes(6));

        manager
            .resolve(&mut token(), || async { Err::<Joke, _>(network_down()) })
            .await
            .expect("Stale fallback expected");
        manager.clear_all().expect("Clear should succeed");

        let output = logs.contents();
        assert!(output.contains("Refresh failed, serving stale entry"), "{}", output);
        assert!(output.contains("Cleared all cache entries"), "{}", output);
    }
}
