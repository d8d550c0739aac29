//! Routes every request of a pipeline through the cache manager

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};

use super::manager::{CacheManager, FetchError};
use super::response::Response;
use super::store::StoreError;
use super::token::{CacheToken, RequestMode};
use crate::network::{Request, RequestPipeline};

/// Per-call cache options
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub mode: RequestMode,
    /// Overrides the configured default TTL for this call
    pub ttl: Option<Duration>,
    /// Never return an expired entry, even as fallback
    pub fresh_only: bool,
    /// Explicit type tag for stored entries; `None` uses the type name
    pub type_tag: Option<&'static str>,
}

impl CallOptions {
    fn with_mode(mode: RequestMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn refresh() -> Self {
        Self::with_mode(RequestMode::Refresh)
    }

    pub fn do_not_cache() -> Self {
        Self::with_mode(RequestMode::DoNotCache)
    }

    pub fn offline() -> Self {
        Self::with_mode(RequestMode::Offline)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn fresh_only(mut self) -> Self {
        self.fresh_only = true;
        self
    }

    pub fn with_type_tag(mut self, tag: &'static str) -> Self {
        self.type_tag = Some(tag);
        self
    }
}

/// Wraps a request pipeline so that every call goes through the cache
#[derive(Debug, Clone)]
pub struct CacheInterceptor<P> {
    pipeline: P,
    manager: CacheManager,
}

impl<P: RequestPipeline> CacheInterceptor<P> {
    pub fn new(pipeline: P, manager: CacheManager) -> Self {
        Self { pipeline, manager }
    }

    /// Executes a request with default cache options
    pub async fn get<T>(&self, request: &Request) -> Result<Response<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        self.call(request, CallOptions::default()).await
    }

    /// Executes a request, bypassing the freshness check
    pub async fn refresh<T>(&self, request: &Request) -> Result<Response<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        self.call(request, CallOptions::refresh()).await
    }

    /// Executes a request through the cache
    ///
    /// Builds the token from the request shape, then lets the manager decide
    /// whether the pipeline needs to be called.
    pub async fn call<T>(
        &self,
        request: &Request,
        options: CallOptions,
    ) -> Result<Response<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let mut token = CacheToken::new_request::<T, _, _, _>(
            &request.url,
            request.params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            request.body.as_deref(),
            options.ttl,
        )
        .with_mode(options.mode)
        .with_fresh_only(options.fresh_only);
        if let Some(tag) = options.type_tag {
            token = token.with_response_type(tag);
        }

        self.manager
            .resolve(&mut token, || self.pipeline.execute::<T>(request))
            .await
    }

    /// Deletes entries written `max_age` or longer ago
    pub fn clear_older_entries(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.manager.clear_older_entries(max_age)
    }

    /// Deletes every entry stored for response type `T`
    pub fn clear_type<T>(&self) -> Result<usize, StoreError> {
        self.manager.clear_type::<T>()
    }

    /// Expires every entry stored for response type `T` so it is refreshed next
    pub fn invalidate_type<T>(&self) -> Result<usize, StoreError> {
        self.manager.invalidate_type::<T>()
    }

    /// Expires every entry stored under an explicit type tag
    pub fn invalidate_tag(&self, tag: &str) -> Result<usize, StoreError> {
        self.manager.invalidate_tag(tag)
    }

    /// Deletes every entry stored under an explicit type tag
    pub fn clear_tag(&self, tag: &str) -> Result<usize, StoreError> {
        self.manager.clear_tag(tag)
    }

    /// Deletes every entry
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        self.manager.clear_all()
    }

    /// Number of stored entries
    pub fn entry_count(&self) -> Result<usize, StoreError> {
        self.manager.entry_count()
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }
}
