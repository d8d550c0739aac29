//! Cache construction settings
//!
//! `CacheConfig` names every recognised option with a default. A single
//! validating step turns it into a ready `CacheManager` or `CacheInterceptor`.

use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, Dispatch};

use crate::cache::{
    CacheInterceptor, CacheManager, CacheStore, FileStore, JsonCodec, PayloadCodec,
    SerializationManager,
};
use crate::clock::{Clock, SystemClock};
use crate::network::RequestPipeline;

/// Default TTL applied to requests without an override
pub const DEFAULT_TTL_MINUTES: i64 = 5;

/// Default name of the store inside the cache directory
pub const DEFAULT_DATABASE: &str = "http_cache";

/// Errors raised while validating a configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The default TTL was negative
    #[error("Default TTL must not be negative, got {0} seconds")]
    NegativeTtl(i64),

    /// The database identifier is empty or not a plain name
    #[error("Invalid database identifier: '{0}'")]
    InvalidDatabase(String),

    /// No cache directory was given and none could be determined
    #[error("Could not determine a cache directory; set one explicitly")]
    NoCacheDir,
}

/// Settings applied when building the cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for requests that do not override it
    pub default_ttl: Duration,
    /// Name of the store directory inside `cache_dir`
    pub database_identifier: String,
    /// Root directory for stores; `None` uses the XDG cache directory
    pub cache_dir: Option<PathBuf>,
    /// Payload codec; `None` uses compact JSON
    pub codec: Option<Arc<dyn PayloadCodec>>,
    /// Time source; `None` uses the system clock
    pub clock: Option<Arc<dyn Clock>>,
    /// Log sink for cache events; `None` uses the global `tracing` dispatcher
    pub logger: Option<Dispatch>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
            database_identifier: DEFAULT_DATABASE.to_string(),
            cache_dir: None,
            codec: None,
            clock: None,
            logger: None,
        }
    }
}

impl CacheConfig {
    /// Checks the settings without building anything
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl < Duration::zero() {
            return Err(ConfigError::NegativeTtl(self.default_ttl.num_seconds()));
        }

        let id = &self.database_identifier;
        let is_plain_name = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.chars().any(char::is_control);
        if !is_plain_name {
            return Err(ConfigError::InvalidDatabase(id.clone()));
        }

        Ok(())
    }

    /// Builds a manager backed by a `FileStore`
    pub fn build(self) -> Result<CacheManager, ConfigError> {
        self.validate()?;

        let store = match &self.cache_dir {
            Some(dir) => FileStore::with_dir(dir.join(&self.database_identifier)),
            None => FileStore::new(&self.database_identifier).ok_or(ConfigError::NoCacheDir)?,
        };
        debug!(dir = %store.dir().display(), "Using file store");

        self.build_with_store(Arc::new(store))
    }

    /// Builds a manager over a caller-supplied store
    ///
    /// `cache_dir` and `database_identifier` only matter for `build`, but the
    /// identifier is still validated here.
    pub fn build_with_store(self, store: Arc<dyn CacheStore>) -> Result<CacheManager, ConfigError> {
        self.validate()?;

        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(JsonCodec::default()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let manager = CacheManager::new(
            store,
            SerializationManager::new(codec),
            clock,
            self.default_ttl,
        );
        Ok(match self.logger {
            Some(logger) => manager.with_logger(logger),
            None => manager,
        })
    }

    /// Builds an interceptor around `pipeline`, backed by a `FileStore`
    pub fn build_interceptor<P: RequestPipeline>(
        self,
        pipeline: P,
    ) -> Result<CacheInterceptor<P>, ConfigError> {
        Ok(CacheInterceptor::new(pipeline, self.build()?))
    }
}
