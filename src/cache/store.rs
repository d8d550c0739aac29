//! Persistent store contract and the in-memory implementation
//!
//! Stores map an identity key to a single `CacheEntry`. A write with an
//! existing key replaces the previous entry. Implementations must give
//! read-your-writes for a single caller and last-writer-wins upserts across
//! threads.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::row::{Row, StorableValue};

const FIELD_KEY: &str = "identity_key";
const FIELD_TYPE: &str = "response_type";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_CACHED_AT: &str = "cached_at";

/// Errors raised by the persistent store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem or other I/O failure
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be encoded or decoded
    #[error("Failed to encode stored row: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored row is missing a field or has the wrong kind of value
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// A writer panicked while holding the store lock
    #[error("Store lock poisoned")]
    Poisoned,
}

/// A stored response
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub identity_key: String,
    pub response_type: String,
    pub payload: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Converts the entry into its storable row
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(FIELD_KEY.to_string(), self.identity_key.as_str().into());
        row.insert(FIELD_TYPE.to_string(), self.response_type.as_str().into());
        row.insert(FIELD_PAYLOAD.to_string(), self.payload.clone().into());
        row.insert(
            FIELD_CACHED_AT.to_string(),
            self.cached_at.timestamp_millis().into(),
        );
        row
    }

    /// Rebuilds an entry from a stored row
    pub fn from_row(mut row: Row) -> Result<Self, StoreError> {
        let identity_key = take_text(&mut row, FIELD_KEY)?;
        let response_type = take_text(&mut row, FIELD_TYPE)?;

        let payload = match take(&mut row, FIELD_PAYLOAD)? {
            StorableValue::Blob(bytes) => bytes,
            other => return Err(wrong_kind(FIELD_PAYLOAD, "blob", &other)),
        };

        let cached_at = match take(&mut row, FIELD_CACHED_AT)? {
            StorableValue::Integer(millis) => DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| {
                    StoreError::CorruptRow(format!("timestamp {} out of range", millis))
                })?,
            other => return Err(wrong_kind(FIELD_CACHED_AT, "integer", &other)),
        };

        Ok(Self {
            identity_key,
            response_type,
            payload,
            cached_at,
        })
    }

    /// Whether the entry was written at or before `now - max_age`
    ///
    /// An age reaching back past the earliest representable time matches nothing.
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match now.checked_sub_signed(max_age) {
            Some(cutoff) => self.cached_at <= cutoff,
            None => false,
        }
    }
}

fn take(row: &mut Row, field: &str) -> Result<StorableValue, StoreError> {
    row.remove(field)
        .ok_or_else(|| StoreError::CorruptRow(format!("missing field '{}'", field)))
}

fn take_text(row: &mut Row, field: &str) -> Result<String, StoreError> {
    match take(row, field)? {
        StorableValue::Text(text) => Ok(text),
        other => Err(wrong_kind(field, "text", &other)),
    }
}

fn wrong_kind(field: &str, expected: &str, found: &StorableValue) -> StoreError {
    StoreError::CorruptRow(format!(
        "field '{}' should be {}, found {}",
        field,
        expected,
        found.kind()
    ))
}

/// Durable mapping from identity key to cache entry
pub trait CacheStore: Debug + Send + Sync {
    /// Looks up the entry for `identity_key`
    fn get(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Inserts or replaces the entry with the same identity key
    fn put(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// Deletes every entry written at or before `now - max_age`
    ///
    /// Returns the number of entries removed.
    fn evict_older_than(&self, max_age: Duration, now: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Deletes one entry, returning whether it existed
    fn clear(&self, identity_key: &str) -> Result<bool, StoreError>;

    /// Deletes every entry stored for `response_type`
    fn clear_type(&self, response_type: &str) -> Result<usize, StoreError>;

    /// Marks every entry stored for `response_type` as expired
    ///
    /// Entries keep their payload, so they remain available as stale
    /// fallback, but the next lookup always refreshes them. Returns the
    /// number of entries touched.
    fn expire_type(&self, response_type: &str) -> Result<usize, StoreError>;

    /// Deletes every entry
    fn clear_all(&self) -> Result<usize, StoreError>;

    /// Number of stored entries
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Non-persistent store kept in a mutex-guarded map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>, StoreError> {
        self.entries.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, identity_key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.lock()?.get(identity_key).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.lock()?.insert(entry.identity_key.clone(), entry);
        Ok(())
    }

    fn evict_older_than(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_older_than(max_age, now));
        Ok(before - entries.len())
    }

    fn clear(&self, identity_key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(identity_key).is_some())
    }

    fn clear_type(&self, response_type: &str) -> Result<usize, StoreError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.response_type != response_type);
        Ok(before - entries.len())
    }

    fn expire_type(&self, response_type: &str) -> Result<usize, StoreError> {
        let mut expired = 0;
        for entry in self.lock()?.values_mut() {
            if entry.response_type == response_type {
                entry.cached_at = DateTime::UNIX_EPOCH;
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn clear_all(&self) -> Result<usize, StoreError> {
        let mut entries = self.lock()?;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }
}
