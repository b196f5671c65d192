//! Shared key-value cache: the only channel through which otherwise isolated
//! process instances observe sync progress and enforce exclusivity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::SyncSettings;
use crate::models::{EmailMetadata, EmailUpdates, SyncState};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

pub const SYNC_LOCK_KEY: &str = "sync_in_progress";
pub const SYNC_STATE_KEY: &str = "sync_state";
pub const EMAILS_COUNT_KEY: &str = "emails_count";
pub const EMAILS_PROCESSED_KEY: &str = "emails_processed";
pub const EMAILS_CACHE_KEY: &str = "emails_cache";
pub const EMAILS_STALE_CACHE_KEY: &str = "emails_cache_stale";

const LOCK_VALUE: &str = "true";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `ttl = None` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Atomic set-if-absent. Two racing callers never both get `true`.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;
}

/// Raw counters published next to the state snapshot, used to reconstruct
/// an approximate status when the snapshot itself is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCounters {
    pub total: Option<u64>,
    pub processed: Option<u64>,
    pub lock_held: bool,
}

/// Typed access to the sync keys of a [`CacheStore`].
#[derive(Clone)]
pub struct SyncStore {
    cache: Arc<dyn CacheStore>,
    lock_ttl: Duration,
    state_ttl: Duration,
    list_ttl: Duration,
    stale_list_ttl: Duration,
}

impl SyncStore {
    pub fn new(cache: Arc<dyn CacheStore>, settings: &SyncSettings) -> Self {
        Self {
            cache,
            lock_ttl: settings.lock_ttl(),
            state_ttl: settings.state_ttl(),
            list_ttl: settings.list_ttl(),
            stale_list_ttl: settings.stale_list_ttl(),
        }
    }

    pub async fn try_acquire(&self) -> Result<bool, CacheError> {
        self.cache
            .set_if_absent(SYNC_LOCK_KEY, LOCK_VALUE, self.lock_ttl)
            .await
    }

    pub async fn release(&self) -> Result<(), CacheError> {
        self.cache.del(SYNC_LOCK_KEY).await
    }

    pub async fn lock_held(&self) -> Result<bool, CacheError> {
        Ok(self
            .cache
            .get(SYNC_LOCK_KEY)
            .await?
            .is_some_and(|value| value.trim() == LOCK_VALUE))
    }

    pub async fn publish_state(&self, state: &SyncState) -> Result<(), CacheError> {
        let payload = serde_json::to_string(state)?;
        self.cache
            .set(SYNC_STATE_KEY, &payload, Some(self.state_ttl))
            .await
    }

    pub async fn read_state(&self) -> Result<Option<SyncState>, CacheError> {
        let Some(raw) = self.cache.get(SYNC_STATE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(error) => {
                warn!("ignoring unreadable cached sync state: {error}");
                Ok(None)
            }
        }
    }

    pub async fn publish_counters(&self, total: u64, processed: u64) -> Result<(), CacheError> {
        self.cache
            .set(EMAILS_COUNT_KEY, &total.to_string(), Some(self.state_ttl))
            .await?;
        self.cache
            .set(
                EMAILS_PROCESSED_KEY,
                &processed.to_string(),
                Some(self.state_ttl),
            )
            .await
    }

    pub async fn read_counters(&self) -> Result<RawCounters, CacheError> {
        Ok(RawCounters {
            total: self.read_number(EMAILS_COUNT_KEY).await?,
            processed: self.read_number(EMAILS_PROCESSED_KEY).await?,
            lock_held: self.lock_held().await?,
        })
    }

    async fn read_number(&self, key: &str) -> Result<Option<u64>, CacheError> {
        Ok(self
            .cache
            .get(key)
            .await?
            .and_then(|raw| raw.trim().parse::<u64>().ok()))
    }

    /// Operator escape hatch: drops the lock, the snapshot and the counters.
    pub async fn clear_sync_keys(&self) -> Result<(), CacheError> {
        for key in [
            SYNC_LOCK_KEY,
            SYNC_STATE_KEY,
            EMAILS_COUNT_KEY,
            EMAILS_PROCESSED_KEY,
        ] {
            self.cache.del(key).await?;
        }
        Ok(())
    }

    pub async fn write_email_list(&self, emails: &[EmailMetadata]) -> Result<(), CacheError> {
        let payload = serde_json::to_string(emails)?;
        self.cache
            .set(EMAILS_CACHE_KEY, &payload, Some(self.list_ttl))
            .await?;
        self.cache
            .set(EMAILS_STALE_CACHE_KEY, &payload, Some(self.stale_list_ttl))
            .await
    }

    pub async fn read_email_list(&self) -> Result<Option<Vec<EmailMetadata>>, CacheError> {
        self.read_list(EMAILS_CACHE_KEY).await
    }

    pub async fn read_stale_email_list(&self) -> Result<Option<Vec<EmailMetadata>>, CacheError> {
        self.read_list(EMAILS_STALE_CACHE_KEY).await
    }

    async fn read_list(&self, key: &str) -> Result<Option<Vec<EmailMetadata>>, CacheError> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Ok(Some(list)),
            Err(error) => {
                warn!("ignoring unreadable cached email list {key}: {error}");
                Ok(None)
            }
        }
    }

    /// Applies a confirmed edit to both cached lists so the next read sees it.
    pub async fn patch_email(&self, email_id: &str, updates: &EmailUpdates) -> Result<(), CacheError> {
        for (key, ttl) in [
            (EMAILS_CACHE_KEY, self.list_ttl),
            (EMAILS_STALE_CACHE_KEY, self.stale_list_ttl),
        ] {
            let Some(mut list) = self.read_list(key).await? else {
                continue;
            };
            let Some(email) = list.iter_mut().find(|email| email.id == email_id) else {
                continue;
            };
            email.apply(updates);
            let payload = serde_json::to_string(&list)?;
            self.cache.set(key, &payload, Some(ttl)).await?;
        }
        Ok(())
    }
}
