//! TTL cache over the shared store.
//!
//! Reads are best-effort: a store failure or an undecodable value is logged
//! and reported as a miss. Writes surface their errors so callers can decide
//! whether a failed population matters.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ServiceError, ServiceResult, StoreError};
use crate::store::KvStore;

/// Sentinel key written by the health probe.
pub const HEALTH_CHECK_KEY: &str = "health_check";

const HEALTH_CHECK_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn KvStore>,
}

impl core::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheService").finish_non_exhaustive()
    }
}

impl CacheService {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// JSON-encode `value` and store it under `key` for `ttl`.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> ServiceResult<()>
    where
        T: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(value).map_err(ServiceError::serialization)?;
        self.store.set_ex(key, bytes, ttl).await?;
        Ok(())
    }

    /// `None` on a miss, an expired entry, a store error or a decode error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "cached value could not be decoded; treating as miss");
                None
            }
        }
    }

    /// Remove `key`. Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> ServiceResult<()> {
        self.store.delete(&[key.to_string()]).await?;
        Ok(())
    }

    /// Delete every key matching the glob `pattern` in one batch.
    ///
    /// Returns the number of keys removed.
    pub async fn clear(&self, pattern: &str) -> ServiceResult<u64> {
        let keys = self.store.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        debug!(pattern, removed, "cache entries cleared");
        Ok(removed)
    }

    /// Whether `key` is present. Store errors read as absent.
    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(present) => present,
            Err(err) => {
                warn!(key, error = %err, "cache existence probe failed; treating as absent");
                false
            }
        }
    }

    /// Strict round-trip used by health reporting: write the sentinel, read it back.
    pub async fn probe(&self) -> ServiceResult<()> {
        self.store
            .set_ex(HEALTH_CHECK_KEY, b"\"ok\"".to_vec(), HEALTH_CHECK_TTL)
            .await?;
        match self.store.get(HEALTH_CHECK_KEY).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::Command("health check sentinel was not readable".into()).into()),
        }
    }
}
