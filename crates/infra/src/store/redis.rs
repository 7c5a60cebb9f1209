//! Redis-backed store.
//!
//! - Regular commands share one `redis::aio::ConnectionManager` (multiplexed,
//!   reconnects on its own).
//! - `BRPOP` runs on a dedicated connection per call: a blocking pop on the
//!   shared multiplexed connection would stall every other command queued
//!   behind it for up to the pop timeout.
//! - Every command is bounded by `command_timeout`; a timeout surfaces as
//!   [`StoreError::Timeout`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult};
use tracing::debug;

use super::{KvStore, StoreConnector};
use crate::config::StoreSettings;
use crate::error::{StoreError, StoreResult};
use crate::registry::Component;

/// `SCAN` page size used by [`RedisStore::keys`].
const SCAN_COUNT: u32 = 500;

fn classify(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    command_timeout: Duration,
}

impl core::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url`, bounding each command by `command_timeout`.
    pub async fn connect(url: &str, command_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let manager = tokio::time::timeout(command_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| StoreError::Timeout(command_timeout))?
            .map_err(classify)?;

        Ok(Self {
            client,
            manager,
            command_timeout,
        })
    }

    async fn run<T, F>(&self, command: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        self.run(async {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        self.run(async {
            let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok::<_, RedisError>(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        self.run(async {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let millis = ttl.as_millis().max(1) as u64;
        let mut conn = self.manager.clone();
        self.run(async {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        self.run(async {
            let count: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
            Ok::<_, RedisError>(count > 0)
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        self.run(async {
            let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
            Ok::<_, RedisError>(removed)
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        // SCAN instead of KEYS so large keyspaces don't block the server.
        let mut conn = self.manager.clone();
        self.run(async {
            let mut cursor: u64 = 0;
            let mut found = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                found.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            found.sort();
            found.dedup();
            Ok::<_, RedisError>(found)
        })
        .await
    }

    async fn lpush(&self, list: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        self.run(async {
            let _: u64 = redis::cmd("LPUSH").arg(list).arg(value).query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn rpush(&self, list: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        self.run(async {
            let _: u64 = redis::cmd("RPUSH").arg(list).arg(value).query_async(&mut conn).await?;
            Ok::<_, RedisError>(())
        })
        .await
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> StoreResult<Option<Vec<u8>>> {
        // BRPOP with a zero timeout blocks forever; match the in-memory store.
        if timeout.is_zero() {
            let mut conn = self.manager.clone();
            return self
                .run(async {
                    let popped: Option<Vec<u8>> =
                        redis::cmd("RPOP").arg(list).query_async(&mut conn).await?;
                    Ok::<_, RedisError>(popped)
                })
                .await;
        }

        let bound = timeout + self.command_timeout;
        let pop = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let popped: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
                .arg(list)
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(popped.map(|(_, value)| value))
        };

        match tokio::time::timeout(bound, pop).await {
            Ok(result) => result.map_err(classify),
            Err(_) => {
                debug!(list, ?bound, "blocking pop exceeded its bound");
                Err(StoreError::Timeout(bound))
            }
        }
    }

    async fn llen(&self, list: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        self.run(async {
            let len: u64 = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
            Ok::<_, RedisError>(len)
        })
        .await
    }

    async fn lrem(&self, list: &str, value: &[u8]) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        self.run(async {
            let removed: u64 = redis::cmd("LREM")
                .arg(list)
                .arg(0)
                .arg(value)
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(removed)
        })
        .await
    }

    async fn lrange(&self, list: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>> {
        let mut conn = self.manager.clone();
        self.run(async {
            let values: Vec<Vec<u8>> = redis::cmd("LRANGE")
                .arg(list)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(values)
        })
        .await
    }
}

/// Opens one Redis connection per component.
///
/// Cache and rate limiter share `cache_db`; the job queue lives in
/// `queue_db` so cache pattern clears can never touch queue lists.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    settings: StoreSettings,
}

impl RedisConnector {
    pub fn new(settings: StoreSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self, component: Component) -> StoreResult<Arc<dyn KvStore>> {
        let db = match component {
            Component::JobQueue => self.settings.queue_db,
            Component::Cache | Component::RateLimit => self.settings.cache_db,
        };
        let store =
            RedisStore::connect(&self.settings.url_for(db), self.settings.command_timeout()).await?;
        Ok(Arc::new(store))
    }
}
