//! Dual-dimension fixed-window rate limiter.
//!
//! A request is admitted only when both the per-user window and the per-IP
//! window have room. Each window is a JSON record in the shared store that
//! expires together with its window.
//!
//! Store failures never block traffic: an unreadable window is treated as a
//! fresh one and a failed write is logged and ignored.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use storefront_core::{Clock, UserId};

use crate::config::RateLimitSettings;
use crate::error::{ServiceError, ServiceResult};
use crate::store::KvStore;

const USER_KEY_PREFIX: &str = "rate_limit:user:";
const IP_KEY_PREFIX: &str = "rate_limit:ip:";
// Largest whole-second span chrono can represent.
const MAX_WINDOW_SECS: i64 = i64::MAX / 1_000;

pub fn user_key(user: UserId) -> String {
    format!("{USER_KEY_PREFIX}{user}")
}

pub fn ip_key(ip: &str) -> String {
    format!("{IP_KEY_PREFIX}{ip}")
}

/// `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl LimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Stored state of one subject's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub requests: u32,
    /// Window length in seconds.
    pub window: u64,
    pub last_reset: DateTime<Utc>,
}

impl WindowRecord {
    fn fresh(rule: LimitRule, now: DateTime<Utc>) -> Self {
        Self {
            requests: 0,
            window: rule.window.as_secs(),
            last_reset: now,
        }
    }

    fn window_len(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.window).unwrap_or(i64::MAX).min(MAX_WINDOW_SECS))
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_reset) > self.window_len()
    }

    fn reset_after(&self, now: DateTime<Utc>) -> Duration {
        match self.last_reset.checked_add_signed(self.window_len()) {
            Some(reset_at) => reset_at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::from_secs(self.window),
        }
    }
}

/// Read-only view of a user's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remaining {
    pub remaining: u32,
    pub reset_after: Duration,
}

pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    user_rule: LimitRule,
    ip_rule: LimitRule,
    stripes: Vec<Mutex<()>>,
}

impl core::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("user_rule", &self.user_rule)
            .field("ip_rule", &self.ip_rule)
            .field("stripes", &self.stripes.len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: &RateLimitSettings) -> Self {
        Self::with_rules(
            store,
            clock,
            LimitRule::new(settings.user_limit, Duration::from_secs(settings.user_window_secs)),
            LimitRule::new(settings.ip_limit, Duration::from_secs(settings.ip_window_secs)),
            settings.lock_stripes,
        )
    }

    pub fn with_rules(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        user_rule: LimitRule,
        ip_rule: LimitRule,
        lock_stripes: usize,
    ) -> Self {
        let stripes = (0..lock_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            store,
            clock,
            user_rule,
            ip_rule,
            stripes,
        }
    }

    pub fn user_rule(&self) -> LimitRule {
        self.user_rule
    }

    pub fn ip_rule(&self) -> LimitRule {
        self.ip_rule
    }

    /// Admit a request from `user` at `ip` if both windows have room.
    ///
    /// Both checks always run, and each one counts the request against its
    /// own window only when that window admits it.
    pub async fn allow(&self, user: UserId, ip: &str) -> bool {
        let user_ok = self.check(&user_key(user), self.user_rule).await;
        let ip_ok = self.check(&ip_key(ip), self.ip_rule).await;

        if !(user_ok && ip_ok) {
            debug!(user = %user, ip, user_ok, ip_ok, "request rate limited");
        }
        user_ok && ip_ok
    }

    /// Remaining budget in `user`'s window and time until it resets.
    ///
    /// Falls back to a full window if the store cannot be read.
    pub async fn remaining(&self, user: UserId) -> Remaining {
        match self.remaining_checked(user).await {
            Ok(remaining) => remaining,
            Err(err) => {
                warn!(user = %user, error = %err, "rate limit window unreadable; reporting full quota");
                self.full_quota()
            }
        }
    }

    /// Like [`remaining`](Self::remaining) but surfaces store and decode errors.
    pub async fn remaining_checked(&self, user: UserId) -> ServiceResult<Remaining> {
        let key = user_key(user);
        let now = self.clock.now();
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(self.full_quota());
        };
        let record: WindowRecord =
            serde_json::from_slice(&bytes).map_err(ServiceError::deserialization)?;

        if record.is_expired(now) {
            return Ok(self.full_quota());
        }
        Ok(Remaining {
            remaining: self.user_rule.limit.saturating_sub(record.requests),
            reset_after: record.reset_after(now),
        })
    }

    /// Drop every stored window for `user`. Returns how many keys were removed.
    pub async fn reset_user_limits(&self, user: UserId) -> ServiceResult<u64> {
        let keys = self.store.keys(&user_key(user)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        debug!(user = %user, removed, "user rate limits reset");
        Ok(removed)
    }

    fn full_quota(&self) -> Remaining {
        Remaining {
            remaining: self.user_rule.limit,
            reset_after: self.user_rule.window,
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[index]
    }

    async fn check(&self, key: &str, rule: LimitRule) -> bool {
        let _guard = self.stripe(key).lock().await;
        let now = self.clock.now();

        let mut record = self.load(key, rule, now).await;
        if record.is_expired(now) {
            record = WindowRecord::fresh(rule, now);
        }
        if record.requests >= rule.limit {
            return false;
        }
        record.requests += 1;

        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                if let Err(err) = self.store.set_ex(key, bytes, rule.window).await {
                    warn!(key, error = %err, "failed to persist rate limit window");
                }
            }
            Err(err) => warn!(key, error = %err, "failed to encode rate limit window"),
        }
        true
    }

    async fn load(&self, key: &str, rule: LimitRule, now: DateTime<Utc>) -> WindowRecord {
        match self.store.get(key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(key, error = %err, "corrupt rate limit window; starting fresh");
                WindowRecord::fresh(rule, now)
            }),
            Ok(None) => WindowRecord::fresh(rule, now),
            Err(err) => {
                warn!(key, error = %err, "rate limit store unavailable; failing open");
                WindowRecord::fresh(rule, now)
            }
        }
    }
}
