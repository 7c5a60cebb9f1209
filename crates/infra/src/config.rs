//! Service configuration.
//!
//! Loaded from the environment with the `STOREFRONT` prefix and `__` as the
//! nesting separator, e.g. `STOREFRONT__RATE_LIMIT__USER_LIMIT=250`. The
//! legacy `REDIS_ADDR` / `REDIS_PASSWORD` variables still override the store
//! address and credential.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;
use thiserror::Error;

pub const ENV_PREFIX: &str = "STOREFRONT";

/// Upper bound for every window and timeout given in seconds (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Connection settings for the shared key-value/list store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `host:port`
    pub address: String,
    pub password: Option<String>,
    /// Database used by the cache and the rate limiter.
    pub cache_db: i64,
    /// Database used by the job queue.
    pub queue_db: i64,
    pub command_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            address: "localhost:6379".to_string(),
            password: None,
            cache_db: 0,
            queue_db: 1,
            command_timeout_ms: 5_000,
        }
    }
}

impl StoreSettings {
    /// Connection URL for database `db`.
    pub fn url_for(&self, db: i64) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{password}@{}/{db}", self.address),
            None => format!("redis://{}/{db}", self.address),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub user_limit: u32,
    pub user_window_secs: u64,
    pub ip_limit: u32,
    pub ip_window_secs: u64,
    /// Number of lock stripes guarding per-subject read-modify-write.
    pub lock_stripes: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            user_limit: 100,
            user_window_secs: 3_600,
            ip_limit: 20,
            ip_window_secs: 60,
            lock_stripes: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobQueueSettings {
    pub max_attempts: u32,
    pub dequeue_timeout_secs: u64,
    /// How long a dequeued job may stay unacknowledged before it is reclaimed.
    pub visibility_timeout_secs: u64,
    pub reclaim_interval_secs: u64,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            dequeue_timeout_secs: 10,
            visibility_timeout_secs: 300,
            reclaim_interval_secs: 30,
        }
    }
}

impl JobQueueSettings {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2_000,
        }
    }
}

impl HealthSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Everything the service registry needs to build its components.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub store: StoreSettings,
    pub rate_limit: RateLimitSettings,
    pub jobs: JobQueueSettings,
    pub health: HealthSettings,
}

impl ServicesConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let lookup = |name: &str| match &vars {
            Some(map) => map.get(name).cloned(),
            None => std::env::var(name).ok(),
        };
        let legacy_addr = lookup("REDIS_ADDR").filter(|v| !v.is_empty());
        let legacy_password = lookup("REDIS_PASSWORD").filter(|v| !v.is_empty());

        let config = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .source(vars),
            )
            .set_override_option("store.address", legacy_addr)?
            .set_override_option("store.password", legacy_password)?
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.address.trim().is_empty() {
            return Err(ConfigError::invalid("store.address", "must not be empty"));
        }
        if self.store.command_timeout_ms == 0 {
            return Err(ConfigError::invalid("store.command_timeout_ms", "must be positive"));
        }
        if self.rate_limit.user_limit == 0 || self.rate_limit.ip_limit == 0 {
            return Err(ConfigError::invalid("rate_limit", "limits must be positive"));
        }
        check_secs("rate_limit.user_window_secs", self.rate_limit.user_window_secs)?;
        check_secs("rate_limit.ip_window_secs", self.rate_limit.ip_window_secs)?;
        if self.rate_limit.lock_stripes == 0 {
            return Err(ConfigError::invalid("rate_limit.lock_stripes", "must be positive"));
        }
        if self.jobs.max_attempts == 0 {
            return Err(ConfigError::invalid("jobs.max_attempts", "must be at least 1"));
        }
        // A zero BRPOP timeout blocks forever.
        check_secs("jobs.dequeue_timeout_secs", self.jobs.dequeue_timeout_secs)?;
        check_secs("jobs.visibility_timeout_secs", self.jobs.visibility_timeout_secs)?;
        check_secs("jobs.reclaim_interval_secs", self.jobs.reclaim_interval_secs)?;
        Ok(())
    }
}

fn check_secs(key: &'static str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(ConfigError::invalid(key, "must be positive"));
    }
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::invalid(
            key,
            format!("must be at most {MAX_DURATION_SECS} seconds"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_the_documented_limits() {
        let cfg = ServicesConfig::from_vars(HashMap::new()).unwrap();
        assert_eq!(cfg.store.address, "localhost:6379");
        assert_eq!(cfg.rate_limit.user_limit, 100);
        assert_eq!(cfg.rate_limit.user_window_secs, 3_600);
        assert_eq!(cfg.rate_limit.ip_limit, 20);
        assert_eq!(cfg.rate_limit.ip_window_secs, 60);
        assert_eq!(cfg.jobs.max_attempts, 3);
        assert_eq!(cfg.jobs.dequeue_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn nested_environment_overrides() {
        let cfg = ServicesConfig::from_vars(vars(&[
            ("STOREFRONT__RATE_LIMIT__USER_LIMIT", "250"),
            ("STOREFRONT__JOBS__MAX_ATTEMPTS", "5"),
            ("STOREFRONT__STORE__QUEUE_DB", "4"),
        ]))
        .unwrap();

        assert_eq!(cfg.rate_limit.user_limit, 250);
        assert_eq!(cfg.jobs.max_attempts, 5);
        assert_eq!(cfg.store.queue_db, 4);
    }

    #[test]
    fn legacy_redis_variables_override_store() {
        let cfg = ServicesConfig::from_vars(vars(&[
            ("REDIS_ADDR", "cache.internal:6380"),
            ("REDIS_PASSWORD", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(cfg.store.address, "cache.internal:6380");
        assert_eq!(cfg.store.url_for(1), "redis://:s3cret@cache.internal:6380/1");
    }

    #[test]
    fn url_without_password() {
        let settings = StoreSettings::default();
        assert_eq!(settings.url_for(0), "redis://localhost:6379/0");
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = ServicesConfig::from_vars(vars(&[("STOREFRONT__RATE_LIMIT__IP_LIMIT", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "rate_limit", .. }));
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let err = ServicesConfig::from_vars(vars(&[(
            "STOREFRONT__RATE_LIMIT__USER_WINDOW_SECS",
            "100000000000000",
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "rate_limit.user_window_secs", .. }
        ));

        let err = ServicesConfig::from_vars(vars(&[(
            "STOREFRONT__JOBS__VISIBILITY_TIMEOUT_SECS",
            (MAX_DURATION_SECS + 1).to_string().as_str(),
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "jobs.visibility_timeout_secs", .. }
        ));

        let cfg = ServicesConfig::from_vars(vars(&[(
            "STOREFRONT__RATE_LIMIT__IP_WINDOW_SECS",
            MAX_DURATION_SECS.to_string().as_str(),
        )]))
        .unwrap();
        assert_eq!(cfg.rate_limit.ip_window_secs, MAX_DURATION_SECS);
    }

    #[test]
    fn zero_dequeue_timeout_is_rejected() {
        let err = ServicesConfig::from_vars(vars(&[("STOREFRONT__JOBS__DEQUEUE_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "jobs.dequeue_timeout_secs", .. }
        ));
    }
}
