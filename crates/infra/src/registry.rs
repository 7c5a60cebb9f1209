//! Service registry: owns the cache, job queue and rate limiter.
//!
//! Components are built once by [`ServiceRegistry::initialize`] and handed out
//! as shared handles. Initialization and shutdown take the write half of the
//! registry lock; accessors and health checks only take the read half.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use storefront_core::{Clock, SystemClock, UserId};

use crate::cache::CacheService;
use crate::config::ServicesConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::jobs::{JobQueue, QueueStats};
use crate::rate_limit::RateLimiter;
use crate::store::{KvStore, StoreConnector};

/// The auxiliary services the registry manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Cache,
    JobQueue,
    RateLimit,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Cache, Component::JobQueue, Component::RateLimit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Cache => "cache",
            Component::JobQueue => "job_queue",
            Component::RateLimit => "rate_limit",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
    NotInitialized,
}

/// Aggregated health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub services_initialized: bool,
    pub cache: ComponentStatus,
    pub job_queue: ComponentStatus,
    pub rate_limit: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_queue_stats: Option<QueueStats>,
}

impl HealthReport {
    fn not_initialized() -> Self {
        Self {
            services_initialized: false,
            cache: ComponentStatus::NotInitialized,
            job_queue: ComponentStatus::NotInitialized,
            rate_limit: ComponentStatus::NotInitialized,
            job_queue_stats: None,
        }
    }

    pub fn status(&self, component: Component) -> ComponentStatus {
        match component {
            Component::Cache => self.cache,
            Component::JobQueue => self.job_queue,
            Component::RateLimit => self.rate_limit,
        }
    }

    pub fn is_healthy(&self) -> bool {
        Component::ALL
            .iter()
            .all(|c| self.status(*c) == ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone)]
struct Services {
    cache: Arc<CacheService>,
    job_queue: Arc<JobQueue>,
    rate_limiter: Arc<RateLimiter>,
}

pub struct ServiceRegistry {
    connector: Arc<dyn StoreConnector>,
    config: ServicesConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<Option<Services>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    pub fn new(connector: Arc<dyn StoreConnector>, config: ServicesConfig) -> Self {
        Self::with_clock(connector, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        connector: Arc<dyn StoreConnector>,
        config: ServicesConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connector,
            config,
            clock,
            state: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ServicesConfig {
        &self.config
    }

    /// Connect and build every component. A no-op once initialized.
    ///
    /// Any component failing to connect aborts the whole attempt and leaves
    /// the registry uninitialized, so the call can be retried.
    pub async fn initialize(&self) -> ServiceResult<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            debug!("services already initialized");
            return Ok(());
        }

        let cache_store = self.connect(Component::Cache).await?;
        let queue_store = self.connect(Component::JobQueue).await?;
        let limiter_store = self.connect(Component::RateLimit).await?;

        *state = Some(Services {
            cache: Arc::new(CacheService::new(cache_store)),
            job_queue: Arc::new(JobQueue::new(queue_store, self.clock.clone(), &self.config.jobs)),
            rate_limiter: Arc::new(RateLimiter::new(
                limiter_store,
                self.clock.clone(),
                &self.config.rate_limit,
            )),
        });

        info!("auxiliary services initialized");
        Ok(())
    }

    async fn connect(&self, component: Component) -> ServiceResult<Arc<dyn KvStore>> {
        let init_err = |source| ServiceError::Initialization { component, source };

        let store = self.connector.connect(component).await.map_err(init_err)?;
        store.ping().await.map_err(init_err)?;
        debug!(%component, "store connection established");
        Ok(store)
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.is_some()
    }

    pub async fn cache(&self) -> ServiceResult<Arc<CacheService>> {
        self.with_services(Component::Cache, |s| s.cache.clone()).await
    }

    pub async fn job_queue(&self) -> ServiceResult<Arc<JobQueue>> {
        self.with_services(Component::JobQueue, |s| s.job_queue.clone())
            .await
    }

    pub async fn rate_limiter(&self) -> ServiceResult<Arc<RateLimiter>> {
        self.with_services(Component::RateLimit, |s| s.rate_limiter.clone())
            .await
    }

    async fn with_services<T>(
        &self,
        component: Component,
        f: impl FnOnce(&Services) -> T,
    ) -> ServiceResult<T> {
        self.state
            .read()
            .await
            .as_ref()
            .map(f)
            .ok_or(ServiceError::NotInitialized(component))
    }

    /// Probe each component independently.
    pub async fn health_check(&self) -> HealthReport {
        let Some(services) = self.state.read().await.clone() else {
            return HealthReport::not_initialized();
        };

        let timeout = self.config.health.probe_timeout();
        let (cache, stats, rate_limit) = tokio::join!(
            probe(Component::Cache, timeout, services.cache.probe()),
            probe(Component::JobQueue, timeout, services.job_queue.stats()),
            probe(
                Component::RateLimit,
                timeout,
                services.rate_limiter.remaining_checked(UserId::ANONYMOUS)
            ),
        );

        HealthReport {
            services_initialized: true,
            cache: status_of(&cache),
            job_queue: status_of(&stats),
            rate_limit: status_of(&rate_limit),
            job_queue_stats: stats,
        }
    }

    /// Drop every component handle. Idempotent.
    pub async fn shutdown(&self) {
        if self.state.write().await.take().is_some() {
            info!("auxiliary services shut down");
        }
    }
}

async fn probe<T>(
    component: Component,
    timeout: Duration,
    check: impl Future<Output = ServiceResult<T>>,
) -> Option<T> {
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(%component, error = %err, "health probe failed");
            None
        }
        Err(_) => {
            warn!(%component, ?timeout, "health probe timed out");
            None
        }
    }
}

fn status_of<T>(probe: &Option<T>) -> ComponentStatus {
    match probe {
        Some(_) => ComponentStatus::Healthy,
        None => ComponentStatus::Unhealthy,
    }
}

static PROCESS_REGISTRY: OnceLock<Arc<ServiceRegistry>> = OnceLock::new();

/// The process-wide registry, built by `build` on first use.
///
/// Meant for the binary's bootstrap only; everything else receives the
/// registry handle explicitly.
pub fn process_registry(build: impl FnOnce() -> ServiceRegistry) -> Arc<ServiceRegistry> {
    PROCESS_REGISTRY
        .get_or_init(|| Arc::new(build()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::jobs::{JobKind, NewJob};
    use crate::store::InMemoryConnector;

    fn registry() -> (Arc<ServiceRegistry>, Arc<InMemoryConnector>) {
        let connector = Arc::new(InMemoryConnector::new());
        let registry = Arc::new(ServiceRegistry::new(
            connector.clone(),
            ServicesConfig::default(),
        ));
        (registry, connector)
    }

    #[tokio::test]
    async fn accessors_fail_before_initialization() {
        let (registry, _connector) = registry();

        assert!(!registry.is_initialized().await);
        assert!(matches!(
            registry.cache().await,
            Err(ServiceError::NotInitialized(Component::Cache))
        ));
        assert!(matches!(
            registry.job_queue().await,
            Err(ServiceError::NotInitialized(Component::JobQueue))
        ));
        assert!(matches!(
            registry.rate_limiter().await,
            Err(ServiceError::NotInitialized(Component::RateLimit))
        ));
    }

    #[tokio::test]
    async fn health_before_initialization_reports_not_initialized() {
        let (registry, _connector) = registry();

        let report = registry.health_check().await;
        assert!(!report.services_initialized);
        for component in Component::ALL {
            assert_eq!(report.status(component), ComponentStatus::NotInitialized);
        }
        assert!(!report.is_healthy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_initialization_connects_once_per_component() {
        let (registry, connector) = registry();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.initialize().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for component in Component::ALL {
            assert_eq!(connector.store(component).ping_count(), 1, "{component}");
        }
        assert!(registry.is_initialized().await);
    }

    #[tokio::test]
    async fn healthy_after_initialization() {
        let (registry, _connector) = registry();
        registry.initialize().await.unwrap();

        let queue = registry.job_queue().await.unwrap();
        queue
            .enqueue(NewJob::new(JobKind::EmailSend, Vec::new()))
            .await
            .unwrap();

        let report = registry.health_check().await;
        assert!(report.services_initialized);
        assert!(report.is_healthy());
        assert_eq!(report.job_queue_stats.map(|s| s.queue_length), Some(1));
    }

    #[tokio::test]
    async fn store_outage_marks_only_that_component_unhealthy() {
        let (registry, connector) = registry();
        registry.initialize().await.unwrap();

        connector.store(Component::JobQueue).set_unavailable(true);

        let report = registry.health_check().await;
        assert_eq!(report.cache, ComponentStatus::Healthy);
        assert_eq!(report.job_queue, ComponentStatus::Unhealthy);
        assert_eq!(report.rate_limit, ComponentStatus::Healthy);
        assert_eq!(report.job_queue_stats, None);
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn failed_initialization_can_be_retried() {
        let (registry, connector) = registry();
        connector.set_unavailable(true);

        let err = registry.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Initialization {
                component: Component::Cache,
                source: StoreError::Unavailable
            }
        ));
        assert!(!registry.is_initialized().await);

        connector.set_unavailable(false);
        registry.initialize().await.unwrap();
        assert!(registry.is_initialized().await);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (registry, _connector) = registry();
        registry.initialize().await.unwrap();

        registry.shutdown().await;
        registry.shutdown().await;

        assert!(!registry.is_initialized().await);
        assert!(matches!(
            registry.cache().await,
            Err(ServiceError::NotInitialized(Component::Cache))
        ));
        assert!(!registry.health_check().await.services_initialized);
    }

    #[test]
    fn report_serializes_statuses_in_snake_case() {
        let json = serde_json::to_value(HealthReport::not_initialized()).unwrap();
        assert_eq!(json["cache"], "not_initialized");
        assert_eq!(json["services_initialized"], false);
        assert!(json.get("job_queue_stats").is_none());
    }
}
