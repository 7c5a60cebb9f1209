//! Auxiliary service layer: cache, rate limiter and job queue over a shared
//! key-value/list store, wired together by the service registry.

pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod rate_limit;
pub mod registry;
pub mod store;

pub use cache::CacheService;
pub use config::{ConfigError, ServicesConfig};
pub use error::{ServiceError, ServiceResult, StoreError, StoreResult};
pub use jobs::{JobQueue, JobWorker};
pub use rate_limit::RateLimiter;
pub use registry::{Component, ComponentStatus, HealthReport, ServiceRegistry, process_registry};
pub use store::{InMemoryConnector, InMemoryStore, KvStore, StoreConnector};
