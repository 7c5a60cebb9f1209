//! Error taxonomy for the auxiliary services.
//!
//! Cache and rate limiter convert these into conservative defaults (miss /
//! allow) and only log them. The job queue and the registry's stats and
//! health paths hand them to the caller.

use thiserror::Error;

use crate::registry::Component;

/// Result type for store round-trips.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failure talking to the backing key-value/list store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store unavailable")]
    Unavailable,
}

/// Service-level error.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("{0} is not initialized")]
    NotInitialized(Component),

    /// Reserved for detecting lost updates on rate-limit windows.
    #[error("concurrent update lost for {0}")]
    RaceCondition(String),

    #[error("failed to initialize {component}: {source}")]
    Initialization {
        component: Component,
        #[source]
        source: StoreError,
    },
}

impl ServiceError {
    pub fn serialization(err: impl core::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn deserialization(err: impl core::fmt::Display) -> Self {
        Self::Deserialization(err.to_string())
    }
}
