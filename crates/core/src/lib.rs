//! `storefront-core`: shared primitives for the storefront services.
//!
//! This crate holds identifiers, the clock port, and the domain error type.
//! It carries **no infrastructure concerns**.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, LeaseId, UserId};
