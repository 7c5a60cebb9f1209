//! Tracing and logging setup shared by every storefront binary.

/// Initialize process-wide observability with defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogSettings::default());
}

/// Initialize process-wide observability with explicit settings.
pub fn init_with(settings: &LogSettings) {
    tracing::init(settings);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, LogSettings};
