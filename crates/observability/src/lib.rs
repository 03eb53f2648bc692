//! Tracing/logging setup shared by every binary in the workspace.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::{LogFormat, LogSettings};

/// Initialize process-wide tracing with defaults (`info`, JSON).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogSettings::default());
}

/// Initialize process-wide tracing from loaded settings.
pub fn init_with(settings: &LogSettings) {
    tracing::init(settings);
}
