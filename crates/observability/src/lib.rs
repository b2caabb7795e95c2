//! Tracing/logging setup shared by every binary and test harness.

pub mod tracing;

pub use self::tracing::{LogFormat, LogSettings};

/// Initialize process-wide tracing with default settings (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init(&LogSettings::default());
}
