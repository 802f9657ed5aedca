//! Tracing/logging setup shared by taskgrid processes.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    crate::tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
