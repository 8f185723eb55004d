//! Tracing and logging setup shared by the jobgate binaries.

/// Initialize process-wide logging with the format named by
/// `JOBGATE_LOG_FORMAT` (`json` by default).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
