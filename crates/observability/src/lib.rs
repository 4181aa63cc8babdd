//! Process-wide tracing setup for workers and tools.

/// Initialize process-wide tracing.
///
/// JSON output unless `INKWELL_LOG_FORMAT=pretty`.
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("INKWELL_LOG_FORMAT").ok();
    tracing::init(LogFormat::from_env_value(format.as_deref()));
}

pub use tracing::LogFormat;

/// Tracing configuration (filters, output format).
pub mod tracing;
