//! Logging for the bqdeploy workspace
//!
//! Every crate logs through the macros re-exported here so that one
//! environment variable controls the whole pipeline.
//!
//! Usage:
//! - Set BQDEPLOY_LOG=off (default) - no logs
//! - Set BQDEPLOY_LOG=info - one line per stage and warehouse call
//! - Set BQDEPLOY_LOG=debug - rendered SQL, request URLs, row counts

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable selecting the minimum level
pub const LOG_ENV: &str = "BQDEPLOY_LOG";

static INIT: Once = Once::new();

/// Map a `BQDEPLOY_LOG` value to a level, `None` meaning logging is off.
///
/// Unknown values fall back to `Info` so that a typo in CI still produces
/// output rather than silence.
pub fn parse_level(value: &str) -> Option<emit::Level> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "" => None,
        "debug" => Some(emit::Level::Debug),
        "info" => Some(emit::Level::Info),
        "warn" => Some(emit::Level::Warn),
        "error" => Some(emit::Level::Error),
        _ => Some(emit::Level::Info),
    }
}

/// Initialize diagnostics based on the BQDEPLOY_LOG environment variable
///
/// Safe to call multiple times; only the first call has an effect.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let log_level = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());

        let Some(level) = parse_level(&log_level) else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime must outlive every emitting thread.
        std::mem::forget(rt);
    });
}

/// Log pipeline progress: stage transitions, tables created, rows loaded
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics: rendered statements, HTTP endpoints, batch sizes
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable conditions such as a retried warehouse call
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log the failure that terminates a run
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;
