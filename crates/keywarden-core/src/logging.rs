//! Logger bootstrap used by every binary.

use env_logger::Env;

/// Initialise the process-wide logger.
///
/// `RUST_LOG` overrides `default_filter`. Safe to call more than once; later
/// calls are no-ops.
pub fn init(default_filter: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .try_init();
}
