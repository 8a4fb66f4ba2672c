//! Tracing setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an explicit log filter, e.g. `kiln=debug`.
pub const LOG_ENV: &str = "KILN_LOG";

/// Install the global subscriber.
///
/// `verbosity` maps repeated `-v` flags to a default level; `KILN_LOG`
/// overrides it entirely. Safe to call more than once (later calls are
/// no-ops), which keeps tests that share a process from panicking.
pub fn init(verbosity: u8) {
    let fallback = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
