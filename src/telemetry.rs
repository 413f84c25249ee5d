//! Tracing subscriber setup.
//!
//! Verbosity maps onto an `EnvFilter` default which `FSWATCHD_LOG`
//! can always override.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `verbose` counts `-v` flags: 0 = info, 1 = debug, 2+ = trace.
pub fn init(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "fswatchd=debug,info",
        _ => "fswatchd=trace,debug",
    };

    let filter = EnvFilter::try_from_env("FSWATCHD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
