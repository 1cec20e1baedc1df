#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

/// Installs the stderr `fmt` subscriber. `RUST_LOG` wins over `verbose`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
