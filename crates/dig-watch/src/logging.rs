use std::io;
use tracing_subscriber::EnvFilter;

/// Stdout carries snapshot output, so logs go to stderr when enabled and are
/// discarded otherwise. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(stderr_enabled: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if stderr_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
