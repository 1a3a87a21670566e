use tracing_subscriber::EnvFilter;

/// Install the process-wide fmt subscriber.
///
/// `RUST_LOG` wins over `default_level`. Calling this more than once is a
/// no-op, so tests and embedding hosts can call it freely.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Map a verbosity count (`-v`, `-vv`) onto a filter level.
pub fn level_for_verbosity(base: &str, verbose: u8) -> String {
    match verbose {
        0 => base.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}
