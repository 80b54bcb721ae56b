use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber` filtered by `SPILLWAY_LOG`, then `RUST_LOG`, then `info`.
///
/// Logs go to stderr so stdout stays free for emitted checkpoints.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SPILLWAY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
