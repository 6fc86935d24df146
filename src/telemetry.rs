use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "paygate=info";

/// Installs the global fmt subscriber, honouring `RUST_LOG`. Logs go to
/// stderr so stdout stays free for command output. Calling it twice is a
/// no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
