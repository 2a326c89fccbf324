use tracing_subscriber::EnvFilter;

/// Install the subscriber shared by the `docq` CLI and `docq-server`.
///
/// Queue operations emit spans named after the operation (`send`, `get`,
/// `ack`, ...) carrying the queue name, and the stores log column family and
/// index creation at `debug`. Set `RUST_LOG=docq_core=debug` to see claim
/// attempts. The default level is `info`.
///
/// Everything goes to stderr so `docq get` can print messages on stdout.
/// Debug builds print human-readable lines, release builds print JSON.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }
}
