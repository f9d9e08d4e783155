use tracing_subscriber::EnvFilter;

/// Initialize tracing for the engine. Reads `RUST_LOG` when set, defaults to
/// `info` for the crate and `warn` elsewhere. Safe to call more than once;
/// later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,datapilot=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
