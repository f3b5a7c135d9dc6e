use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber with the given default level.
/// `RUST_LOG` overrides the level when set. Safe to call more than once;
/// later calls are no-ops.
pub fn initialize_tracing(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
