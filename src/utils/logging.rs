use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing with an env-filter, defaulting to info level
/// with the noisier dependencies turned down.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn,tower_http=warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
