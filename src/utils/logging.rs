/// Initialize tracing/logging for the application.
///
/// Uses a simple `with_max_level` configuration based on `level`; unknown
/// values fall back to `info`.
pub fn init(level: &str) {
    let lvl = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    // try_init so tests and the binary can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}
