use {
    switchyard_config::{LogFormat, LoggingConfig},
    tracing_subscriber::EnvFilter,
};

/// `RUST_LOG` wins; otherwise `fallback` (a filter directive such as `info`).
pub fn filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean
/// for command output.
pub fn init(config: &LoggingConfig) {
    let filter = filter(&config.level);
    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
