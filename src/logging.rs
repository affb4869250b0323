use tracing_subscriber::{fmt, EnvFilter};

/// Diagnostics go to stderr; stdout carries records only.
/// `RUST_LOG` wins over `--debug`.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},tgpipe={default_level}")));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}
