use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Logs go to stderr; the default
/// level is INFO, overridable through `RUST_LOG`.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
		)
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}
