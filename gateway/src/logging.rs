use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
#[error("invalid log level {0:?}")]
pub struct InvalidLogLevel(pub String);

/// Initialise the global tracing subscriber from `LOG_LEVEL` and
/// `LOG_FORMAT`. `LOG_FORMAT=json` selects structured output for log
/// collectors, anything else renders human-readable text.
pub fn init_from_env() -> Result<(), InvalidLogLevel> {
	let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
	let filter =
		EnvFilter::try_new(&level).map_err(|_| InvalidLogLevel(level))?;

	let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
	if json {
		tracing_subscriber::fmt().with_env_filter(filter).json().init();
	} else {
		tracing_subscriber::fmt().with_env_filter(filter).init();
	}

	Ok(())
}
