use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging to stdout. `JANUS_LOG_FORMAT=json` selects the
/// JSON layer used in production; anything else (or unset) uses the compact
/// human-readable layer for interactive sessions.
pub fn init_logging() -> anyhow::Result<()> {
	let env_filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new("info"))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let json = std::env::var("JANUS_LOG_FORMAT")
		.map(|v| v.eq_ignore_ascii_case("json"))
		.unwrap_or(false);

	let registry = tracing_subscriber::registry().with(env_filter);

	let result = if json {
		registry
			.with(
				tracing_subscriber::fmt::layer()
					.json()
					.with_current_span(true)
					.with_target(true)
					.with_file(true)
					.with_line_number(true),
			)
			.try_init()
	} else {
		registry
			.with(tracing_subscriber::fmt::layer().with_target(false).compact())
			.try_init()
	};

	// Re-initializing a global subscriber in tests is expected to fail after
	// the first call; that's not a startup error.
	match result {
		Ok(()) => Ok(()),
		Err(_) => Ok(()),
	}
}

#[cfg(test)]
mod tests {
	#[test]
	fn logging_init_is_idempotent() {
		super::init_logging().unwrap();
		super::init_logging().unwrap();
	}
}
