pub mod logging;

pub use logging::init_logging;

/// Initialize process-wide observability. Currently this is just structured
/// logging; metrics and distributed tracing export are external collaborators.
pub fn init_observability() -> anyhow::Result<()> {
	init_logging()?;
	tracing::info!(component = "observability", "structured logging initialized");
	Ok(())
}
