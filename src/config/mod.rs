//! Layered process configuration: hard-coded defaults, an optional TOML file,
//! then `JANUS_`-prefixed environment variables. Flag/CLI parsing around this
//! struct is an external collaborator; `Settings::load` is the in-scope entry
//! point both `main` and tests use.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
	pub dns_listen_addr: String,
	pub mitm_listen_addr: String,
	pub domestic_servers: Vec<String>,
	pub foreign_servers: Vec<String>,
	pub foreign_uses_tcp: bool,
	pub dns_batch_concurrency: usize,
	pub dns_cache_max_size: usize,
	pub dns_cache_default_ttl_secs: u64,
	pub dns_query_timeout_secs: u64,
	pub dns_server_budget_secs: u64,
	pub stats_cleanup_interval_secs: u64,
	pub stats_retention_secs: u64,

	pub ca_dir: PathBuf,
	pub ca_validity_days: i64,

	pub site_cache_dir: PathBuf,
	pub site_validity_secs: u64,

	pub max_body_size: usize,
	pub event_history_size: usize,
	pub subscriber_queue_capacity: usize,

	pub upstream_insecure_tls: bool,
	pub anthropic_compat_hosts: Vec<String>,
	pub openai_compat_hosts: Vec<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			dns_listen_addr: "0.0.0.0:5353".into(),
			mitm_listen_addr: "0.0.0.0:10443".into(),
			domestic_servers: vec!["114.114.114.114:53".into()],
			foreign_servers: vec!["8.8.8.8:53".into()],
			foreign_uses_tcp: false,
			dns_batch_concurrency: 10,
			dns_cache_max_size: 10_000,
			dns_cache_default_ttl_secs: 300,
			dns_query_timeout_secs: 5,
			dns_server_budget_secs: 10,
			stats_cleanup_interval_secs: 300,
			stats_retention_secs: 7 * 24 * 3600,

			ca_dir: PathBuf::from("./data/ca"),
			ca_validity_days: 365,

			site_cache_dir: PathBuf::from("./data/certs"),
			site_validity_secs: 7 * 24 * 3600,

			max_body_size: 1024 * 1024,
			event_history_size: 1000,
			subscriber_queue_capacity: 100,

			upstream_insecure_tls: false,
			anthropic_compat_hosts: vec!["api.anthropic.com".into()],
			openai_compat_hosts: vec!["api.openai.com".into()],
		}
	}
}

impl Settings {
	/// Layer defaults, an optional TOML file, then `JANUS_`-prefixed
	/// environment variables (e.g. `JANUS_DNS_LISTEN_ADDR`).
	pub fn load(file: Option<&std::path::Path>) -> anyhow::Result<Self> {
		let mut builder = config::Config::builder()
			.add_source(config::Config::try_from(&Settings::default())?);

		if let Some(path) = file {
			builder = builder.add_source(config::File::from(path).required(false));
		}

		builder = builder.add_source(
			config::Environment::with_prefix("JANUS")
				.separator("_")
				.try_parsing(true)
				.list_separator(","),
		);

		let settings: Settings = builder.build()?.try_deserialize()?;
		Ok(settings)
	}

	pub fn dns_query_timeout(&self) -> Duration {
		Duration::from_secs(self.dns_query_timeout_secs)
	}

	pub fn site_validity(&self) -> Duration {
		Duration::from_secs(self.site_validity_secs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_load_without_a_file() {
		let settings = Settings::load(None).unwrap();
		assert_eq!(settings.dns_cache_max_size, 10_000);
		assert!(!settings.domestic_servers.is_empty());
	}

	#[test]
	fn env_override_wins_over_default() {
		unsafe {
			std::env::set_var("JANUS_DNS_CACHE_MAX_SIZE", "42");
		}
		let settings = Settings::load(None).unwrap();
		unsafe {
			std::env::remove_var("JANUS_DNS_CACHE_MAX_SIZE");
		}
		assert_eq!(settings.dns_cache_max_size, 42);
	}
}
