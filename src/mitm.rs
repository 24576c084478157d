//! Wires the CA manager, site-cert manager, inspector chain and event bus
//! into one handle the listener hands off to per accepted connection.

use std::sync::Arc;

use crate::config::Settings;
use crate::events::EventBus;
use crate::inspect::InspectorChain;
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::LlmInspector;
use crate::proxy::{ConnectionHandler, DirectDialer, UpstreamDialer};
use crate::tls::{CaManager, SiteCertManager};

pub struct MitmManager {
	ca: Arc<CaManager>,
	certs: Arc<SiteCertManager>,
	chain: Arc<InspectorChain>,
	bus: Arc<EventBus>,
	enabled: std::sync::atomic::AtomicBool,
	handler: ConnectionHandler,
}

impl MitmManager {
	pub fn new(settings: &Settings) -> anyhow::Result<Self> {
		let ca = Arc::new(CaManager::load_or_create(
			settings.ca_dir.join("ca.crt"),
			settings.ca_dir.join("ca.key"),
			std::time::Duration::from_secs(settings.ca_validity_days as u64 * 24 * 3600),
		)?);

		let certs = Arc::new(SiteCertManager::new(ca.clone(), &settings.site_cache_dir, settings.site_validity()));

		let bus = Arc::new(EventBus::new(settings.event_history_size, settings.subscriber_queue_capacity));

		let providers: Vec<Arc<dyn crate::llm::LlmProvider>> = vec![
			Arc::new(AnthropicProvider::new(settings.anthropic_compat_hosts.clone())),
			Arc::new(OpenAiProvider::new(settings.openai_compat_hosts.clone())),
		];
		let llm_inspector = Arc::new(LlmInspector::new(settings.max_body_size, bus.clone(), providers));

		let mut chain = InspectorChain::new();
		chain.register(llm_inspector);
		let chain = Arc::new(chain);

		// Built once at startup: `build_upstream_client_config` reads the OS
		// trust store from disk, which must not happen on every accepted
		// connection.
		let upstream_client_config = crate::tls_utils::build_upstream_client_config(settings.upstream_insecure_tls)?;
		let handler = ConnectionHandler {
			certs: certs.clone(),
			chain: chain.clone(),
			upstream_client_config,
			dialer: Arc::new(DirectDialer) as Arc<dyn UpstreamDialer>,
		};

		Ok(Self { ca, certs, chain, bus, enabled: std::sync::atomic::AtomicBool::new(true), handler })
	}

	pub fn ca(&self) -> &Arc<CaManager> {
		&self.ca
	}

	pub fn certs(&self) -> &Arc<SiteCertManager> {
		&self.certs
	}

	pub fn chain(&self) -> &Arc<InspectorChain> {
		&self.chain
	}

	pub fn bus(&self) -> &Arc<EventBus> {
		&self.bus
	}

	pub fn enabled(&self) -> bool {
		self.enabled.load(std::sync::atomic::Ordering::Relaxed)
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
	}

	/// Returns the shared connection handler, cloning only the `Arc`-wrapped
	/// state it holds rather than rebuilding the upstream TLS client config.
	pub fn connection_handler(&self) -> ConnectionHandler {
		self.handler.clone()
	}
}
