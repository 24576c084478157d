pub mod config;
pub mod dns;
pub mod error;
pub mod events;
pub mod http;
pub mod inspect;
pub mod llm;
pub mod mitm;
pub mod observability;
pub mod proxy;
pub mod tls;
pub mod tls_utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioResolver;

use crate::config::Settings;
use crate::dns::{DnsCache, DnsHandler, DnsServer, DnsSplitter, PrivateNetworkOracle, Resolver, ServerPool, StatsCollector};
use crate::mitm::MitmManager;

/// Composition root: loads configuration, wires the DNS front-end and the
/// MITM back-end, and runs until either side fails or the process receives
/// a shutdown signal.
pub async fn run(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
	let settings = Settings::load(config_path)?;
	observability::init_observability()?;
	tracing::info!(dns_listen = %settings.dns_listen_addr, mitm_listen = %settings.mitm_listen_addr, "starting");

	let dns_server = start_dns(&settings).await?;
	let mitm_manager = Arc::new(MitmManager::new(&settings)?);
	let mitm_listen_addr = settings.mitm_listen_addr.clone();

	let mitm_task = tokio::spawn(run_mitm_listener(mitm_manager, mitm_listen_addr));
	let dns_task = tokio::spawn(dns_server.block_until_done());

	tokio::select! {
		result = mitm_task => result??,
		result = dns_task => result??,
	}

	Ok(())
}

async fn start_dns(settings: &Settings) -> anyhow::Result<DnsServer> {
	let cache = Arc::new(DnsCache::new(settings.dns_cache_max_size, Duration::from_secs(settings.dns_cache_default_ttl_secs)));
	let stats = Arc::new(StatsCollector::start_with_cleanup(
		1024,
		Some((Duration::from_secs(settings.stats_cleanup_interval_secs), Duration::from_secs(settings.stats_retention_secs))),
	));

	let resolver = if settings.domestic_servers.is_empty() {
		Resolver::SystemDefault(Arc::new(TokioResolver::builder_tokio()?.build()))
	} else {
		let domestic = ServerPool::new(parse_addrs(&settings.domestic_servers), false);
		let foreign = ServerPool::new(parse_addrs(&settings.foreign_servers), settings.foreign_uses_tcp);
		let splitter = DnsSplitter::new(domestic, foreign, Arc::new(PrivateNetworkOracle), settings.dns_query_timeout(), settings.dns_batch_concurrency);
		Resolver::Split(Arc::new(splitter))
	};

	let handler = DnsHandler::new(cache, resolver, stats, Duration::from_secs(settings.dns_server_budget_secs));
	DnsServer::bind(&settings.dns_listen_addr, handler).await
}

fn parse_addrs(raw: &[String]) -> Vec<SocketAddr> {
	raw.iter().filter_map(|s| s.parse().ok()).collect()
}

async fn run_mitm_listener(manager: Arc<MitmManager>, listen_addr: String) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
	tracing::info!(addr = %listen_addr, "mitm listener bound");

	loop {
		let (client, _peer_addr) = listener.accept().await?;
		if !manager.enabled() {
			continue;
		}
		// TODO: recover the pre-redirect destination via SO_ORIGINAL_DST on
		// Linux netfilter setups; local_addr is a placeholder for non-transparent
		// deployments where the listener is dialed directly.
		let original_dest = client.local_addr()?;
		let handler = manager.connection_handler();
		tokio::spawn(async move {
			handler.handle(client, original_dest).await;
		});
	}
}
