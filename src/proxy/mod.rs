//! Per-connection orchestration: SNI peek, leaf cert mint, dual TLS
//! handshake, and an inspected bidirectional relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustls::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::inspect::{Direction, InspectorChain, RequestIdGenerator, relay_with_tee};
use crate::tls::{SniError, SiteCertManager, peek_sni};

/// External dial capability so an inspection proxy can be interposed between
/// this process and the real origin without changing the connection handler.
#[async_trait::async_trait]
pub trait UpstreamDialer: Send + Sync {
	fn is_enabled(&self) -> bool;
	async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream>;
}

pub struct DirectDialer;

#[async_trait::async_trait]
impl UpstreamDialer for DirectDialer {
	fn is_enabled(&self) -> bool {
		false
	}

	async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
		TcpStream::connect((host, port)).await
	}
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct ConnectionHandler {
	pub certs: Arc<SiteCertManager>,
	pub chain: Arc<InspectorChain>,
	pub upstream_client_config: Arc<rustls::ClientConfig>,
	pub dialer: Arc<dyn UpstreamDialer>,
}

impl ConnectionHandler {
	/// Handles one accepted client socket whose original destination was
	/// `original_dest` before transparent redirection.
	pub async fn handle(&self, client: TcpStream, original_dest: SocketAddr) {
		let connection_id = format!("c{}", NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));

		if let Err(err) = self.handle_inner(client, original_dest, &connection_id).await {
			tracing::warn!(connection_id = %connection_id, error = %err, "connection terminated");
		}
	}

	async fn handle_inner(&self, client: TcpStream, original_dest: SocketAddr, connection_id: &str) -> anyhow::Result<()> {
		let hostname = match peek_sni(&client).await {
			Ok(name) => name,
			Err(SniError::Truncated) => return Err(anyhow::anyhow!("client hello truncated before SNI could be read")),
			Err(_) => original_dest.ip().to_string(),
		};

		let leaf = self.certs.get_certificate(&hostname).await?;
		let server_config = crate::tls_utils::build_mitm_server_config(
			vec![rustls::Certificate(leaf.leaf_der.clone()), rustls::Certificate(parse_ca_der(&leaf.chain_pem)?)],
			rustls::PrivateKey(leaf.leaf_key_der.clone()),
		)?;
		let acceptor = TlsAcceptor::from(server_config);

		let upstream = if self.dialer.is_enabled() {
			self.dialer.connect(&hostname, original_dest.port()).await?
		} else {
			TcpStream::connect(original_dest).await?
		};

		let server_name = ServerName::try_from(hostname.as_str()).unwrap_or_else(|_| ServerName::IpAddress(original_dest.ip()));
		let connector = TlsConnector::from(self.upstream_client_config.clone());

		let (client_tls, upstream_tls) =
			tokio::try_join!(acceptor.accept(client), connector.connect(server_name, upstream))?;

		let (client_read, client_write) = tokio::io::split(client_tls);
		let (upstream_read, upstream_write) = tokio::io::split(upstream_tls);

		let request_ids = Arc::new(RequestIdGenerator::new(connection_id.to_string()));
		let chain = self.chain.clone();

		let hostname_up = hostname.clone();
		let connection_id_up = connection_id.to_string();
		let request_ids_up = request_ids.clone();
		let chain_up = chain.clone();
		let to_upstream = tokio::spawn(async move {
			relay_with_tee(client_read, upstream_write, &chain_up, Direction::ClientToServer, &hostname_up, &connection_id_up, &request_ids_up).await
		});

		let hostname_down = hostname.clone();
		let connection_id_down = connection_id.to_string();
		let to_client = tokio::spawn(async move {
			relay_with_tee(upstream_read, client_write, &chain, Direction::ServerToClient, &hostname_down, &connection_id_down, &request_ids).await
		});

		let _ = tokio::join!(to_upstream, to_client);
		Ok(())
	}
}

fn parse_ca_der(chain_pem: &str) -> anyhow::Result<Vec<u8>> {
	let mut certs = rustls_pemfile::certs(&mut chain_pem.as_bytes())?;
	if certs.len() < 2 {
		anyhow::bail!("site certificate chain missing CA certificate");
	}
	Ok(certs.remove(1))
}
