//! Races a "domestic" and a "foreign" resolver pool and picks the
//! policy-preferred answer by geo-classifying the resulting addresses.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::error::DnsError;

/// External capability: classify an address as domestic or not. An oracle
/// error is treated as "not domestic" so the policy errs toward the foreign
/// answer.
#[async_trait]
pub trait GeoIpOracle: Send + Sync {
	async fn is_domestic(&self, ip: IpAddr) -> Result<bool, String>;
}

/// Default oracle when no external GeoIP database is configured: classifies
/// private, loopback and link-local ranges as domestic and everything else
/// as foreign. A real deployment should supply a database-backed oracle;
/// this keeps the splitter usable out of the box.
pub struct PrivateNetworkOracle;

#[async_trait]
impl GeoIpOracle for PrivateNetworkOracle {
	async fn is_domestic(&self, ip: IpAddr) -> Result<bool, String> {
		Ok(match ip {
			IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
			IpAddr::V6(v6) => v6.is_loopback(),
		})
	}
}

/// A pool of upstream servers tried in configured order until one returns
/// `NOERROR`.
#[derive(Debug, Clone)]
pub struct ServerPool {
	pub servers: Vec<std::net::SocketAddr>,
	pub use_tcp: bool,
}

impl ServerPool {
	pub fn new(servers: Vec<std::net::SocketAddr>, use_tcp: bool) -> Self {
		Self { servers, use_tcp }
	}
}

pub struct DnsSplitter {
	domestic: ServerPool,
	foreign: ServerPool,
	geoip: std::sync::Arc<dyn GeoIpOracle>,
	per_attempt_timeout: Duration,
	batch_concurrency: usize,
}

impl DnsSplitter {
	pub fn new(
		domestic: ServerPool,
		foreign: ServerPool,
		geoip: std::sync::Arc<dyn GeoIpOracle>,
		per_attempt_timeout: Duration,
		batch_concurrency: usize,
	) -> Self {
		Self { domestic, foreign, geoip, per_attempt_timeout, batch_concurrency }
	}

	pub async fn resolve(&self, name: &Name, qtype: RecordType) -> Result<Message, DnsError> {
		let domestic_reply = query_pool(&self.domestic, name, qtype, self.per_attempt_timeout).await;

		if let Ok(ref reply) = domestic_reply {
			if self.all_addresses_domestic(reply).await {
				return domestic_reply;
			}
		}

		let foreign_reply = query_pool(&self.foreign, name, qtype, self.per_attempt_timeout).await;
		match (foreign_reply, domestic_reply) {
			(Ok(reply), _) => Ok(reply),
			(Err(_), Ok(reply)) => Ok(reply),
			(Err(e), Err(_)) => Err(e),
		}
	}

	async fn all_addresses_domestic(&self, reply: &Message) -> bool {
		let mut addrs = Vec::new();
		for record in reply.answers() {
			match record.data() {
				Some(RData::A(a)) => addrs.push(IpAddr::V4((*a).into())),
				Some(RData::AAAA(aaaa)) => addrs.push(IpAddr::V6((*aaaa).into())),
				_ => {}
			}
		}
		if addrs.is_empty() {
			return false;
		}
		for addr in addrs {
			match self.geoip.is_domestic(addr).await {
				Ok(true) => continue,
				_ => return false,
			}
		}
		true
	}

	/// Resolves a batch of questions with bounded concurrency. Fails only if
	/// every question failed; returns successful responses in unspecified
	/// order.
	pub async fn resolve_batch(
		self: &Arc<Self>,
		questions: &[(Name, RecordType)],
	) -> Result<Vec<Message>, DnsError> {
		let semaphore = Arc::new(Semaphore::new(self.batch_concurrency.max(1)));
		let mut tasks = tokio::task::JoinSet::new();

		for (name, qtype) in questions.to_vec() {
			let this = self.clone();
			let permit = semaphore.clone().acquire_owned().await.unwrap();
			tasks.spawn(async move {
				let _permit = permit;
				this.resolve(&name, qtype).await
			});
		}

		let mut results = Vec::new();
		let mut any_ok = false;
		while let Some(joined) = tasks.join_next().await {
			if let Ok(Ok(msg)) = joined {
				any_ok = true;
				results.push(msg);
			}
		}

		if !any_ok && !questions.is_empty() {
			return Err(DnsError::AllServersFailed);
		}
		Ok(results)
	}
}

async fn query_pool(
	pool: &ServerPool,
	name: &Name,
	qtype: RecordType,
	per_attempt_timeout: Duration,
) -> Result<Message, DnsError> {
	for server in &pool.servers {
		for _attempt in 0..2 {
			let query = build_query(name, qtype);
			let result = if pool.use_tcp {
				timeout(per_attempt_timeout, query_tcp(*server, &query)).await
			} else {
				timeout(per_attempt_timeout, query_udp(*server, &query)).await
			};
			match result {
				Ok(Ok(reply)) if reply.response_code() == hickory_proto::op::ResponseCode::NoError => {
					return Ok(reply);
				}
				_ => continue,
			}
		}
	}
	Err(DnsError::AllServersFailed)
}

fn build_query(name: &Name, qtype: RecordType) -> Message {
	let mut msg = Message::new();
	msg.set_id(rand::random());
	msg.set_message_type(MessageType::Query);
	msg.set_op_code(OpCode::Query);
	msg.set_recursion_desired(true);
	msg.add_query(Query::query(name.clone(), qtype));
	msg
}

async fn query_udp(server: std::net::SocketAddr, query: &Message) -> Result<Message, DnsError> {
	use hickory_proto::serialize::binary::BinEncodable;
	let socket = UdpSocket::bind(if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;
	socket.connect(server).await?;
	let bytes = query.to_bytes().map_err(DnsError::Proto)?;
	socket.send(&bytes).await?;

	let mut buf = [0u8; 4096];
	let n = socket.recv(&mut buf).await?;
	Message::from_vec(&buf[..n]).map_err(DnsError::Proto)
}

async fn query_tcp(server: std::net::SocketAddr, query: &Message) -> Result<Message, DnsError> {
	use hickory_proto::serialize::binary::BinEncodable;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	let mut stream = TcpStream::connect(server).await?;
	let bytes = query.to_bytes().map_err(DnsError::Proto)?;
	let len = (bytes.len() as u16).to_be_bytes();
	stream.write_all(&len).await?;
	stream.write_all(&bytes).await?;

	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf).await?;
	let reply_len = u16::from_be_bytes(len_buf) as usize;
	let mut reply_buf = vec![0u8; reply_len];
	stream.read_exact(&mut reply_buf).await?;
	Message::from_vec(&reply_buf).map_err(DnsError::Proto)
}

#[cfg(test)]
mod tests {
	use super::*;

	struct StaticOracle {
		domestic: Vec<IpAddr>,
	}

	#[async_trait]
	impl GeoIpOracle for StaticOracle {
		async fn is_domestic(&self, ip: IpAddr) -> Result<bool, String> {
			Ok(self.domestic.contains(&ip))
		}
	}

	#[test]
	fn build_query_sets_recursion_desired() {
		let name = Name::from_ascii("example.com.").unwrap();
		let msg = build_query(&name, RecordType::A);
		assert!(msg.recursion_desired());
		assert_eq!(msg.queries().len(), 1);
	}
}
