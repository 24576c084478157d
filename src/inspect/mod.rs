//! Ordered inspector chain plus the read-only observational tee that feeds
//! relayed bytes to it. Inspectors may only observe or drop a flow; the
//! byte-rewriting path some legacy inspectors once used is not carried
//! forward here — bytes relayed to the peer always equal the bytes read
//! from the source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	ClientToServer,
	ServerToClient,
}

impl Direction {
	pub fn as_str(&self) -> &'static str {
		match self {
			Direction::ClientToServer => "request",
			Direction::ServerToClient => "response",
		}
	}
}

#[derive(Debug, Clone)]
pub struct InspectContext {
	pub direction: Direction,
	pub hostname: String,
	pub connection_id: String,
	pub request_id: String,
}

pub enum InspectOutcome {
	Continue,
	Drop,
}

#[async_trait]
pub trait Inspector: Send + Sync {
	fn name(&self) -> &str;
	fn should_inspect(&self, hostname: &str) -> bool;
	async fn inspect(&self, ctx: &InspectContext, data: &[u8]) -> InspectOutcome;
}

#[derive(Default)]
pub struct InspectorChain {
	inspectors: Vec<Arc<dyn Inspector>>,
}

impl InspectorChain {
	pub fn new() -> Self {
		Self { inspectors: Vec::new() }
	}

	pub fn register(&mut self, inspector: Arc<dyn Inspector>) {
		self.inspectors.push(inspector);
	}

	pub fn should_inspect(&self, hostname: &str) -> bool {
		self.inspectors.iter().any(|i| i.should_inspect(hostname))
	}

	/// Applies every registered inspector in order. A `Drop` from any
	/// inspector severs the connection; any other error is logged and the
	/// remaining inspectors still run.
	pub async fn apply(&self, ctx: &InspectContext, data: &[u8]) -> InspectOutcome {
		for inspector in &self.inspectors {
			if !inspector.should_inspect(&ctx.hostname) {
				continue;
			}
			match inspector.inspect(ctx, data).await {
				InspectOutcome::Drop => {
					tracing::info!(inspector = inspector.name(), hostname = %ctx.hostname, "inspector dropped connection");
					return InspectOutcome::Drop;
				}
				InspectOutcome::Continue => {}
			}
		}
		InspectOutcome::Continue
	}
}

/// `connection_id`-scoped request id allocator. `next()` is called by the
/// tee when client-to-server bytes begin with an HTTP request start-line;
/// `current()` is used for every other batch (server-to-client bytes, and
/// client-to-server bytes that are a continuation of an in-flight request).
pub struct RequestIdGenerator {
	connection_id: String,
	seq: AtomicU64,
}

impl RequestIdGenerator {
	pub fn new(connection_id: impl Into<String>) -> Self {
		Self { connection_id: connection_id.into(), seq: AtomicU64::new(0) }
	}

	pub fn next(&self) -> String {
		let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
		format!("{}-{}", self.connection_id, n)
	}

	pub fn current(&self) -> String {
		let n = self.seq.load(Ordering::SeqCst).max(1);
		format!("{}-{}", self.connection_id, n)
	}
}

const TEE_BUF_SIZE: usize = 16 * 1024;

fn looks_like_request_start(data: &[u8]) -> bool {
	const METHODS: &[&[u8]] =
		&[b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT "];
	METHODS.iter().any(|m| data.starts_with(m))
}

/// Reads from `source`, writes the untouched bytes to `sink`, and — when the
/// chain has at least one inspector interested in `hostname` — tees a copy
/// through the chain first. Returns when the source reaches EOF or errors.
pub async fn relay_with_tee<R, W>(
	mut source: R,
	mut sink: W,
	chain: &InspectorChain,
	direction: Direction,
	hostname: &str,
	connection_id: &str,
	request_ids: &RequestIdGenerator,
) -> std::io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let interested = chain.should_inspect(hostname);
	let mut buf = vec![0u8; TEE_BUF_SIZE];

	loop {
		let n = source.read(&mut buf).await?;
		if n == 0 {
			break;
		}

		if interested {
			let request_id = match direction {
				Direction::ClientToServer if looks_like_request_start(&buf[..n]) => request_ids.next(),
				_ => request_ids.current(),
			};
			let ctx = InspectContext {
				direction,
				hostname: hostname.to_string(),
				connection_id: connection_id.to_string(),
				request_id,
			};
			if matches!(chain.apply(&ctx, &buf[..n]).await, InspectOutcome::Drop) {
				sink.shutdown().await.ok();
				return Ok(());
			}
		}

		sink.write_all(&buf[..n]).await?;
	}

	sink.shutdown().await.ok();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	struct DropperInspector;

	#[async_trait]
	impl Inspector for DropperInspector {
		fn name(&self) -> &str {
			"dropper"
		}
		fn should_inspect(&self, hostname: &str) -> bool {
			hostname == "blocked.example"
		}
		async fn inspect(&self, _ctx: &InspectContext, _data: &[u8]) -> InspectOutcome {
			InspectOutcome::Drop
		}
	}

	struct RecordingInspector {
		seen: Arc<std::sync::Mutex<Vec<String>>>,
	}

	#[async_trait]
	impl Inspector for RecordingInspector {
		fn name(&self) -> &str {
			"recorder"
		}
		fn should_inspect(&self, _hostname: &str) -> bool {
			true
		}
		async fn inspect(&self, ctx: &InspectContext, _data: &[u8]) -> InspectOutcome {
			self.seen.lock().unwrap().push(ctx.request_id.clone());
			InspectOutcome::Continue
		}
	}

	#[test]
	fn request_id_generator_next_advances_current_does_not() {
		let r#gen = RequestIdGenerator::new("c1");
		assert_eq!(r#gen.next(), "c1-1");
		assert_eq!(r#gen.current(), "c1-1");
		assert_eq!(r#gen.next(), "c1-2");
		assert_eq!(r#gen.current(), "c1-2");
	}

	#[tokio::test]
	async fn pass_through_bytes_are_unchanged_when_no_inspector_interested() {
		let (mut client, server) = duplex(1024);
		let (server_read, server_write) = tokio::io::split(server);
		let chain = InspectorChain::new();
		let r#gen = RequestIdGenerator::new("c1");

		client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
		drop(client);

		let sink = tokio::io::sink();
		relay_with_tee(server_read, sink, &chain, Direction::ClientToServer, "example.com", "c1", &r#gen)
			.await
			.unwrap();
		drop(server_write);
	}

	#[tokio::test]
	async fn dropper_inspector_severs_relay() {
		let (mut client, server) = duplex(1024);
		let (server_read, _server_write) = tokio::io::split(server);
		let mut chain = InspectorChain::new();
		chain.register(Arc::new(DropperInspector));
		let r#gen = RequestIdGenerator::new("c1");

		client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

		let sink = tokio::io::sink();
		relay_with_tee(server_read, sink, &chain, Direction::ClientToServer, "blocked.example", "c1", &r#gen)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn request_start_line_allocates_new_request_id() {
		let (mut client, server) = duplex(1024);
		let (server_read, _server_write) = tokio::io::split(server);
		let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
		let mut chain = InspectorChain::new();
		chain.register(Arc::new(RecordingInspector { seen: seen.clone() }));
		let r#gen = RequestIdGenerator::new("c1");

		client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
		drop(client);

		let sink = tokio::io::sink();
		relay_with_tee(server_read, sink, &chain, Direction::ClientToServer, "example.com", "c1", &r#gen)
			.await
			.unwrap();

		assert_eq!(seen.lock().unwrap().as_slice(), &["c1-1".to_string()]);
	}
}
