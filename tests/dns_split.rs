//! End-to-end exercises of the DNS splitter against real loopback UDP
//! "servers" that answer with canned A records.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use janus_gate::dns::{DnsSplitter, GeoIpOracle, ServerPool};
use tokio::net::UdpSocket;

struct MapOracle {
	domestic: Vec<IpAddr>,
}

#[async_trait]
impl GeoIpOracle for MapOracle {
	async fn is_domestic(&self, ip: IpAddr) -> Result<bool, String> {
		Ok(self.domestic.contains(&ip))
	}
}

/// Answers every query received on `socket` with `ip` until `rounds`
/// datagrams have been served.
async fn spawn_fake_server(socket: UdpSocket, ip: Ipv4Addr, rounds: usize) {
	tokio::spawn(async move {
		let mut buf = [0u8; 512];
		for _ in 0..rounds {
			let Ok((n, peer)) = socket.recv_from(&mut buf).await else { return };
			let Ok(query) = Message::from_vec(&buf[..n]) else { continue };

			let mut reply = Message::new();
			reply.set_id(query.id());
			reply.set_message_type(MessageType::Response);
			reply.set_response_code(ResponseCode::NoError);
			if let Some(q) = query.queries().first() {
				reply.add_query(q.clone());
				let mut record = Record::new();
				record.set_name(q.name().clone());
				record.set_record_type(RecordType::A);
				record.set_ttl(60);
				record.set_data(Some(RData::A(A::new(ip.octets()[0], ip.octets()[1], ip.octets()[2], ip.octets()[3]))));
				reply.add_answer(record);
			}

			let bytes = reply.to_bytes().unwrap();
			let _ = socket.send_to(&bytes, peer).await;
		}
	});
}

async fn bind_loopback() -> (UdpSocket, std::net::SocketAddr) {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	(socket, addr)
}

#[tokio::test]
async fn domestic_answer_short_circuits_foreign_pool() {
	let (domestic_socket, domestic_addr) = bind_loopback().await;
	let (foreign_socket, foreign_addr) = bind_loopback().await;

	let domestic_ip = Ipv4Addr::new(1, 2, 3, 4);
	spawn_fake_server(domestic_socket, domestic_ip, 1).await;
	// The foreign server would answer with an address the oracle treats as
	// foreign, but it must never be consulted for a domestic hit.
	spawn_fake_server(foreign_socket, Ipv4Addr::new(8, 8, 8, 8), 0).await;

	let oracle = Arc::new(MapOracle { domestic: vec![IpAddr::V4(domestic_ip)] });
	let splitter = DnsSplitter::new(
		ServerPool::new(vec![domestic_addr], false),
		ServerPool::new(vec![foreign_addr], false),
		oracle,
		Duration::from_secs(2),
		4,
	);

	let name = Name::from_ascii("example.cn.").unwrap();
	let reply = splitter.resolve(&name, RecordType::A).await.unwrap();

	let answered_ip = match reply.answers()[0].data() {
		Some(RData::A(a)) => Ipv4Addr::from(*a),
		_ => panic!("expected an A record"),
	};
	assert_eq!(answered_ip, domestic_ip);
}

#[tokio::test]
async fn foreign_address_from_domestic_pool_falls_through() {
	let (domestic_socket, domestic_addr) = bind_loopback().await;
	let (foreign_socket, foreign_addr) = bind_loopback().await;

	let foreign_ip = Ipv4Addr::new(8, 8, 8, 8);
	// Domestic pool answers, but with an address the oracle classifies as
	// foreign, so the splitter must still consult the foreign pool.
	spawn_fake_server(domestic_socket, foreign_ip, 1).await;
	spawn_fake_server(foreign_socket, foreign_ip, 1).await;

	let oracle = Arc::new(MapOracle { domestic: vec![IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))] });
	let splitter = DnsSplitter::new(
		ServerPool::new(vec![domestic_addr], false),
		ServerPool::new(vec![foreign_addr], false),
		oracle,
		Duration::from_secs(2),
		4,
	);

	let name = Name::from_ascii("example.com.").unwrap();
	let reply = splitter.resolve(&name, RecordType::A).await.unwrap();

	let answered_ip = match reply.answers()[0].data() {
		Some(RData::A(a)) => Ipv4Addr::from(*a),
		_ => panic!("expected an A record"),
	};
	assert_eq!(answered_ip, foreign_ip);
}
