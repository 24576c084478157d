//! Parses a TLS ClientHello to extract the `server_name` extension without
//! consuming bytes from the client stream: `TcpStream::peek` never advances
//! the socket's read cursor, so the same prefix is still visible to whatever
//! reads the stream next (the TLS handshake layer).

use thiserror::Error;
use tokio::net::TcpStream;

const MAX_PEEK: usize = 16 * 1024;
const MIN_SHORT_PEEK: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
	#[error("not a TLS handshake record")]
	NotHandshake,
	#[error("not a ClientHello message")]
	NotClientHello,
	#[error("truncated ClientHello")]
	Truncated,
	#[error("no server_name extension present")]
	NoServerName,
}

/// Peeks up to 16 KiB from `stream` and extracts the SNI hostname, if any.
pub async fn peek_sni(stream: &TcpStream) -> Result<String, SniError> {
	let mut buf = vec![0u8; MAX_PEEK];
	let n = stream.peek(&mut buf).await.map_err(|_| SniError::Truncated)?;
	if n < MIN_SHORT_PEEK && n < MAX_PEEK {
		return Err(SniError::Truncated);
	}
	extract_sni(&buf[..n])
}

/// Extract SNI hostname from a TLS ClientHello message.
pub fn extract_sni(buf: &[u8]) -> Result<String, SniError> {
	// Record header: type(1) + version(2) + length(2)
	if buf.len() < 5 {
		return Err(SniError::Truncated);
	}
	if buf[0] != 0x16 {
		return Err(SniError::NotHandshake);
	}
	let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
	let handshake = &buf[5..buf.len().min(5 + record_len)];

	// Handshake header: type(1) + length(3)
	if handshake.len() < 4 {
		return Err(SniError::Truncated);
	}
	if handshake[0] != 0x01 {
		return Err(SniError::NotClientHello);
	}
	let hs_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
	let client_hello = &handshake[4..handshake.len().min(4 + hs_len)];

	// version(2) + random(32)
	if client_hello.len() < 34 {
		return Err(SniError::Truncated);
	}
	let mut pos = 34;

	// session_id
	if pos >= client_hello.len() {
		return Err(SniError::Truncated);
	}
	let session_id_len = client_hello[pos] as usize;
	pos += 1 + session_id_len;

	// cipher_suites
	if pos + 2 > client_hello.len() {
		return Err(SniError::Truncated);
	}
	let cipher_suites_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
	pos += 2 + cipher_suites_len;

	// compression_methods
	if pos >= client_hello.len() {
		return Err(SniError::Truncated);
	}
	let compression_len = client_hello[pos] as usize;
	pos += 1 + compression_len;

	// extensions
	if pos + 2 > client_hello.len() {
		return Err(SniError::Truncated);
	}
	let extensions_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
	pos += 2;
	let extensions_end = pos + extensions_len.min(client_hello.len().saturating_sub(pos));

	while pos + 4 <= extensions_end {
		let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
		let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
		pos += 4;

		if ext_type == 0x0000 {
			// server_name_list_length(2) + server_name_type(1) + host_name_length(2) + host_name
			if ext_len >= 5 && pos + ext_len <= extensions_end {
				let name_type = client_hello[pos + 2];
				if name_type == 0x00 {
					let name_len =
						u16::from_be_bytes([client_hello[pos + 3], client_hello[pos + 4]]) as usize;
					if pos + 5 + name_len <= extensions_end {
						let name = &client_hello[pos + 5..pos + 5 + name_len];
						return String::from_utf8(name.to_vec()).map_err(|_| SniError::NoServerName);
					}
				}
			}
			return Err(SniError::NoServerName);
		}

		pos += ext_len;
	}

	Err(SniError::NoServerName)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
		let name = hostname.as_bytes();
		let mut server_name_ext = vec![0x00, 0x00]; // extension type SNI
		let name_list_len = 3 + name.len();
		server_name_ext.extend_from_slice(&((name_list_len + 2) as u16).to_be_bytes()); // ext len
		server_name_ext.extend_from_slice(&(name_list_len as u16).to_be_bytes()); // server_name_list len
		server_name_ext.push(0x00); // name_type host_name
		server_name_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
		server_name_ext.extend_from_slice(name);

		let mut client_hello = vec![0x03, 0x03]; // version
		client_hello.extend_from_slice(&[0u8; 32]); // random
		client_hello.push(0x00); // session_id len
		client_hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher_suites
		client_hello.push(0x01); // compression methods len
		client_hello.push(0x00);
		client_hello.extend_from_slice(&(server_name_ext.len() as u16).to_be_bytes());
		client_hello.extend_from_slice(&server_name_ext);

		let mut handshake = vec![0x01]; // ClientHello
		let hs_len = client_hello.len() as u32;
		handshake.extend_from_slice(&hs_len.to_be_bytes()[1..]);
		handshake.extend_from_slice(&client_hello);

		let mut record = vec![0x16, 0x03, 0x01];
		record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
		record.extend_from_slice(&handshake);
		record
	}

	#[test]
	fn extracts_sni_from_well_formed_client_hello() {
		let record = client_hello_with_sni("example.com");
		assert_eq!(extract_sni(&record).unwrap(), "example.com");
	}

	#[test]
	fn non_handshake_record_is_rejected() {
		assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), Err(SniError::NotHandshake));
	}

	#[test]
	fn truncated_buffer_is_rejected() {
		assert_eq!(extract_sni(&[0x16, 0x03, 0x01]), Err(SniError::Truncated));
	}
}
