//! Low-level PEM/DER plumbing and rustls config builders shared by the CA
//! manager (C5), the site-cert manager (C6) and the connection handler (C12).

use anyhow::{Context, Result};
use rustls_pemfile::{certs as pem_certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{self, client::ServerCertVerifier, Certificate, PrivateKey, RootCertStore, server::ServerConfig};

/// Load PEM-encoded certificates from `path`.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
	let f = File::open(path).with_context(|| format!("opening cert file {}", path.display()))?;
	let mut reader = BufReader::new(f);
	let raw =
		pem_certs(&mut reader).map_err(|e| anyhow::anyhow!("failed to parse PEM certs: {}", e))?;
	if raw.is_empty() {
		anyhow::bail!("no certificates found in {}", path.display());
	}
	Ok(raw.into_iter().map(Certificate).collect())
}

/// Load a private key (PKCS#8 preferred, RSA/PKCS#1 fallback) from `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
	let f = File::open(path).with_context(|| format!("opening key file {}", path.display()))?;
	let mut reader = BufReader::new(&f);
	let pks = pkcs8_private_keys(&mut reader)
		.map_err(|e| anyhow::anyhow!("failed to parse PKCS#8 keys: {}", e))?;
	if let Some(k) = pks.into_iter().next() {
		return Ok(PrivateKey(k));
	}

	let f = File::open(path)
		.with_context(|| format!("opening key file {} (rsa pass)", path.display()))?;
	let mut reader = BufReader::new(f);
	let rs = rsa_private_keys(&mut reader)
		.map_err(|e| anyhow::anyhow!("failed to parse RSA keys: {}", e))?;
	if let Some(k) = rs.into_iter().next() {
		return Ok(PrivateKey(k));
	}

	anyhow::bail!(
		"no private key in a supported format (PKCS#8 or PKCS#1) found in {}",
		path.display()
	);
}

pub fn parse_first_cert_x509<'a>(
	cert: &'a Certificate,
) -> Result<x509_parser::certificate::X509Certificate<'a>> {
	let res = x509_parser::parse_x509_certificate(&cert.0)
		.map_err(|e| anyhow::anyhow!("failed to parse x509 certificate: {:?}", e))?;
	Ok(res.1)
}

/// True if the certificate's subject equals its issuer.
pub fn is_self_signed(cert: &Certificate) -> Result<bool> {
	let parsed = parse_first_cert_x509(cert)?;
	Ok(parsed.tbs_certificate.subject == parsed.tbs_certificate.issuer)
}

pub fn dns_names_from_cert(cert: &Certificate) -> Result<Vec<String>> {
	let parsed = parse_first_cert_x509(cert)?;
	let mut out: Vec<String> = Vec::new();

	use x509_parser::extensions::{GeneralName, ParsedExtension};
	for ext in parsed.extensions().iter() {
		if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
			for name in san.general_names.iter() {
				if let GeneralName::DNSName(d) = name {
					out.push(d.to_string());
				}
			}
		}
	}

	Ok(out)
}

pub fn first_common_name(cert: &Certificate) -> Result<Option<String>> {
	let parsed = parse_first_cert_x509(cert)?;
	for cn in parsed.subject().iter_common_name() {
		if let Ok(s) = cn.as_str() {
			return Ok(Some(s.to_string()));
		}
	}
	Ok(None)
}

pub fn is_cert_expired(cert: &Certificate) -> Result<bool> {
	let parsed = parse_first_cert_x509(cert)?;
	let not_after = parsed.validity().not_after.to_datetime();
	let now = x509_parser::time::ASN1Time::now().to_datetime();
	Ok(not_after <= now)
}

pub fn not_after(cert: &Certificate) -> Result<chrono::DateTime<chrono::Utc>> {
	let parsed = parse_first_cert_x509(cert)?;
	let ts = parsed.validity().not_after.timestamp();
	chrono::DateTime::from_timestamp(ts, 0).context("certificate NotAfter out of range")
}

/// Build the server-side rustls config presented to clients for a minted MITM
/// leaf. Unlike a conventional TLS terminator this accepts whatever protocol
/// version and cipher suite the client's ClientHello negotiates down to, since
/// the peer is whatever software originally dialed the real origin.
pub fn build_mitm_server_config(certs: Vec<Certificate>, key: PrivateKey) -> Result<Arc<ServerConfig>> {
	if certs.is_empty() {
		anyhow::bail!("no certificates provided to build server config");
	}

	let cfg = ServerConfig::builder()
		.with_safe_default_cipher_suites()
		.with_safe_default_kx_groups()
		.with_protocol_versions(rustls::ALL_VERSIONS)
		.map_err(|e| anyhow::anyhow!("failed to negotiate protocol versions: {:?}", e))?
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| anyhow::anyhow!("failed to build server config: {}", e))?;

	Ok(Arc::new(cfg))
}

/// A config used when this process itself terminates TLS1.3-only traffic
/// (kept for components that load an externally-issued, non-self-signed
/// certificate rather than a minted leaf).
pub fn build_server_config_tls13(certs: Vec<Certificate>, key: PrivateKey) -> Result<Arc<ServerConfig>> {
	if certs.is_empty() {
		anyhow::bail!("no certificates provided to build server config");
	}
	let first = &certs[0];
	if is_self_signed(first)? {
		anyhow::bail!("self-signed certificates are not allowed for server TLS");
	}

	let cfg = ServerConfig::builder()
		.with_safe_default_cipher_suites()
		.with_safe_default_kx_groups()
		.with_protocol_versions(&[&rustls::version::TLS13])
		.map_err(|e| anyhow::anyhow!("failed to negotiate protocol versions: {:?}", e))?
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| anyhow::anyhow!("failed to build server config: {}", e))?;

	Ok(Arc::new(cfg))
}

/// Build the client-side rustls config used to dial the real origin. Verifies
/// against the OS trust store unless `insecure` (a configuration knob for
/// tunneling through an upstream inspection proxy) is set.
pub fn build_upstream_client_config(insecure: bool) -> Result<Arc<rustls::ClientConfig>> {
	let builder = rustls::ClientConfig::builder()
		.with_safe_defaults();

	let cfg = if insecure {
		builder
			.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
			.with_no_client_auth()
	} else {
		let mut roots = RootCertStore::empty();
		for cert in rustls_native_certs::load_native_certs().context("loading native root certs")? {
			let _ = roots.add(&Certificate(cert.0));
		}
		builder.with_root_certificates(roots).with_no_client_auth()
	};

	Ok(Arc::new(cfg))
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
	fn verify_server_cert(
		&self,
		_end_entity: &Certificate,
		_intermediates: &[Certificate],
		_server_name: &rustls::ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now: std::time::SystemTime,
	) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::ServerCertVerified::assertion())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_certs_missing_path_returns_err() {
		let p = Path::new("/this/path/does/not/exist/cert.pem");
		assert!(load_certs(p).is_err());
	}

	#[test]
	fn load_key_missing_path_returns_err() {
		let p = Path::new("/this/path/does/not/exist/key.pem");
		assert!(load_private_key(p).is_err());
	}
}
