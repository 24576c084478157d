//! Root CA lifecycle: load from disk if both files parse, otherwise mint a
//! fresh RSA-4096 self-signed CA and persist it.

use crate::error::CertError;
use rand::rngs::OsRng;
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::path::{Path, PathBuf};
use std::time::Duration;

const RSA_KEY_BITS: usize = 4096;
const CA_COMMON_NAME: &str = "Janus Gate Local CA";

/// Structural PEM check independent of rcgen's own key-algorithm support, so
/// "not PEM at all" and "PEM but an unsupported key type" can be told apart.
fn is_well_formed_key_pem(key_pem: &str) -> bool {
	let mut reader = std::io::Cursor::new(key_pem.as_bytes());
	matches!(rustls_pemfile::read_one(&mut reader), Ok(Some(_)))
}

pub struct CaMaterial {
	pub cert_pem: String,
	pub key_pem: String,
	pub cert_der: Vec<u8>,
	ca_cert: Certificate,
	key_pair: KeyPair,
}

impl CaMaterial {
	/// Signs `leaf_params` (for `leaf_key`) using this CA as issuer.
	pub fn sign_leaf(
		&self,
		leaf_params: CertificateParams,
		leaf_key: &KeyPair,
	) -> Result<Certificate, rcgen::Error> {
		leaf_params.signed_by(leaf_key, &self.ca_cert, &self.key_pair)
	}
}

pub struct CaManager {
	pub material: CaMaterial,
	cert_path: PathBuf,
	key_path: PathBuf,
}

impl CaManager {
	/// Loads `cert_path`/`key_path` if both exist and parse; otherwise mints a
	/// new CA with `validity` and persists it. Fails hard if the key file
	/// exists but is in an unsupported format — the operator must remove the
	/// stale files rather than have them silently regenerated.
	pub fn load_or_create(
		cert_path: impl AsRef<Path>,
		key_path: impl AsRef<Path>,
		validity: Duration,
	) -> Result<Self, CertError> {
		let cert_path = cert_path.as_ref().to_path_buf();
		let key_path = key_path.as_ref().to_path_buf();

		match try_load(&cert_path, &key_path) {
			Ok(Some(material)) => return Ok(Self { material, cert_path, key_path }),
			Ok(None) => {}
			Err(e) => return Err(e),
		}

		let material = generate(validity)?;
		persist(&cert_path, &key_path, &material)?;
		Ok(Self { material, cert_path, key_path })
	}

	pub fn cert_pem(&self) -> &str {
		&self.material.cert_pem
	}

	pub fn cert_path(&self) -> &Path {
		&self.cert_path
	}

	pub fn key_path(&self) -> &Path {
		&self.key_path
	}
}

fn try_load(cert_path: &Path, key_path: &Path) -> Result<Option<CaMaterial>, CertError> {
	let (Ok(cert_pem), Ok(key_pem)) =
		(std::fs::read_to_string(cert_path), std::fs::read_to_string(key_path))
	else {
		return Ok(None);
	};

	// A key file that isn't valid PEM at all (truncated, corrupted, not a
	// PEM-encoded key) is treated as missing so the CA gets regenerated.
	// Once it's structurally valid PEM, a key rcgen can't use as a CA
	// signing key is a configuration error the operator must fix by hand.
	if !is_well_formed_key_pem(&key_pem) {
		return Ok(None);
	}

	let key_pair = KeyPair::from_pem(&key_pem).map_err(|_| {
		CertError::UnsupportedKeyFormat(
			cert_path.display().to_string(),
			key_path.display().to_string(),
		)
	})?;

	let (_, cert_der) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
		.map_err(|e| CertError::Configuration(format!("invalid CA cert PEM: {e}")))?;
	x509_parser::parse_x509_certificate(&cert_der.contents)
		.map_err(|e| CertError::Configuration(format!("invalid CA cert DER: {e:?}")))?;

	// The issuer view only needs the issuer distinguished name and
	// constraints to stamp leaf certificates; it does not re-validate the
	// loaded cert's own validity window against these params.
	let mut params = CertificateParams::new(vec![])
		.map_err(|e| CertError::Configuration(e.to_string()))?;
	params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

	let ca_cert = params
		.self_signed(&key_pair)
		.map_err(|e| CertError::Configuration(format!("failed to derive issuer view: {e}")))?;

	Ok(Some(CaMaterial { cert_pem, key_pem, cert_der: cert_der.contents.into_owned(), ca_cert, key_pair }))
}

fn generate(validity: Duration) -> Result<CaMaterial, CertError> {
	let mut rng = OsRng;
	let rsa_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
		.map_err(|e| CertError::Generation(format!("rsa key generation failed: {e}")))?;
	let pkcs8_der = rsa_key
		.to_pkcs8_der()
		.map_err(|e| CertError::Generation(format!("pkcs8 encoding failed: {e}")))?;
	let key_pair = KeyPair::from_der_and_sign_algo(pkcs8_der.as_bytes(), &rcgen::PKCS_RSA_SHA256)
		.map_err(|e| CertError::Generation(format!("rcgen keypair import failed: {e}")))?;

	let mut params = CertificateParams::new(vec![])
		.map_err(|e| CertError::Generation(e.to_string()))?;
	params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
	params.distinguished_name.push(DnType::OrganizationName, "Janus Gate");
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	params.not_before = time::OffsetDateTime::now_utc();
	params.not_after = params.not_before + time::Duration::seconds(validity.as_secs() as i64);

	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| CertError::Generation(format!("self-signing failed: {e}")))?;

	let cert_pem = cert.pem();
	// Persisted as PKCS#1 per the on-disk contract (`ca.key` is RSA PRIVATE KEY).
	let key_pem = rsa_key
		.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
		.map_err(|e| CertError::Generation(format!("pkcs1 encoding failed: {e}")))?
		.to_string();

	let cert_der = cert.der().to_vec();
	Ok(CaMaterial { cert_pem, key_pem, cert_der, ca_cert: cert, key_pair })
}

fn persist(cert_path: &Path, key_path: &Path, material: &CaMaterial) -> Result<(), CertError> {
	if let Some(parent) = cert_path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(cert_path, &material.cert_pem)?;
	std::fs::write(key_path, &material.key_pem)?;

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generate_produces_self_signed_ca_with_requested_validity() {
		let material = generate(Duration::from_secs(3600)).unwrap();
		assert!(material.cert_pem.contains("BEGIN CERTIFICATE"));
		assert!(material.key_pem.contains("BEGIN RSA PRIVATE KEY"));
	}

	#[test]
	fn load_or_create_persists_and_then_reloads_the_same_ca() {
		let dir = tempfile::tempdir().unwrap();
		let cert_path = dir.path().join("ca.crt");
		let key_path = dir.path().join("ca.key");

		let first = CaManager::load_or_create(&cert_path, &key_path, Duration::from_secs(86400)).unwrap();
		let second = CaManager::load_or_create(&cert_path, &key_path, Duration::from_secs(86400)).unwrap();
		assert_eq!(first.material.cert_der, second.material.cert_der);
	}
}
