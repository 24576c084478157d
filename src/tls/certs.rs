//! On-demand per-host leaf certificate minting with a two-tier (memory +
//! disk) cache and single-flight generation, modeled on the double-checked
//! cache pattern used for MITM leaf certs elsewhere in this codebase but
//! tightened to a dedicated generation mutex so no cache lock is held across
//! the (comparatively expensive) signing step.

use crate::error::CertError;
use crate::tls::ca::CaManager;
use rcgen::{
	CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct SiteCert {
	pub leaf_der: Vec<u8>,
	pub leaf_key_der: Vec<u8>,
	pub chain_pem: String,
	pub key_pem: String,
	pub not_after: chrono::DateTime<chrono::Utc>,
}

struct MemoryEntry {
	cert: SiteCert,
	inserted_at: Instant,
}

pub struct SiteCertManager {
	ca: Arc<CaManager>,
	cache_dir: PathBuf,
	site_validity: Duration,
	memory: RwLock<HashMap<String, MemoryEntry>>,
	generation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SiteCertManager {
	pub fn new(ca: Arc<CaManager>, cache_dir: impl AsRef<Path>, site_validity: Duration) -> Self {
		Self {
			ca,
			cache_dir: cache_dir.as_ref().to_path_buf(),
			site_validity,
			memory: RwLock::new(HashMap::new()),
			generation_locks: Mutex::new(HashMap::new()),
		}
	}

	pub async fn get_certificate(&self, hostname: &str) -> Result<SiteCert, CertError> {
		let key = hostname.to_ascii_lowercase();

		if let Some(cert) = self.memory_hit(&key) {
			return Ok(cert);
		}
		if let Some(cert) = self.disk_hit(&key)? {
			self.insert_memory(&key, cert.clone());
			return Ok(cert);
		}

		let lock = self.generation_lock_for(&key);
		let _guard = lock.lock().await;

		// Re-check both tiers now that we hold the single-flight lock: a
		// concurrent caller may have generated the cert while we waited.
		if let Some(cert) = self.memory_hit(&key) {
			return Ok(cert);
		}
		if let Some(cert) = self.disk_hit(&key)? {
			self.insert_memory(&key, cert.clone());
			return Ok(cert);
		}

		let cert = self.generate(&key)?;
		self.persist(&key, &cert)?;
		self.insert_memory(&key, cert.clone());
		Ok(cert)
	}

	fn memory_hit(&self, key: &str) -> Option<SiteCert> {
		let memory = self.memory.read().unwrap();
		let entry = memory.get(key)?;
		if entry.inserted_at.elapsed() < self.site_validity {
			Some(entry.cert.clone())
		} else {
			None
		}
	}

	fn insert_memory(&self, key: &str, cert: SiteCert) {
		let mut memory = self.memory.write().unwrap();
		memory.insert(key.to_string(), MemoryEntry { cert, inserted_at: Instant::now() });
	}

	fn disk_hit(&self, key: &str) -> Result<Option<SiteCert>, CertError> {
		let crt_path = self.cache_dir.join(format!("{key}.crt"));
		let key_path = self.cache_dir.join(format!("{key}.key"));

		let (Ok(chain_pem), Ok(key_pem)) =
			(std::fs::read_to_string(&crt_path), std::fs::read_to_string(&key_path))
		else {
			return Ok(None);
		};

		let Ok((_, leaf_pem)) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes()) else {
			let _ = std::fs::remove_file(&crt_path);
			let _ = std::fs::remove_file(&key_path);
			return Ok(None);
		};
		let Ok((_, parsed)) = x509_parser::parse_x509_certificate(&leaf_pem.contents) else {
			let _ = std::fs::remove_file(&crt_path);
			let _ = std::fs::remove_file(&key_path);
			return Ok(None);
		};

		let not_after = chrono::DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
			.unwrap_or_else(chrono::Utc::now);
		if not_after <= chrono::Utc::now() {
			let _ = std::fs::remove_file(&crt_path);
			let _ = std::fs::remove_file(&key_path);
			return Ok(None);
		}

		let key_der = rcgen::KeyPair::from_pem(&key_pem)
			.map(|kp| kp.serialized_der().to_vec())
			.unwrap_or_default();

		Ok(Some(SiteCert {
			leaf_der: leaf_pem.contents.into_owned(),
			leaf_key_der: key_der,
			chain_pem,
			key_pem,
			not_after,
		}))
	}

	fn generation_lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
		let mut locks = self.generation_locks.lock().unwrap();
		locks.entry(key.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
	}

	fn generate(&self, hostname: &str) -> Result<SiteCert, CertError> {
		let mut sans = vec![hostname.to_string()];
		if let Some(base) = hostname.strip_prefix("*.") {
			sans.push(base.to_string());
		}

		let mut params = CertificateParams::new(sans.clone())
			.map_err(|e| CertError::Generation(e.to_string()))?;
		params.distinguished_name.push(DnType::CommonName, hostname);
		params.is_ca = IsCa::NoCa;
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.subject_alt_names =
			sans.iter().filter_map(|s| SanType::DnsName(s.clone().try_into().ok()?).into()).collect();
		params.not_before = time::OffsetDateTime::now_utc();
		params.not_after = params.not_before + time::Duration::seconds(self.site_validity.as_secs() as i64);

		let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
			.map_err(|e| CertError::Generation(e.to_string()))?;

		let leaf_cert = self
			.ca
			.material
			.sign_leaf(params, &leaf_key)
			.map_err(|e| CertError::Generation(format!("leaf signing failed: {e}")))?;

		let chain_pem = format!("{}{}", leaf_cert.pem(), self.ca.cert_pem());
		let key_pem = leaf_key.serialize_pem();
		let not_after = chrono::Utc::now() + chrono::Duration::from_std(self.site_validity).unwrap();

		Ok(SiteCert {
			leaf_der: leaf_cert.der().to_vec(),
			leaf_key_der: leaf_key.serialized_der().to_vec(),
			chain_pem,
			key_pem,
			not_after,
		})
	}

	fn persist(&self, key: &str, cert: &SiteCert) -> Result<(), CertError> {
		std::fs::create_dir_all(&self.cache_dir)?;
		std::fs::write(self.cache_dir.join(format!("{key}.crt")), &cert.chain_pem)?;
		std::fs::write(self.cache_dir.join(format!("{key}.key")), &cert.key_pem)?;
		Ok(())
	}

	pub fn clear_cache(&self) {
		self.memory.write().unwrap().clear();
	}

	pub fn clear_disk_cache(&self) -> std::io::Result<()> {
		if !self.cache_dir.exists() {
			return Ok(());
		}
		for entry in std::fs::read_dir(&self.cache_dir)? {
			let entry = entry?;
			let path = entry.path();
			if matches!(path.extension().and_then(|e| e.to_str()), Some("crt") | Some("key")) {
				std::fs::remove_file(path)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manager() -> (tempfile::TempDir, SiteCertManager) {
		let dir = tempfile::tempdir().unwrap();
		let ca = Arc::new(
			CaManager::load_or_create(
				dir.path().join("ca.crt"),
				dir.path().join("ca.key"),
				Duration::from_secs(365 * 24 * 3600),
			)
			.unwrap(),
		);
		let site_dir = dir.path().join("certs");
		let mgr = SiteCertManager::new(ca, &site_dir, Duration::from_secs(7 * 24 * 3600));
		(dir, mgr)
	}

	#[tokio::test]
	async fn get_certificate_caches_in_memory() {
		let (_dir, mgr) = manager();
		let first = mgr.get_certificate("example.com").await.unwrap();
		let second = mgr.get_certificate("example.com").await.unwrap();
		assert_eq!(first.leaf_der, second.leaf_der);
	}

	#[tokio::test]
	async fn concurrent_requests_single_flight_to_one_generation() {
		let (_dir, mgr) = manager();
		let mgr = Arc::new(mgr);
		let mut handles = Vec::new();
		for _ in 0..10 {
			let mgr = mgr.clone();
			handles.push(tokio::spawn(async move { mgr.get_certificate("host.example").await }));
		}
		let mut results = Vec::new();
		for h in handles {
			results.push(h.await.unwrap().unwrap());
		}
		let first_der = &results[0].leaf_der;
		assert!(results.iter().all(|c| &c.leaf_der == first_der));
	}
}
