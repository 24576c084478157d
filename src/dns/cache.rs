//! Keyed, TTL-bounded, size-bounded cache of DNS question -> answer.

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsQuestion {
	pub name: String,
	pub qtype: RecordType,
}

impl DnsQuestion {
	pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
		Self { name: name.into().to_ascii_lowercase(), qtype }
	}

	fn cache_key(&self) -> String {
		let mut hasher = Sha256::new();
		hasher.update(self.name.as_bytes());
		hasher.update(b":");
		hasher.update(self.qtype.to_string().as_bytes());
		format!("{:x}", hasher.finalize())
	}
}

struct CacheEntry {
	response: Message,
	created_at: Instant,
	expires_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub size: usize,
}

struct Inner {
	entries: HashMap<String, CacheEntry>,
	hits: u64,
	misses: u64,
}

/// Minimum of every resource record's TTL in the answer section, if any.
fn min_rr_ttl(response: &Message) -> Option<u32> {
	response.answers().iter().map(|r| r.ttl()).min()
}

pub struct DnsCache {
	max_size: usize,
	default_ttl: Duration,
	inner: RwLock<Inner>,
}

impl DnsCache {
	pub fn new(max_size: usize, default_ttl: Duration) -> Self {
		Self {
			max_size,
			default_ttl,
			inner: RwLock::new(Inner { entries: HashMap::new(), hits: 0, misses: 0 }),
		}
	}

	/// Mutating lookup: evicts the entry if it has expired, otherwise returns
	/// an independent copy of the cached response.
	pub fn get(&self, question: &DnsQuestion) -> Option<Message> {
		let key = question.cache_key();
		let now = Instant::now();

		let mut inner = self.inner.write().unwrap();
		match inner.entries.get(&key) {
			Some(entry) if entry.expires_at > now => {
				let response = entry.response.clone();
				inner.hits += 1;
				Some(response)
			}
			Some(_) => {
				inner.entries.remove(&key);
				inner.misses += 1;
				None
			}
			None => {
				inner.misses += 1;
				None
			}
		}
	}

	/// No-op for an empty answer section.
	pub fn set(&self, question: &DnsQuestion, response: Message) {
		if response.answer_count() == 0 {
			return;
		}
		let key = question.cache_key();
		let now = Instant::now();
		let ttl = min_rr_ttl(&response)
			.map(|secs| Duration::from_secs(secs as u64).min(self.default_ttl))
			.unwrap_or(self.default_ttl);

		let mut inner = self.inner.write().unwrap();
		if inner.entries.len() >= self.max_size && !inner.entries.contains_key(&key) {
			if let Some(oldest_key) = inner
				.entries
				.iter()
				.min_by_key(|(_, e)| e.created_at)
				.map(|(k, _)| k.clone())
			{
				inner.entries.remove(&oldest_key);
			}
		}

		inner.entries.insert(key, CacheEntry { response, created_at: now, expires_at: now + ttl });
	}

	pub fn remove(&self, question: &DnsQuestion) {
		self.inner.write().unwrap().entries.remove(&question.cache_key());
	}

	pub fn clear(&self) {
		let mut inner = self.inner.write().unwrap();
		inner.entries.clear();
	}

	pub fn clean_expired(&self) {
		let now = Instant::now();
		let mut inner = self.inner.write().unwrap();
		inner.entries.retain(|_, e| e.expires_at > now);
	}

	pub fn stats(&self) -> CacheStats {
		let inner = self.inner.read().unwrap();
		CacheStats { hits: inner.hits, misses: inner.misses, size: inner.entries.len() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::rr::{rdata::A, Name, RData, Record};
	use std::str::FromStr;

	fn answer(name: &str, ttl: u32) -> Message {
		let mut msg = Message::new();
		let mut record = Record::new();
        record.set_name(Name::from_str(name).unwrap());
		record.set_record_type(RecordType::A);
		record.set_ttl(ttl);
		record.set_data(Some(RData::A(A::new(1, 2, 3, 4))));
		msg.add_answer(record);
		msg
	}

	#[test]
	fn set_then_get_hits_and_matches() {
		let cache = DnsCache::new(10, Duration::from_secs(60));
		let q = DnsQuestion::new("Example.com.", RecordType::A);
		cache.set(&q, answer("example.com.", 120));

		let got = cache.get(&q).unwrap();
		assert_eq!(got.answers(), answer("example.com.", 120).answers());
		assert_eq!(cache.stats().hits, 1);
	}

	#[test]
	fn empty_answer_set_is_a_noop() {
		let cache = DnsCache::new(10, Duration::from_secs(60));
		let q = DnsQuestion::new("example.com.", RecordType::A);
		cache.set(&q, Message::new());
		assert!(cache.get(&q).is_none());
	}

	#[test]
	fn eviction_respects_max_size() {
		let cache = DnsCache::new(2, Duration::from_secs(60));
		for i in 0..5 {
			let name = format!("host{i}.example.com.");
			let q = DnsQuestion::new(&name, RecordType::A);
			cache.set(&q, answer(&name, 120));
		}
		assert!(cache.stats().size <= 2);
	}

	#[test]
	fn expired_entry_is_evicted_on_read() {
		let cache = DnsCache::new(10, Duration::from_secs(0));
		let q = DnsQuestion::new("example.com.", RecordType::A);
		cache.set(&q, answer("example.com.", 0));
		std::thread::sleep(Duration::from_millis(5));
		assert!(cache.get(&q).is_none());
		assert_eq!(cache.stats().misses, 1);
	}
}
