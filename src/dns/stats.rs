//! Async ingestion of per-query records into per-domain aggregates, modeled
//! on the non-blocking mpsc-ingest-plus-periodic-flush worker used for
//! persistence batching elsewhere in this codebase.

use chrono::{DateTime, Utc};
use hickory_proto::rr::RecordType;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct QueryRecord {
	pub domain: String,
	pub qtype: RecordType,
	pub response_time: Duration,
	pub success: bool,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SubStats {
	pub total: u64,
	pub success: u64,
	pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct DomainStats {
	pub domain: String,
	pub total: u64,
	pub success: u64,
	pub failed: u64,
	pub total_response_ns: u128,
	pub per_qtype: HashMap<RecordType, SubStats>,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
	insertion_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
	Queries,
	ResponseTime,
}

struct Aggregates {
	by_domain: HashMap<String, DomainStats>,
	next_seq: u64,
}

pub struct StatsCollector {
	sender: mpsc::Sender<QueryRecord>,
	aggregates: Arc<RwLock<Aggregates>>,
	worker: tokio::task::JoinHandle<()>,
	cleanup: Option<tokio::task::JoinHandle<()>>,
}

impl StatsCollector {
	pub fn start(queue_capacity: usize) -> Self {
		Self::start_with_cleanup(queue_capacity, None)
	}

	/// Starts the ingestion worker and, if given, the periodic stale-domain
	/// cleanup pass (default 5 minute interval / 7 day retention per the
	/// reference policy).
	pub fn start_with_cleanup(queue_capacity: usize, cleanup: Option<(Duration, Duration)>) -> Self {
		let (tx, mut rx) = mpsc::channel(queue_capacity);
		let aggregates = Arc::new(RwLock::new(Aggregates { by_domain: HashMap::new(), next_seq: 0 }));
		let worker_aggregates = aggregates.clone();

		let worker = tokio::spawn(async move {
			while let Some(record) = rx.recv().await {
				fold_in(&worker_aggregates, record);
			}
		});

		let cleanup = cleanup.map(|(interval, retention)| {
			let aggregates = aggregates.clone();
			tokio::spawn(async move {
				let mut ticker = tokio::time::interval(interval);
				loop {
					ticker.tick().await;
					let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
					let mut inner = aggregates.write().unwrap();
					inner.by_domain.retain(|_, stats| stats.last_seen >= cutoff);
				}
			})
		});

		Self { sender: tx, aggregates, worker, cleanup }
	}

	/// Non-blocking; drops the record if the ingress queue is full.
	pub fn record(&self, record: QueryRecord) {
		if self.sender.try_send(record).is_err() {
			tracing::warn!("dns stats queue full, dropping query record");
		}
	}

	pub fn top_domains(&self, limit: usize, sort_by: SortBy) -> Vec<DomainStats> {
		let inner = self.aggregates.read().unwrap();
		let mut all: Vec<DomainStats> = inner.by_domain.values().cloned().collect();
		all.sort_by(|a, b| match sort_by {
			SortBy::Queries => b.total.cmp(&a.total).then(a.insertion_seq.cmp(&b.insertion_seq)),
			SortBy::ResponseTime => b
				.total_response_ns
				.cmp(&a.total_response_ns)
				.then(a.insertion_seq.cmp(&b.insertion_seq)),
		});
		all.truncate(limit);
		all
	}

	/// Removes any domain whose `last_seen` is older than `retention`.
	pub fn clean_stale(&self, retention: Duration) {
		let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
		let mut inner = self.aggregates.write().unwrap();
		inner.by_domain.retain(|_, stats| stats.last_seen >= cutoff);
	}

	pub async fn shutdown(self) {
		if let Some(cleanup) = self.cleanup {
			cleanup.abort();
		}
		drop(self.sender);
		let _ = self.worker.await;
	}
}

fn fold_in(aggregates: &Arc<RwLock<Aggregates>>, record: QueryRecord) {
	let mut inner = aggregates.write().unwrap();
	let seq = inner.next_seq;
	inner.next_seq += 1;

	let entry = inner.by_domain.entry(record.domain.clone()).or_insert_with(|| DomainStats {
		domain: record.domain.clone(),
		total: 0,
		success: 0,
		failed: 0,
		total_response_ns: 0,
		per_qtype: HashMap::new(),
		first_seen: record.timestamp,
		last_seen: record.timestamp,
		insertion_seq: seq,
	});

	entry.total += 1;
	if record.success {
		entry.success += 1;
	} else {
		entry.failed += 1;
	}
	entry.total_response_ns += record.response_time.as_nanos();
	if record.timestamp > entry.last_seen {
		entry.last_seen = record.timestamp;
	}

	let sub = entry.per_qtype.entry(record.qtype).or_default();
	sub.total += 1;
	if record.success {
		sub.success += 1;
	} else {
		sub.failed += 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(domain: &str, success: bool) -> QueryRecord {
		QueryRecord {
			domain: domain.to_string(),
			qtype: RecordType::A,
			response_time: Duration::from_millis(10),
			success,
			timestamp: Utc::now(),
		}
	}

	#[tokio::test]
	async fn records_fold_into_domain_totals() {
		let collector = StatsCollector::start(16);
		collector.record(record("example.com", true));
		collector.record(record("example.com", false));
		// give the worker task a turn
		tokio::task::yield_now().await;
		tokio::time::sleep(Duration::from_millis(10)).await;

		let top = collector.top_domains(10, SortBy::Queries);
		let entry = top.iter().find(|d| d.domain == "example.com").unwrap();
		assert_eq!(entry.total, 2);
		assert_eq!(entry.success, 1);
		assert_eq!(entry.failed, 1);
	}

	#[tokio::test]
	async fn shutdown_drains_pending_records() {
		let collector = StatsCollector::start(16);
		collector.record(record("example.com", true));
		collector.shutdown().await;
	}
}
