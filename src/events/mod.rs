//! Fan-out of typed `TrafficEvent`s to bounded-queue subscribers, with a
//! bounded history ring replayed into new subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
	pub method: String,
	pub url: String,
	pub host: String,
	pub headers: HashMap<String, String>,
	pub body: String,
	pub content_type: Option<String>,
	pub content_length: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSummary {
	pub status: String,
	pub status_code: u16,
	pub headers: HashMap<String, String>,
	pub body: String,
	pub content_type: Option<String>,
	pub content_length: Option<usize>,
	pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEvent {
	pub id: String,
	pub hostname: String,
	pub timestamp: DateTime<Utc>,
	pub direction: String,
	pub connection_id: String,
	pub request_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request: Option<RequestSummary>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response: Option<ResponseSummary>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extra: Option<Value>,
}

impl TrafficEvent {
	pub fn new(hostname: impl Into<String>, direction: impl Into<String>, connection_id: impl Into<String>, request_id: impl Into<String>) -> Self {
		Self {
			id: String::new(),
			hostname: hostname.into(),
			timestamp: Utc::now(),
			direction: direction.into(),
			connection_id: connection_id.into(),
			request_id: request_id.into(),
			request: None,
			response: None,
			extra: None,
		}
	}
}

pub type SubscriberId = u64;

pub struct Subscription {
	pub id: SubscriberId,
	pub receiver: mpsc::Receiver<TrafficEvent>,
}

struct Subscriber {
	sender: mpsc::Sender<TrafficEvent>,
}

pub struct EventBus {
	next_event_id: AtomicU64,
	next_subscriber_id: AtomicU64,
	history_size: usize,
	subscriber_queue_capacity: usize,
	inner: Mutex<Inner>,
}

struct Inner {
	subscribers: HashMap<SubscriberId, Subscriber>,
	history: VecDeque<TrafficEvent>,
}

impl EventBus {
	pub fn new(history_size: usize, subscriber_queue_capacity: usize) -> Self {
		Self {
			next_event_id: AtomicU64::new(1),
			next_subscriber_id: AtomicU64::new(1),
			history_size: history_size.clamp(10, 1000),
			subscriber_queue_capacity,
			inner: Mutex::new(Inner { subscribers: HashMap::new(), history: VecDeque::new() }),
		}
	}

	/// Stamps `id`/`timestamp` if unset, appends to the bounded history ring,
	/// and delivers to every subscriber by non-blocking try-send.
	pub fn publish(&self, mut event: TrafficEvent) {
		if event.id.is_empty() {
			let n = self.next_event_id.fetch_add(1, Ordering::Relaxed);
			event.id = format!("evt-{n}");
		}

		let mut inner = self.inner.lock().unwrap();
		inner.history.push_back(event.clone());
		while inner.history.len() > self.history_size {
			inner.history.pop_front();
		}

		for subscriber in inner.subscribers.values() {
			if subscriber.sender.try_send(event.clone()).is_err() {
				tracing::warn!(event_id = %event.id, "subscriber queue full, event dropped");
			}
		}
	}

	pub fn subscribe(self: &Arc<Self>) -> Subscription {
		let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(self.subscriber_queue_capacity);

		let history: Vec<TrafficEvent> = {
			let mut inner = self.inner.lock().unwrap();
			inner.subscribers.insert(id, Subscriber { sender: tx.clone() });
			inner.history.iter().cloned().collect()
		};

		// Replay happens off the publishing lock, try-send only.
		tokio::spawn(async move {
			for event in history {
				let _ = tx.try_send(event);
			}
		});

		Subscription { id, receiver: rx }
	}

	pub fn unsubscribe(&self, id: SubscriberId) {
		self.inner.lock().unwrap().subscribers.remove(&id);
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner.lock().unwrap().subscribers.len()
	}

	pub fn history(&self) -> Vec<TrafficEvent> {
		self.inner.lock().unwrap().history.iter().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn publish_delivers_in_order_to_subscriber() {
		let bus = Arc::new(EventBus::new(100, 10));
		let mut sub = bus.subscribe();

		bus.publish(TrafficEvent::new("example.com", "request", "c1", "c1-1"));
		bus.publish(TrafficEvent::new("example.com", "response", "c1", "c1-1"));

		let first = sub.receiver.recv().await.unwrap();
		let second = sub.receiver.recv().await.unwrap();
		assert_eq!(first.direction, "request");
		assert_eq!(second.direction, "response");
	}

	#[tokio::test]
	async fn unsubscribe_stops_delivery() {
		let bus = Arc::new(EventBus::new(100, 10));
		let sub = bus.subscribe();
		bus.unsubscribe(sub.id);
		bus.publish(TrafficEvent::new("example.com", "request", "c1", "c1-1"));
		assert_eq!(bus.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn new_subscriber_receives_replayed_history() {
		let bus = Arc::new(EventBus::new(100, 10));
		bus.publish(TrafficEvent::new("example.com", "request", "c1", "c1-1"));

		let mut sub = bus.subscribe();
		let replayed = sub.receiver.recv().await.unwrap();
		assert_eq!(replayed.hostname, "example.com");
	}
}
