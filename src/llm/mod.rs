//! LLM conversation reconstruction: a provider dispatch table that turns
//! reassembled HTTP request/response bodies (from [`crate::http`]) into
//! conversation/message/token events published on the shared event bus.

pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::events::{EventBus, TrafficEvent};
use crate::http::HttpProcessor;
use crate::inspect::{InspectContext, InspectOutcome, Inspector};

#[derive(Debug, Clone, Default)]
pub struct NormalizedMessage {
	pub role: String,
	pub content_parts: Vec<String>,
	pub tool_calls: Vec<serde_json::Value>,
	pub tool_results: Vec<serde_json::Value>,
	pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
	pub conversation_id: String,
	pub model: Option<String>,
	pub messages: Vec<NormalizedMessage>,
	pub system_prompts: Vec<String>,
	pub tools: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
	pub message: NormalizedMessage,
	pub model: Option<String>,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
	Text,
	Thinking,
	Tool(u32),
}

#[derive(Debug, Clone, Default)]
pub struct TokenDelta {
	pub kind: Option<DeltaKindSlot>,
	pub text: String,
	pub tool_id: Option<String>,
	pub tool_name: Option<String>,
	pub is_complete: bool,
	pub stop_reason: Option<String>,
	pub output_tokens: Option<u64>,
	pub input_tokens: Option<u64>,
}

/// `DeltaKind` isn't `Default`; this newtype lets `TokenDelta` derive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaKindSlot(pub DeltaKind);

pub fn short_hash(input: &str) -> String {
	let digest = Sha256::digest(input.as_bytes());
	let hex = format!("{digest:x}");
	hex[..8].to_string()
}

pub trait LlmProvider: Send + Sync {
	fn name(&self) -> &str;
	fn matches_host(&self, hostname: &str) -> bool;
	fn matches_request(&self, hostname: &str, path: &str, body_sample: &[u8]) -> bool;
	fn parse_full_request(&self, body: &[u8]) -> Option<RequestInfo>;
	fn parse_response(&self, path: &str, body: &[u8]) -> Option<LlmResponse>;
	fn parse_sse_stream_from(&self, body: &[u8], start_pos: usize) -> Vec<TokenDelta>;
}

struct RequestState {
	provider_name: String,
	path: String,
	conversation_id: String,
	model: Option<String>,
	message_id: Option<String>,
	last_processed_offset: usize,
	accumulated_text: String,
	message_count: usize,
	started_at: Instant,
}

pub struct LlmInspector {
	http: HttpProcessor,
	providers: Vec<Arc<dyn LlmProvider>>,
	bus: Arc<EventBus>,
	state: Mutex<HashMap<String, RequestState>>,
}

impl LlmInspector {
	pub fn new(max_body_size: usize, bus: Arc<EventBus>, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
		Self { http: HttpProcessor::new(max_body_size), providers, bus, state: Mutex::new(HashMap::new()) }
	}

	fn provider_by_name(&self, name: &str) -> Option<&Arc<dyn LlmProvider>> {
		self.providers.iter().find(|p| p.name() == name)
	}

	fn handle_request(&self, ctx: &InspectContext, body: &[u8], path: &str) {
		let Some(provider) = self.providers.iter().find(|p| p.matches_request(&ctx.hostname, path, body)) else {
			return;
		};
		let Some(info) = provider.parse_full_request(body) else {
			tracing::debug!(hostname = %ctx.hostname, "failed to parse llm request body");
			return;
		};

		{
			let mut state = self.state.lock().unwrap();
			state.insert(
				ctx.request_id.clone(),
				RequestState {
					provider_name: provider.name().to_string(),
					path: path.to_string(),
					conversation_id: info.conversation_id.clone(),
					model: info.model.clone(),
					message_id: None,
					last_processed_offset: 0,
					accumulated_text: String::new(),
					message_count: info.messages.len(),
					started_at: Instant::now(),
				},
			);
		}

		if !info.system_prompts.is_empty() {
			self.publish_message_event(ctx, &info.conversation_id, "system", &info.system_prompts.join("\n"), None, info.model.as_deref());
		}
		if let Some(last) = info.messages.last() {
			self.publish_message_event(ctx, &info.conversation_id, &last.role, &last.content_parts.join(""), None, info.model.as_deref());
		}
		self.publish_conversation_update(ctx, &info.conversation_id, "streaming", info.messages.len(), 0, 0, info.model.as_deref());
	}

	fn handle_sse_chunk(&self, ctx: &InspectContext, body: &[u8]) {
		let (provider_name, start_pos) = {
			let state = self.state.lock().unwrap();
			match state.get(&ctx.request_id) {
				Some(s) => (s.provider_name.clone(), s.last_processed_offset),
				None => return,
			}
		};
		let Some(provider) = self.provider_by_name(&provider_name) else { return };
		let deltas = provider.parse_sse_stream_from(body, start_pos);
		if deltas.is_empty() {
			return;
		}

		let mut state = self.state.lock().unwrap();
		let Some(s) = state.get_mut(&ctx.request_id) else { return };
		s.last_processed_offset = body.len();

		let conversation_id = s.conversation_id.clone();
		let model = s.model.clone();

		if s.message_id.is_none() {
			let id = format!("msg-{}", short_hash(&ctx.request_id));
			s.message_id = Some(id.clone());
			drop(state);
			self.publish_message_event(ctx, &conversation_id, "assistant", "", Some(&id), model.as_deref());
			self.publish_conversation_update(ctx, &conversation_id, "streaming", 0, 0, 0, model.as_deref());
			state = self.state.lock().unwrap();
		}
		let Some(s) = state.get_mut(&ctx.request_id) else { return };
		let message_id = s.message_id.clone().unwrap();

		for delta in &deltas {
			s.accumulated_text.push_str(&delta.text);
			let event = TrafficEvent {
				extra: Some(json!({
					"kind": "llm_token",
					"conversation_id": conversation_id,
					"request_id": ctx.request_id,
					"delta": delta.text,
					"tool_name": delta.tool_name,
					"tool_id": delta.tool_id,
					"is_complete": delta.is_complete,
					"stop_reason": delta.stop_reason,
				})),
				..TrafficEvent::new(ctx.hostname.clone(), "llm_token", ctx.connection_id.clone(), ctx.request_id.clone())
			};
			self.bus.publish(event);

			if delta.is_complete {
				let accumulated = s.accumulated_text.clone();
				let duration_ms = s.started_at.elapsed().as_millis() as u64;
				let output_tokens = delta.output_tokens.unwrap_or(0);
				let input_tokens = delta.input_tokens.unwrap_or(0);
				drop(state);
				self.publish_message_event(ctx, &conversation_id, "assistant", &accumulated, Some(&message_id), model.as_deref());
				self.publish_conversation_update(
					ctx,
					&conversation_id,
					"complete",
					1,
					(input_tokens + output_tokens) as usize,
					duration_ms,
					model.as_deref(),
				);
				self.state.lock().unwrap().remove(&ctx.request_id);
				return;
			}
		}
	}

	fn handle_complete_response(&self, ctx: &InspectContext, body: &[u8]) {
		let cached = {
			let state = self.state.lock().unwrap();
			state.get(&ctx.request_id).map(|s| (s.provider_name.clone(), s.path.clone()))
		};
		let Some((provider_name, path)) = cached else { return };
		let Some(provider) = self.provider_by_name(&provider_name) else { return };
		let Some(resp) = provider.parse_response(&path, body) else {
			tracing::debug!(hostname = %ctx.hostname, "failed to parse llm response body");
			return;
		};

		let conversation_id = {
			let state = self.state.lock().unwrap();
			state.get(&ctx.request_id).map(|s| s.conversation_id.clone()).unwrap_or_default()
		};

		self.publish_message_event(
			ctx,
			&conversation_id,
			"assistant",
			&resp.message.content_parts.join(""),
			None,
			resp.model.as_deref(),
		);
		self.publish_conversation_update(
			ctx,
			&conversation_id,
			"complete",
			1,
			(resp.input_tokens + resp.output_tokens) as usize,
			0,
			resp.model.as_deref(),
		);
		self.state.lock().unwrap().remove(&ctx.request_id);
	}

	fn publish_message_event(
		&self,
		ctx: &InspectContext,
		conversation_id: &str,
		role: &str,
		content: &str,
		message_id: Option<&str>,
		model: Option<&str>,
	) {
		let event = TrafficEvent {
			extra: Some(json!({
				"kind": "llm_message",
				"conversation_id": conversation_id,
				"request_id": ctx.request_id,
				"role": role,
				"message": content,
				"message_id": message_id,
				"model": model,
			})),
			..TrafficEvent::new(ctx.hostname.clone(), "llm_message", ctx.connection_id.clone(), ctx.request_id.clone())
		};
		self.bus.publish(event);
	}

	fn publish_conversation_update(
		&self,
		ctx: &InspectContext,
		conversation_id: &str,
		status: &str,
		message_count: usize,
		total_tokens: usize,
		duration_ms: u64,
		model: Option<&str>,
	) {
		let event = TrafficEvent {
			extra: Some(json!({
				"kind": "conversation",
				"conversation_id": conversation_id,
				"status": status,
				"message_count": message_count,
				"total_tokens": total_tokens,
				"duration_ms": duration_ms,
				"model": model,
			})),
			..TrafficEvent::new(ctx.hostname.clone(), "conversation", ctx.connection_id.clone(), ctx.request_id.clone())
		};
		self.bus.publish(event);
	}
}

#[async_trait]
impl Inspector for LlmInspector {
	fn name(&self) -> &str {
		"llm"
	}

	fn should_inspect(&self, hostname: &str) -> bool {
		self.providers.iter().any(|p| p.matches_host(hostname))
	}

	async fn inspect(&self, ctx: &InspectContext, data: &[u8]) -> InspectOutcome {
		use crate::inspect::Direction;

		let is_response = matches!(ctx.direction, Direction::ServerToClient);
		let chunk = self.http.process(&ctx.request_id, &ctx.hostname, is_response, data);

		let Some(message) = chunk.message else {
			return InspectOutcome::Continue;
		};

		if !is_response {
			self.handle_request(ctx, &message.body, &message.path);
		} else if chunk.is_sse {
			self.handle_sse_chunk(ctx, &message.body);
		} else if chunk.is_complete {
			self.handle_complete_response(ctx, &message.body);
		}

		InspectOutcome::Continue
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn short_hash_is_eight_hex_chars() {
		let h = short_hash("user-42");
		assert_eq!(h.len(), 8);
		assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
	}
}
