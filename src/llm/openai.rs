//! OpenAI Chat Completions API: request normalization and an incremental
//! reducer over `choices[].delta` SSE events.

use serde_json::Value;

use super::{short_hash, DeltaKind, DeltaKindSlot, LlmProvider, LlmResponse, NormalizedMessage, RequestInfo, TokenDelta};

pub struct OpenAiProvider {
	hostnames: Vec<String>,
}

impl OpenAiProvider {
	pub fn new(compat_hostnames: Vec<String>) -> Self {
		let mut hostnames = vec!["api.openai.com".to_string()];
		hostnames.extend(compat_hostnames);
		Self { hostnames }
	}
}

impl Default for OpenAiProvider {
	fn default() -> Self {
		Self::new(Vec::new())
	}
}

fn normalize_message(msg: &Value) -> NormalizedMessage {
	let role = msg.get("role").and_then(Value::as_str).unwrap_or("user").to_string();
	let name = msg.get("name").and_then(Value::as_str).map(|s| s.to_string());

	let content_parts = match msg.get("content") {
		Some(Value::String(s)) => vec![s.clone()],
		Some(Value::Array(parts)) => parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).map(|s| s.to_string()).collect(),
		_ => Vec::new(),
	};

	let tool_calls = msg.get("tool_calls").and_then(Value::as_array).cloned().unwrap_or_default();

	let tool_results = if role == "tool" { vec![msg.clone()] } else { Vec::new() };

	NormalizedMessage { role, content_parts, tool_calls, tool_results, name }
}

impl LlmProvider for OpenAiProvider {
	fn name(&self) -> &str {
		"openai"
	}

	fn matches_host(&self, hostname: &str) -> bool {
		self.hostnames.iter().any(|h| h == hostname)
	}

	fn matches_request(&self, hostname: &str, path: &str, _body_sample: &[u8]) -> bool {
		self.matches_host(hostname) && path.contains("/chat/completions")
	}

	fn parse_full_request(&self, body: &[u8]) -> Option<RequestInfo> {
		let value: Value = serde_json::from_slice(body).ok()?;
		let model = value.get("model").and_then(Value::as_str).map(|s| s.to_string());
		let messages: Vec<NormalizedMessage> =
			value.get("messages").and_then(Value::as_array).map(|arr| arr.iter().map(normalize_message).collect()).unwrap_or_default();

		let system_prompts =
			messages.iter().filter(|m| m.role == "system").flat_map(|m| m.content_parts.clone()).collect::<Vec<_>>();

		let tools = value.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();

		let hash_input = messages.iter().map(|m| format!("{}:{}", m.role, m.content_parts.join(""))).collect::<Vec<_>>().join("|");
		let conversation_id = format!("openai-{}", short_hash(&hash_input));

		Some(RequestInfo { conversation_id, model, messages, system_prompts, tools })
	}

	fn parse_response(&self, _path: &str, body: &[u8]) -> Option<LlmResponse> {
		let value: Value = serde_json::from_slice(body).ok()?;
		let choice = value.get("choices").and_then(Value::as_array).and_then(|c| c.first())?;
		let message = choice.get("message")?;
		let content = message.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
		let stop_reason = choice.get("finish_reason").and_then(Value::as_str).map(|s| s.to_string());
		let model = value.get("model").and_then(Value::as_str).map(|s| s.to_string());
		let input_tokens = value.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64).unwrap_or(0);
		let output_tokens = value.get("usage").and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0);

		Some(LlmResponse {
			message: NormalizedMessage { role: "assistant".to_string(), content_parts: vec![content], tool_calls: Vec::new(), tool_results: Vec::new(), name: None },
			model,
			input_tokens,
			output_tokens,
			stop_reason,
		})
	}

	fn parse_sse_stream_from(&self, body: &[u8], start_pos: usize) -> Vec<TokenDelta> {
		let text = String::from_utf8_lossy(body);
		let mut deltas: Vec<TokenDelta> = Vec::new();
		let mut offset = 0usize;

		for line in text.split('\n') {
			let line_start = offset;
			offset += line.len() + 1;

			let Some(payload) = line.trim_end_matches('\r').strip_prefix("data:") else { continue };
			let payload = payload.trim();
			if payload == "[DONE]" {
				if let Some(last) = deltas.last_mut() {
					last.is_complete = true;
				}
				continue;
			}
			if line_start < start_pos {
				continue;
			}
			let Ok(value) = serde_json::from_str::<Value>(payload) else { continue };
			let Some(choice) = value.get("choices").and_then(Value::as_array).and_then(|c| c.first()) else { continue };
			let delta = choice.get("delta");
			let finish_reason = choice.get("finish_reason").and_then(Value::as_str).map(|s| s.to_string());

			if let Some(content) = delta.and_then(|d| d.get("content")).and_then(Value::as_str) {
				if let Some(last) = deltas.last_mut() {
					if last.kind == Some(DeltaKindSlot(DeltaKind::Text)) && !last.is_complete {
						last.text.push_str(content);
						continue;
					}
				}
				deltas.push(TokenDelta {
					kind: Some(DeltaKindSlot(DeltaKind::Text)),
					text: content.to_string(),
					tool_id: None,
					tool_name: None,
					is_complete: false,
					stop_reason: None,
					output_tokens: None,
					input_tokens: None,
				});
			}

			if let Some(reason) = finish_reason {
				if let Some(last) = deltas.last_mut() {
					last.is_complete = true;
					last.stop_reason = Some(reason);
				}
			}
		}

		deltas
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn matches_chat_completions_path_anywhere() {
		let provider = OpenAiProvider::default();
		assert!(provider.matches_request("api.openai.com", "/v1/chat/completions", b""));
		assert!(!provider.matches_request("api.openai.com", "/v1/embeddings", b""));
	}

	#[test]
	fn conversation_id_derived_from_message_content() {
		let provider = OpenAiProvider::default();
		let body = br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#;
		let info = provider.parse_full_request(body).unwrap();
		assert!(info.conversation_id.starts_with("openai-"));
		assert_eq!(info.conversation_id.len(), "openai-".len() + 8);
	}
}
