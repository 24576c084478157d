//! Anthropic Messages API: request normalization and an incremental reducer
//! over `content_block_start` / `content_block_delta` / `message_delta` SSE
//! events.

use std::collections::HashMap;

use serde_json::Value;

use super::{short_hash, DeltaKind, DeltaKindSlot, LlmProvider, LlmResponse, NormalizedMessage, RequestInfo, TokenDelta};

pub struct AnthropicProvider {
	hostnames: Vec<String>,
}

impl AnthropicProvider {
	pub fn new(compat_hostnames: Vec<String>) -> Self {
		let mut hostnames = vec!["api.anthropic.com".to_string()];
		hostnames.extend(compat_hostnames);
		Self { hostnames }
	}
}

impl Default for AnthropicProvider {
	fn default() -> Self {
		Self::new(Vec::new())
	}
}

fn content_part_from_block(block: &Value) -> Option<String> {
	match block.get("type").and_then(Value::as_str) {
		Some("text") => block.get("text").and_then(Value::as_str).map(|s| s.to_string()),
		Some("thinking") => block.get("thinking").and_then(Value::as_str).map(|t| format!("[Thinking] {t} [/Thinking]")),
		Some("redacted_thinking") => Some("[Redacted Thinking] ".to_string()),
		Some("tool_use") => {
			let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
			Some(format!("[ToolUse: {name}]"))
		}
		Some("tool_result") => Some("[ToolResult]".to_string()),
		_ => block.as_str().map(|s| s.to_string()),
	}
}

fn normalize_message(msg: &Value) -> NormalizedMessage {
	let role = msg.get("role").and_then(Value::as_str).unwrap_or("user").to_string();
	let mut content_parts = Vec::new();
	let mut tool_calls = Vec::new();
	let mut tool_results = Vec::new();

	match msg.get("content") {
		Some(Value::String(s)) => content_parts.push(s.clone()),
		Some(Value::Array(blocks)) => {
			for block in blocks {
				match block.get("type").and_then(Value::as_str) {
					Some("tool_use") => tool_calls.push(block.clone()),
					Some("tool_result") => tool_results.push(block.clone()),
					_ => {
						if let Some(part) = content_part_from_block(block) {
							content_parts.push(part);
						}
					}
				}
			}
		}
		_ => {}
	}

	NormalizedMessage { role, content_parts, tool_calls, tool_results, name: None }
}

impl LlmProvider for AnthropicProvider {
	fn name(&self) -> &str {
		"anthropic"
	}

	fn matches_host(&self, hostname: &str) -> bool {
		self.hostnames.iter().any(|h| h == hostname)
	}

	fn matches_request(&self, hostname: &str, path: &str, _body_sample: &[u8]) -> bool {
		self.matches_host(hostname) && path == "/v1/messages"
	}

	fn parse_full_request(&self, body: &[u8]) -> Option<RequestInfo> {
		let value: Value = serde_json::from_slice(body).ok()?;

		let model = value.get("model").and_then(Value::as_str).map(|s| s.to_string());

		let system_prompts = match value.get("system") {
			Some(Value::String(s)) => vec![s.clone()],
			Some(Value::Array(blocks)) => blocks.iter().filter_map(|b| b.get("text").and_then(Value::as_str)).map(|s| s.to_string()).collect(),
			_ => Vec::new(),
		};

		let messages: Vec<NormalizedMessage> =
			value.get("messages").and_then(Value::as_array).map(|arr| arr.iter().map(normalize_message).collect()).unwrap_or_default();

		let tools = value.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();

		let conversation_id = value
			.get("metadata")
			.and_then(|m| m.get("user_id"))
			.and_then(Value::as_str)
			.map(|uid| format!("anthropic-{}", short_hash(uid)))
			.unwrap_or_else(|| "anthropic-default".to_string());

		Some(RequestInfo { conversation_id, model, messages, system_prompts, tools })
	}

	fn parse_response(&self, _path: &str, body: &[u8]) -> Option<LlmResponse> {
		let value: Value = serde_json::from_slice(body).ok()?;

		let content_parts: Vec<String> =
			value.get("content").and_then(Value::as_array).map(|blocks| blocks.iter().filter_map(content_part_from_block).collect()).unwrap_or_default();

		let model = value.get("model").and_then(Value::as_str).map(|s| s.to_string());
		let stop_reason = value.get("stop_reason").and_then(Value::as_str).map(|s| s.to_string());
		let input_tokens = value.get("usage").and_then(|u| u.get("input_tokens")).and_then(Value::as_u64).unwrap_or(0);
		let output_tokens = value.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64).unwrap_or(0);

		Some(LlmResponse {
			message: NormalizedMessage { role: "assistant".to_string(), content_parts, tool_calls: Vec::new(), tool_results: Vec::new(), name: None },
			model,
			input_tokens,
			output_tokens,
			stop_reason,
		})
	}

	fn parse_sse_stream_from(&self, body: &[u8], start_pos: usize) -> Vec<TokenDelta> {
		let text = String::from_utf8_lossy(body);
		let mut deltas: Vec<TokenDelta> = Vec::new();
		let mut block_kinds: HashMap<u64, (Option<String>, Option<String>)> = HashMap::new();
		let mut offset = 0usize;

		for event_block in split_keep_offsets(&text) {
			let block_start = offset;
			offset += event_block.len() + 2; // the "\n\n" separator this split discarded

			let Some(data_line) = event_block.lines().find(|l| l.starts_with("data:")) else { continue };
			let payload = data_line.trim_start_matches("data:").trim();
			let Ok(value) = serde_json::from_str::<Value>(payload) else { continue };
			let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();

			match event_type {
				"content_block_start" => {
					let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
					let block = value.get("content_block");
					let tool_id = block.and_then(|b| b.get("id")).and_then(Value::as_str).map(|s| s.to_string());
					let tool_name = block.and_then(|b| b.get("name")).and_then(Value::as_str).map(|s| s.to_string());
					block_kinds.insert(index, (tool_id, tool_name));
				}
				"content_block_delta" => {
					if block_start < start_pos {
						continue;
					}
					let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
					let delta = value.get("delta");
					let delta_type = delta.and_then(|d| d.get("type")).and_then(Value::as_str).unwrap_or_default();

					let (kind, text_piece) = match delta_type {
						"text_delta" => (DeltaKind::Text, delta.and_then(|d| d.get("text")).and_then(Value::as_str).unwrap_or_default().to_string()),
						"thinking_delta" => (DeltaKind::Thinking, delta.and_then(|d| d.get("thinking")).and_then(Value::as_str).unwrap_or_default().to_string()),
						"input_json_delta" => {
							(DeltaKind::Tool(index as u32), delta.and_then(|d| d.get("partial_json")).and_then(Value::as_str).unwrap_or_default().to_string())
						}
						_ => continue,
					};

					if let Some(last) = deltas.last_mut() {
						if last.kind == Some(DeltaKindSlot(kind)) && !last.is_complete {
							last.text.push_str(&text_piece);
							continue;
						}
					}
					let (tool_id, tool_name) = block_kinds.get(&index).cloned().unwrap_or((None, None));
					deltas.push(TokenDelta {
						kind: Some(DeltaKindSlot(kind)),
						text: text_piece,
						tool_id: if matches!(kind, DeltaKind::Tool(_)) { tool_id } else { None },
						tool_name: if matches!(kind, DeltaKind::Tool(_)) { tool_name } else { None },
						is_complete: false,
						stop_reason: None,
						output_tokens: None,
						input_tokens: None,
					});
				}
				"message_delta" => {
					if block_start < start_pos {
						continue;
					}
					let stop_reason = value.get("delta").and_then(|d| d.get("stop_reason")).and_then(Value::as_str).map(|s| s.to_string());
					let output_tokens = value.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64);

					if let Some(last) = deltas.last_mut() {
						last.is_complete = true;
						last.stop_reason = stop_reason;
						last.output_tokens = output_tokens;
					} else {
						deltas.push(TokenDelta {
							kind: None,
							text: String::new(),
							tool_id: None,
							tool_name: None,
							is_complete: true,
							stop_reason,
							output_tokens,
							input_tokens: None,
						});
					}
				}
				"message_start" => {
					let input_tokens = value.get("message").and_then(|m| m.get("usage")).and_then(|u| u.get("input_tokens")).and_then(Value::as_u64);
					if let Some(last) = deltas.last_mut() {
						last.input_tokens = input_tokens;
					}
				}
				_ => {}
			}
		}

		deltas
	}
}

/// Splits on a blank line the way SSE frames events, discarding the
/// separator itself (the caller re-adds its length to track byte offsets).
fn split_keep_offsets(text: &str) -> Vec<&str> {
	text.split("\n\n").filter(|s| !s.trim().is_empty()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn matches_canonical_host_and_path() {
		let provider = AnthropicProvider::default();
		assert!(provider.matches_request("api.anthropic.com", "/v1/messages", b""));
		assert!(!provider.matches_request("api.anthropic.com", "/v1/complete", b""));
	}

	#[test]
	fn conversation_id_falls_back_to_default_without_metadata() {
		let provider = AnthropicProvider::default();
		let body = br#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#;
		let info = provider.parse_full_request(body).unwrap();
		assert_eq!(info.conversation_id, "anthropic-default");
	}

	#[test]
	fn sse_stream_reference_transcript_merges_text_then_completes() {
		let provider = AnthropicProvider::default();
		let body = concat!(
			"event: content_block_start\n",
			"data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\"}}\n\n",
			"event: content_block_delta\n",
			"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
			"event: content_block_delta\n",
			"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" World\"}}\n\n",
			"event: content_block_delta\n",
			"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"!\"}}\n\n",
			"event: message_delta\n",
			"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":10}}\n\n",
		);
		let deltas = provider.parse_sse_stream_from(body.as_bytes(), 0);
		assert_eq!(deltas.len(), 1);
		assert_eq!(deltas[0].text, "Hello World!");
		assert!(deltas[0].is_complete);
		assert_eq!(deltas[0].stop_reason.as_deref(), Some("end_turn"));
		assert_eq!(deltas[0].output_tokens, Some(10));
	}
}
