//! End-to-end exercise of the LLM inspector against the event bus: a
//! streamed Anthropic response should emit token events whose deltas
//! concatenate into the final assistant message's text.

use std::sync::Arc;

use janus_gate::events::EventBus;
use janus_gate::inspect::{Direction, InspectContext, Inspector};
use janus_gate::llm::anthropic::AnthropicProvider;
use janus_gate::llm::LlmInspector;

fn ctx(direction: Direction, request_id: &str) -> InspectContext {
	InspectContext {
		direction,
		hostname: "api.anthropic.com".to_string(),
		connection_id: "c1".to_string(),
		request_id: request_id.to_string(),
	}
}

#[tokio::test]
async fn streamed_response_token_deltas_concatenate_into_final_message() {
	let bus = Arc::new(EventBus::new(100, 100));
	let mut subscription = bus.subscribe();
	let inspector = LlmInspector::new(0, bus.clone(), vec![Arc::new(AnthropicProvider::default())]);

	let request_body = br#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#;
	let request = [
		b"POST /v1/messages HTTP/1.1\r\nHost: api.anthropic.com\r\nContent-Length: ".to_vec(),
		request_body.len().to_string().into_bytes(),
		b"\r\n\r\n".to_vec(),
		request_body.to_vec(),
	]
	.concat();
	inspector.inspect(&ctx(Direction::ClientToServer, "c1-1"), &request).await;

	let sse_head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n";
	let event1 = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n";
	let event2 = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" World\"}}\n\n";
	let event3 = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"!\"}}\n\n";
	let event4 = "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":10}}\n\n";

	inspector.inspect(&ctx(Direction::ServerToClient, "c1-1"), format!("{sse_head}{event1}").as_bytes()).await;
	inspector.inspect(&ctx(Direction::ServerToClient, "c1-1"), event2.as_bytes()).await;
	inspector.inspect(&ctx(Direction::ServerToClient, "c1-1"), event3.as_bytes()).await;
	inspector.inspect(&ctx(Direction::ServerToClient, "c1-1"), event4.as_bytes()).await;

	let mut token_deltas = Vec::new();
	let mut final_message = None;
	while let Ok(event) = subscription.receiver.try_recv() {
		let Some(extra) = &event.extra else { continue };
		match extra.get("kind").and_then(|v| v.as_str()) {
			Some("llm_token") => {
				if let Some(delta) = extra.get("delta").and_then(|v| v.as_str()) {
					token_deltas.push(delta.to_string());
				}
			}
			Some("llm_message") if extra.get("role").and_then(|v| v.as_str()) == Some("assistant") => {
				if let Some(msg) = extra.get("message").and_then(|v| v.as_str()) {
					if !msg.is_empty() {
						final_message = Some(msg.to_string());
					}
				}
			}
			_ => {}
		}
	}

	assert_eq!(token_deltas.concat(), "Hello World!");
	assert_eq!(final_message.as_deref(), Some("Hello World!"));
}
