//! The `OpenAIClient` struct implements `ClientWrapper` for any OpenAI-compatible Chat
//! Completions endpoint, streaming tokens and tool calls over server-sent events.
//!
//! # Key Features
//!
//! - **Groq by default**: base URL [`GROQ_BASE_URL`] and model [`DEFAULT_MODEL`].
//! - **Tool calling**: registered tools are sent as function definitions; streamed tool-call
//!   fragments are reassembled per call index.
//! - **Idle timeout**: a read that produces nothing for `idle_timeout` ends the completion
//!   with `FinishReason::Error`.
//! - **Automatic Usage Capture**: when the backend reports usage, `get_last_usage()` returns it.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use secureguard::client_wrapper::{ClientWrapper, CompletionEvent, Message};
//! use secureguard::clients::openai::OpenAIClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OpenAIClient::new(std::env::var("GROQ_API_KEY").ok());
//!     let mut stream = client
//!         .stream_completion(&[Message::user("Hello!")], &[], 256)
//!         .await?;
//!     while let Some(event) = stream.next().await {
//!         if let CompletionEvent::TokenChunk(text) = event {
//!             print!("{}", text);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use crate::secureguard::client_wrapper::{
    ClientWrapper, CompletionEvent, CompletionStream, Message, Role, TokenUsage,
};
use crate::secureguard::clients::sse::SseDecoder;
use crate::secureguard::error::SecureGuardError;
use crate::secureguard::http_pool::get_http_client;
use crate::secureguard::tool_registry::{function_schemas, ToolSpec};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Groq's OpenAI-compatible API root.
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "openai/gpt-oss-120b";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client wrapper for OpenAI-compatible streaming Chat Completions.
pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    idle_timeout: Duration,
    /// Storage for the token usage reported by the most recent completion.
    token_usage: Arc<Mutex<Option<TokenUsage>>>,
}

impl OpenAIClient {
    /// Construct a client for Groq with the default model. `None` (or an empty key) yields
    /// an unconfigured client that reports itself unavailable.
    pub fn new(api_key: Option<String>) -> Self {
        Self::new_with_base_url(api_key, DEFAULT_MODEL, GROQ_BASE_URL)
    }

    /// Construct a client targeting a custom OpenAI compatible base URL.
    pub fn new_with_base_url(api_key: Option<String>, model_name: &str, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        OpenAIClient {
            client: get_http_client(&base_url),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url,
            model: model_name.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            token_usage: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSpec], max_tokens: usize) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(message_to_json).collect::<Vec<_>>(),
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(function_schemas(tools));
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn message_to_json(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut value = json!({ "role": role, "content": message.content });

    if !message.tool_calls.is_empty() {
        if message.content.is_empty() {
            value["content"] = Value::Null;
        }
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                let arguments = match &call.arguments {
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                };
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": arguments }
                })
            })
            .collect();
    }
    if let Some(call_id) = &message.tool_call_id {
        value["tool_call_id"] = json!(call_id);
    }
    value
}

/// Turn a raw SSE byte stream into completion events, ending the completion with an error
/// when no bytes arrive for `idle_timeout`.
///
/// The returned stream yields exactly one `Finish` event and then ends, dropping `bytes`.
pub fn completion_events<S, B, E>(
    bytes: S,
    idle_timeout: Duration,
    usage_slot: Option<Arc<Mutex<Option<TokenUsage>>>>,
) -> CompletionStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<CompletionEvent>,
    }

    let initial = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
    };

    let events = stream::unfold(initial, move |mut state| {
        let usage_slot = usage_slot.clone();
        async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.decoder.is_finished() {
                    if let (Some(slot), Some(usage)) = (usage_slot, state.decoder.usage()) {
                        if let Ok(mut guard) = slot.lock() {
                            *guard = Some(usage.clone());
                        }
                    }
                    return None;
                }

                let produced = match tokio::time::timeout(idle_timeout, state.bytes.next()).await {
                    Ok(Some(Ok(chunk))) => state.decoder.feed(chunk.as_ref()),
                    Ok(Some(Err(err))) => {
                        log::error!(
                            "secureguard::clients::openai::completion_events(...): stream read error: {}",
                            err
                        );
                        state.decoder.fail(format!("stream read error: {}", err))
                    }
                    Ok(None) => state.decoder.finish(),
                    Err(_) => {
                        log::warn!(
                            "secureguard::clients::openai::completion_events(...): no data for {:?}, giving up",
                            idle_timeout
                        );
                        state
                            .decoder
                            .fail(format!("idle timeout after {:?}", idle_timeout))
                    }
                };
                state.pending.extend(produced);
            }
        }
    });

    Box::pin(events)
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        max_tokens: usize,
    ) -> Result<CompletionStream, SecureGuardError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            SecureGuardError::LlmUnavailable("no API key configured".to_string())
        })?;

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&self.request_body(messages, tools, max_tokens))
            .send();

        // The idle timeout also bounds the wait for the response headers.
        let response = match tokio::time::timeout(self.idle_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                log::error!(
                    "OpenAIClient::stream_completion(...): request to {} failed: {}",
                    self.base_url,
                    err
                );
                return Err(SecureGuardError::LlmUnavailable(err.to_string()));
            }
            Err(_) => {
                log::error!(
                    "OpenAIClient::stream_completion(...): {} sent no response within {:?}",
                    self.base_url,
                    self.idle_timeout
                );
                return Err(SecureGuardError::LlmUnavailable(format!(
                    "no response within {:?}",
                    self.idle_timeout
                )));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::time::timeout(self.idle_timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            log::error!(
                "OpenAIClient::stream_completion(...): API returned {}: {}",
                status,
                body
            );
            let message = format!("{}: {}", status, body.chars().take(200).collect::<String>());
            // Auth, quota and server failures mean the backend can't serve us; anything else is
            // a problem with this particular request.
            return Err(
                if status.is_server_error()
                    || status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                {
                    SecureGuardError::LlmUnavailable(message)
                } else {
                    SecureGuardError::LlmStream(message)
                },
            );
        }

        Ok(completion_events(
            response.bytes_stream(),
            self.idle_timeout,
            Some(self.token_usage.clone()),
        ))
    }

    async fn health_check(&self) -> bool {
        let Some(api_key) = self.api_key.as_deref() else {
            return false;
        };
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!(
                    "OpenAIClient::health_check(): {} answered {}",
                    self.base_url,
                    response.status()
                );
                false
            }
            Err(err) => {
                log::warn!("OpenAIClient::health_check(): {}", err);
                false
            }
        }
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&*self.token_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secureguard::client_wrapper::{FinishReason, ToolCallRequest};
    use crate::secureguard::tool_registry::{ToolParameter, ToolParameterType};

    #[test]
    fn test_request_body_includes_tools() {
        let client = OpenAIClient::new(Some("key".into()));
        let tools = vec![ToolSpec::new("list_cases", "List cases")
            .with_parameter(ToolParameter::new("status", ToolParameterType::String))];
        let body = client.request_body(&[Message::user("hi")], &tools, 1024);

        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "list_cases");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_tool_messages_serialize() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "health".into(),
            arguments: json!({}),
        };
        let assistant = message_to_json(&Message::assistant("").with_tool_calls(vec![call]));
        assert!(assistant["content"].is_null());
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], "{}");

        let result = message_to_json(&Message::tool_result("call_1", "{\"ok\":true}"));
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn test_unconfigured_client() {
        let client = OpenAIClient::new(Some("   ".into()));
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let client = OpenAIClient::new(None);
        let result = client.stream_completion(&[Message::user("hi")], &[], 16).await;
        assert!(matches!(result, Err(SecureGuardError::LlmUnavailable(_))));
    }

    #[tokio::test]
    async fn test_completion_events_from_bytes() {
        let frames: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n\n".to_vec()),
        ];
        let slot = Arc::new(Mutex::new(None));
        let events: Vec<_> = completion_events(
            stream::iter(frames),
            Duration::from_secs(1),
            Some(slot.clone()),
        )
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                CompletionEvent::TokenChunk("Hi".into()),
                CompletionEvent::Finish(FinishReason::Stop),
            ]
        );
        assert_eq!(slot.lock().unwrap().as_ref().map(|u| u.total_tokens), Some(2));
    }

    #[tokio::test]
    async fn test_idle_timeout_finishes_with_error() {
        let first: Vec<Result<Vec<u8>, String>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"slow\"}}]}\n\n".to_vec())];
        let stalled = stream::iter(first).chain(stream::pending());
        let events: Vec<_> =
            completion_events(stalled, Duration::from_millis(50), None).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], CompletionEvent::TokenChunk("slow".into()));
        assert!(matches!(
            &events[1],
            CompletionEvent::Finish(FinishReason::Error(msg)) if msg.contains("idle timeout")
        ));
    }

    #[tokio::test]
    async fn test_read_error_finishes_with_error() {
        let frames: Vec<Result<Vec<u8>, String>> = vec![Err("connection reset".into())];
        let events: Vec<_> =
            completion_events(stream::iter(frames), Duration::from_secs(1), None)
                .collect()
                .await;
        assert!(matches!(
            events.as_slice(),
            [CompletionEvent::Finish(FinishReason::Error(_))]
        ));
    }
}
