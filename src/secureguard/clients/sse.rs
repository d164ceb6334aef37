//! Incremental decoder for OpenAI-compatible Chat Completions SSE streams.
//!
//! Bytes go in as they arrive off the wire; [`CompletionEvent`]s come out.  Text deltas are
//! forwarded immediately.  Tool-call fragments are accumulated per call index and released,
//! in index order, when the completion finishes.  The decoder guarantees that exactly one
//! `Finish` event is produced over its lifetime, no matter how the stream ends.

use crate::secureguard::client_wrapper::{
    CompletionEvent, FinishReason, TokenUsage, ToolCallRequest,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Maximum size for buffered, not yet terminated event text.
const MAX_BUF: usize = 16 * 1024 * 1024;

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    /// Groq reports usage here instead of `usage`.
    #[serde(default)]
    x_groq: Option<GroqExtension>,
}

#[derive(Deserialize)]
struct GroqExtension {
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful SSE → [`CompletionEvent`] converter.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending_calls: BTreeMap<u32, PendingToolCall>,
    finished: bool,
    usage: Option<TokenUsage>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the terminal `Finish` event has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Usage reported by the backend, if any chunk carried it.
    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }

    /// Feed raw bytes; returns every event completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<CompletionEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUF {
            self.buffer.clear();
            return self.fail("SSE buffer exceeded 16 MiB");
        }

        let mut events = Vec::new();
        while let Some((end, separator)) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + separator).collect();
            let text = String::from_utf8_lossy(&block[..end]).into_owned();
            events.extend(self.handle_event(&text));
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// The byte stream ended. Produces the terminal event if the backend never sent one.
    pub fn finish(&mut self) -> Vec<CompletionEvent> {
        if self.finished {
            return Vec::new();
        }
        let trailing = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if !trailing.iter().all(u8::is_ascii_whitespace) {
            let text = String::from_utf8_lossy(&trailing).into_owned();
            events.extend(self.handle_event(&text));
        }
        if !self.finished {
            events.extend(self.fail("stream ended before a finish reason was received"));
        }
        events
    }

    /// Terminate the completion with an error, dropping any half-built tool calls.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<CompletionEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.pending_calls.clear();
        vec![CompletionEvent::Finish(FinishReason::Error(message.into()))]
    }

    fn handle_event(&mut self, text: &str) -> Vec<CompletionEvent> {
        let Some(data) = extract_data(text) else {
            return Vec::new();
        };

        if data.trim() == "[DONE]" {
            let mut events = self.flush_tool_calls();
            let reason = if events.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            };
            self.finished = true;
            events.push(CompletionEvent::Finish(reason));
            return events;
        }

        let chunk: StreamChunk = match serde_json::from_str(&data) {
            Ok(chunk) => chunk,
            Err(err) => {
                log::warn!(
                    "secureguard::clients::sse::SseDecoder::handle_event(...): skipping malformed chunk: {}",
                    err
                );
                return Vec::new();
            }
        };

        if let Some(usage) = chunk
            .usage
            .or_else(|| chunk.x_groq.and_then(|groq| groq.usage))
        {
            self.usage = Some(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let mut events = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                events.push(CompletionEvent::TokenChunk(text));
            }
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let pending = self.pending_calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                pending.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    pending.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    pending.arguments.push_str(&arguments);
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            let reason = match reason.as_str() {
                "stop" => FinishReason::Stop,
                "tool_calls" | "function_call" => FinishReason::ToolCalls,
                "length" => FinishReason::Length,
                other => FinishReason::Error(format!("unexpected finish reason '{}'", other)),
            };
            if matches!(reason, FinishReason::Error(_)) {
                self.pending_calls.clear();
            } else {
                events.extend(self.flush_tool_calls());
            }
            self.finished = true;
            events.push(CompletionEvent::Finish(reason));
        }

        events
    }

    fn flush_tool_calls(&mut self) -> Vec<CompletionEvent> {
        std::mem::take(&mut self.pending_calls)
            .into_iter()
            .map(|(index, call)| {
                let arguments = if call.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| Value::String(call.arguments.clone()))
                };
                let id = if call.id.is_empty() {
                    format!("call_{}", index)
                } else {
                    call.id
                };
                CompletionEvent::ToolCallRequest(ToolCallRequest {
                    id,
                    name: call.name,
                    arguments,
                })
            })
            .collect()
    }
}

/// Position of the first blank line, and the length of the separator itself.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Joined `data:` payload of one event block; `None` for comments and other fields.
fn extract_data(event: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in event.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
    }
    data
}
