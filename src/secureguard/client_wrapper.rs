use crate::secureguard::error::SecureGuardError;
use crate::secureguard::tool_registry::ToolSpec;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Mutex;

/// Represents the possible roles for a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    // set by the router to describe the assistant and its tools
    System,
    User,
    Assistant,
    // carries the result of one tool call back to the model
    Tool,
}

/// A tool call the model asked for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier assigned by the backend; echoed back on the matching tool message.
    pub id: String,
    pub name: String,
    /// Parsed arguments. A payload that was not valid JSON is kept as a JSON string so
    /// validation can reject it.
    pub arguments: Value,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Represents a generic message to be sent to an LLM.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The actual content of the message.
    pub content: String,
    /// Tool calls made by an assistant message.
    pub tool_calls: Vec<ToolCallRequest>,
    /// For `Role::Tool` messages, the id of the call being answered.
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The result of the tool call identified by `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Why a completion ended.
#[derive(Clone, Debug, PartialEq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    /// The stream broke off: transport failure, malformed payload or idle timeout.
    Error(String),
}

/// One item of a streamed completion.
#[derive(Clone, Debug, PartialEq)]
pub enum CompletionEvent {
    TokenChunk(String),
    ToolCallRequest(ToolCallRequest),
    /// Always the last item of a stream, and emitted exactly once.
    Finish(FinishReason),
}

/// A lazily pulled completion. Dropping it cancels the underlying request.
pub type CompletionStream = Pin<Box<dyn Stream<Item = CompletionEvent> + Send>>;

/// A ClientWrapper is a wrapper around a specific streaming LLM service.
/// It provides a common interface to request completions that may call tools.
/// It does not keep track of the conversation; the Orchestrator builds the full message
/// list from a Conversation on every call.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Model identifier used in requests and status output.
    fn model_name(&self) -> &str;

    /// Whether the client has what it needs (credentials, endpoint) to make a call at all.
    /// An unconfigured client is treated as unavailable without a network round trip.
    fn is_configured(&self) -> bool {
        true
    }

    /// Start a streamed completion.
    /// - `messages`: full prompt, oldest first.
    /// - `tools`: tools the model may call; empty disables tool calling.
    /// - `max_tokens`: completion budget.
    ///
    /// Fails with [`SecureGuardError::LlmUnavailable`] when the backend can't be reached or
    /// refuses the request. Failures after the stream started surface as
    /// `CompletionEvent::Finish(FinishReason::Error(_))` instead.
    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        max_tokens: usize,
    ) -> Result<CompletionStream, SecureGuardError>;

    /// Lightweight availability check used to clear a degraded conversation.
    async fn health_check(&self) -> bool;

    /// Usage reported by the *last* completion.
    /// Returns None for clients without a usage slot.
    fn get_last_usage(&self) -> Option<TokenUsage> {
        self.usage_slot()
            .and_then(|slot| slot.lock().ok().and_then(|u| u.clone()))
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}
