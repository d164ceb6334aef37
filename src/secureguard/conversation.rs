//! Conversation state.
//!
//! A [`Conversation`] is the bounded, append-only history of [`Turn`]s for one session.
//! It is passed explicitly into every orchestrator call; nothing else mutates it.
//!
//! **Key properties:**
//! - **Bounded**: never holds more than `max_turns` turns; the oldest turn is evicted first.
//! - **Ordered**: turns are kept in creation order.
//! - **Exclusive**: the [`ConversationStore`] hands each session out behind an async mutex,
//!   so at most one query is in flight per conversation.
//!
//! ```rust
//! use secureguard::conversation::{Conversation, Turn};
//!
//! let mut conversation = Conversation::new("session-1", 2);
//! conversation.push(Turn::user("first"));
//! conversation.push(Turn::assistant("second"));
//! conversation.push(Turn::user("third"));
//!
//! assert_eq!(conversation.len(), 2);
//! assert_eq!(conversation.turns()[0].content, "second");
//! ```

use crate::secureguard::client_wrapper::{Message, ToolCallRequest};
use crate::secureguard::error::{ErrorKind, SecureGuardError};
use crate::secureguard::tool_registry::ToolArguments;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    Success { value: Value },
    Failure { kind: ErrorKind, message: String },
}

impl InvocationResult {
    pub fn success(value: Value) -> Self {
        InvocationResult::Success { value }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        InvocationResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }

    /// Text handed back to the LLM as the tool message content.
    pub fn to_tool_message(&self) -> String {
        match self {
            InvocationResult::Success { value } => {
                serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
            }
            InvocationResult::Failure { kind, message } => serde_json::json!({
                "error": { "kind": kind, "message": message }
            })
            .to_string(),
        }
    }

    /// Human readable rendering used as the content of a `tool` turn.
    pub fn render(&self) -> String {
        match self {
            InvocationResult::Success { value } => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            InvocationResult::Failure { kind, message } => format!("{}: {}", kind, message),
        }
    }
}

impl From<SecureGuardError> for InvocationResult {
    fn from(err: SecureGuardError) -> Self {
        InvocationResult::failure(err.kind(), err.to_string())
    }
}

/// Record of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: ToolArguments,
    pub result: InvocationResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub invocations: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            invocations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Tool, content)
    }

    pub fn with_invocations(mut self, invocations: Vec<ToolInvocation>) -> Self {
        self.invocations = invocations;
        self
    }

    /// Messages replayed to the LLM for this turn.
    ///
    /// Tool turns and past invocations are flattened into plain assistant text: the
    /// call identifiers of earlier completions are not kept, and chat APIs reject tool
    /// messages that don't answer a tool call of the immediately preceding message.
    fn to_messages(&self) -> Vec<Message> {
        match self.role {
            TurnRole::User => vec![Message::user(self.content.clone())],
            TurnRole::Assistant => {
                let mut content = String::new();
                for invocation in &self.invocations {
                    content.push_str(&format!(
                        "[called {} with {}: {}]\n",
                        invocation.tool_name,
                        Value::Object(invocation.arguments.clone()),
                        invocation.result.to_tool_message()
                    ));
                }
                content.push_str(&self.content);
                vec![Message::assistant(content)]
            }
            TurnRole::Tool => {
                let name = self
                    .invocations
                    .first()
                    .map(|i| i.tool_name.as_str())
                    .unwrap_or("tool");
                vec![Message::assistant(format!(
                    "Direct tool call result ({}):\n{}",
                    name, self.content
                ))]
            }
        }
    }
}

/// Bounded history for one session.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    turns: VecDeque<Turn>,
    max_turns: usize,
    /// Recovery epoch in which the LLM was found unavailable for this conversation.
    llm_degraded_epoch: Option<u64>,
}

impl Conversation {
    /// Create an empty conversation. `max_turns` is clamped to at least 1.
    pub fn new(id: impl Into<String>, max_turns: usize) -> Self {
        Self {
            id: id.into(),
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
            llm_degraded_epoch: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &VecDeque<Turn> {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    /// Append a turn, evicting the oldest turns once `max_turns` is exceeded.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            if let Some(evicted) = self.turns.pop_front() {
                log::debug!(
                    "conversation {}: evicted {:?} turn from {}",
                    self.id,
                    evicted.role,
                    evicted.created_at
                );
            }
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.llm_degraded_epoch = None;
    }

    /// Full history rendered as chat messages, oldest first.
    pub fn to_messages(&self) -> Vec<Message> {
        self.turns.iter().flat_map(Turn::to_messages).collect()
    }

    pub(crate) fn mark_llm_degraded(&mut self, epoch: u64) {
        self.llm_degraded_epoch = Some(epoch);
    }

    /// Whether the LLM was found unavailable since the last successful health re-check.
    pub(crate) fn is_llm_degraded(&self, current_epoch: u64) -> bool {
        self.llm_degraded_epoch == Some(current_epoch)
    }
}

/// Helper used by the orchestrator to build the assistant message that carried tool calls.
pub(crate) fn tool_call_message(content: &str, calls: &[ToolCallRequest]) -> Message {
    Message::assistant(content.to_string()).with_tool_calls(calls.to_vec())
}

struct SessionSlot {
    conversation: Arc<Mutex<Conversation>>,
    last_active: Instant,
}

/// Session id → conversation map.
///
/// Each conversation sits behind its own `tokio::sync::Mutex`; holding that lock for the
/// whole query is what serializes queries within a session while letting different
/// sessions proceed in parallel.
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, SessionSlot>>,
    max_turns: usize,
}

impl ConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
        }
    }

    /// Fetch the conversation for `session_id`, creating it on first use.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Mutex<Conversation>> {
        let mut sessions = match self.sessions.write() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                log::debug!("creating conversation for session {}", session_id);
                SessionSlot {
                    conversation: Arc::new(Mutex::new(Conversation::new(
                        session_id,
                        self.max_turns,
                    ))),
                    last_active: Instant::now(),
                }
            });
        slot.last_active = Instant::now();
        slot.conversation.clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<Conversation>>> {
        let sessions = match self.sessions.read() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.get(session_id).map(|slot| slot.conversation.clone())
    }

    /// Drop the conversation for `session_id`. Returns whether one existed.
    ///
    /// A query already running for the session keeps its own handle and finishes against
    /// the detached conversation.
    pub fn clear(&self, session_id: &str) -> bool {
        let mut sessions = match self.sessions.write() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.remove(session_id).is_some()
    }

    /// Drop every conversation untouched for longer than `max_idle`. Returns how many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = match self.sessions.write() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = sessions.len();
        sessions.retain(|_, slot| slot.last_active.elapsed() <= max_idle);
        let evicted = before - sessions.len();
        if evicted > 0 {
            log::info!("evicted {} idle conversation(s)", evicted);
        }
        evicted
    }

    pub fn active_count(&self) -> usize {
        match self.sessions.read() {
            Ok(sessions) => sessions.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
