//! Events produced while answering a query.
//!
//! Two families live here:
//!
//! - [`StreamEvent`]: the caller-facing response protocol. Every query produces an ordered
//!   sequence of these, terminated by exactly one [`StreamEvent::Done`].
//! - [`RouterEvent`]: an observability side channel delivered to an optional
//!   [`EventHandler`]. It reports phase transitions, LLM rounds and anomalies such as tool
//!   results discarded after the caller went away.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use secureguard::event::{EventHandler, RouterEvent};
//!
//! struct Logger;
//!
//! #[async_trait]
//! impl EventHandler for Logger {
//!     async fn on_router_event(&self, event: &RouterEvent) {
//!         if let RouterEvent::ToolRoundCompleted { session_id, round, calls } = event {
//!             println!("{}: round {} ran {} tool(s)", session_id, round, calls);
//!         }
//!     }
//! }
//! ```

use crate::secureguard::conversation::ToolInvocation;
use crate::secureguard::error::{ErrorKind, SecureGuardError};
use crate::secureguard::tool_registry::ToolArguments;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One unit of a streamed response.
///
/// Serialized with a `type` tag, e.g. `{"type":"token","text":"Hello"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A piece of LLM output, forwarded as soon as it arrives.
    Token { text: String },
    ToolCallStarted {
        name: String,
        arguments: ToolArguments,
    },
    ToolCallFinished { invocation: ToolInvocation },
    Error { kind: ErrorKind, message: String },
    /// Terminates the stream.
    Done,
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Token { text: text.into() }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            kind,
            message: message.into(),
        }
    }

    /// The `type` tag, also used as the SSE event name.
    pub fn label(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::ToolCallStarted { .. } => "tool_call_started",
            StreamEvent::ToolCallFinished { .. } => "tool_call_finished",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done)
    }
}

impl From<&SecureGuardError> for StreamEvent {
    fn from(err: &SecureGuardError) -> Self {
        StreamEvent::error(err.kind(), err.to_string())
    }
}

/// Orchestrator phases, reported through [`RouterEvent::PhaseChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    ParsingQuery,
    DirectDispatch,
    LlmTurn,
    ToolExecuting,
    Finalizing,
}

/// Observability events emitted by the [`Orchestrator`](crate::orchestrator::Orchestrator).
///
/// # Event Flow (LLM path with one tool round)
///
/// ```text
/// QueryStarted
///   └─ PhaseChanged(ParsingQuery) ─ PhaseChanged(LlmTurn)
///   └─ PhaseChanged(ToolExecuting) ─ ToolRoundCompleted { round: 1 }
///   └─ PhaseChanged(LlmTurn) ─ PhaseChanged(Finalizing)
/// QueryFinished
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    QueryStarted {
        session_id: String,
        /// First ~120 characters of the query.
        query_preview: String,
        direct: bool,
    },
    PhaseChanged {
        session_id: String,
        phase: QueryPhase,
    },
    /// All tool calls requested by one completion have been handled.
    ToolRoundCompleted {
        session_id: String,
        round: usize,
        calls: usize,
    },
    /// The LLM was found unavailable; the conversation now runs in direct-call mode.
    LlmDegraded { session_id: String, reason: String },
    /// A health re-check succeeded and degraded conversations may use the LLM again.
    LlmRecovered,
    /// A tool finished after the caller stopped listening; its result was dropped.
    ResultDiscarded {
        session_id: String,
        tool_name: String,
    },
    QueryFinished {
        session_id: String,
        /// Number of events delivered, `Done` included.
        events: usize,
        cancelled: bool,
    },
}

/// Receives [`RouterEvent`]s. The default implementation is a no-op.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_router_event(&self, _event: &RouterEvent) {}
}
