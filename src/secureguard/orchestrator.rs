//! Query orchestration: the core of SecureGuard.
//!
//! The [`Orchestrator`] takes one raw user query plus the [`Conversation`] it belongs to and
//! produces an ordered sequence of [`StreamEvent`]s.  Two paths exist:
//!
//! - **Direct dispatch**: queries starting with `tool:` are parsed, validated against the
//!   [`ToolRegistry`] and executed through the [`ProtocolClient`]. The LLM is never involved.
//! - **LLM turn**: everything else is sent to the LLM along with the tool catalog.  Tokens
//!   are forwarded as they arrive; tool calls requested by the model are executed and their
//!   results fed back until the model stops asking, or `max_tool_rounds` is exhausted.
//!
//! # State machine
//!
//! ```text
//! Idle → ParsingQuery ─┬─ DirectDispatch ───────────────┬─ Finalizing → Idle
//!                      └─ LlmTurn ⇄ ToolExecuting ──────┘
//! ```
//!
//! Every query ends with exactly one [`StreamEvent::Done`], including queries that fail and
//! queries whose task panics.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use secureguard::catalog::default_registry;
//! use secureguard::clients::openai::OpenAIClient;
//! use secureguard::orchestrator::Orchestrator;
//! use secureguard::protocol_client::ProtocolClient;
//! use secureguard::tool_transport::HttpToolTransport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(default_registry());
//!     let protocol = Arc::new(ProtocolClient::new(
//!         Arc::new(HttpToolTransport::new("http://localhost:9002")),
//!         registry.clone(),
//!     ));
//!     let llm = Arc::new(OpenAIClient::new(std::env::var("GROQ_API_KEY").ok()));
//!     let orchestrator = Arc::new(Orchestrator::new(registry, protocol, llm));
//!
//!     let mut events = orchestrator.stream_query("session-1", "tool: get_security_summary");
//!     while let Some(event) = events.next().await {
//!         println!("{}", serde_json::to_string(&event).unwrap());
//!     }
//! }
//! ```

use crate::secureguard::client_wrapper::{
    ClientWrapper, CompletionEvent, CompletionStream, FinishReason, Message, ToolCallRequest,
};
use crate::secureguard::conversation::{
    tool_call_message, Conversation, ConversationStore, InvocationResult, ToolInvocation, Turn,
};
use crate::secureguard::error::{ErrorKind, SecureGuardError};
use crate::secureguard::event::{EventHandler, QueryPhase, RouterEvent, StreamEvent};
use crate::secureguard::prompt::{system_prompt, unavailable_message};
use crate::secureguard::protocol_client::{HealthStatus, ProtocolClient};
use crate::secureguard::query::{is_direct_call, parse_direct_call};
use crate::secureguard::tool_registry::{ToolArguments, ToolRegistry, ToolSpec};
use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Caller-facing event stream returned by [`Orchestrator::stream_query`].
pub type EventStream = ReceiverStream<StreamEvent>;

/// Tunables for the [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Completions whose tool calls were executed, per query.
    pub max_tool_rounds: usize,
    /// `max_tokens` for every completion request.
    pub completion_budget: usize,
    /// Turns kept per conversation.
    pub max_turns: usize,
    /// Events buffered between the query task and a slow consumer.
    pub channel_capacity: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            completion_budget: 1024,
            max_turns: 20,
            channel_capacity: 64,
        }
    }
}

/// Marker returned once the consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Write side of a query's event stream.
///
/// Tracks whether `Done` went out and whether the receiver was dropped; after either, every
/// further emit is refused.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    session_id: String,
    sent: usize,
    done: bool,
    cancelled: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>, session_id: impl Into<String>) -> Self {
        Self {
            tx,
            session_id: session_id.into(),
            sent: 0,
            done: false,
            cancelled: false,
        }
    }

    pub async fn emit(&mut self, event: StreamEvent) -> Result<(), Cancelled> {
        if self.done || self.is_cancelled() {
            return Err(Cancelled);
        }
        let is_done = event.is_done();
        if self.tx.send(event).await.is_err() {
            log::debug!("session {}: consumer went away", self.session_id);
            self.cancelled = true;
            return Err(Cancelled);
        }
        self.sent += 1;
        self.done = is_done;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled || self.tx.is_closed()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn sent(&self) -> usize {
        self.sent
    }
}

/// `/api/health` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `healthy` when both the tool server and the LLM are usable, `degraded` otherwise.
    pub status: &'static str,
    pub mcp_reachable: bool,
    pub llm_available: bool,
    pub latency_ms: u64,
    pub components: HealthComponents,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthComponents {
    pub mcp_server: &'static str,
    pub llm: &'static str,
}

/// `/api/status` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStatus {
    pub mcp: McpStatus,
    pub llm: LlmStatus,
    pub sessions: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpStatus {
    pub url: String,
    pub connected: bool,
    pub latency_ms: u64,
    pub tools_count: usize,
    pub available_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmStatus {
    pub available: bool,
    pub configured: bool,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: usize,
}

/// Everything accumulated while answering one LLM-path query.
#[derive(Default)]
struct LlmTurnState {
    text: String,
    invocations: Vec<ToolInvocation>,
    rounds: usize,
    /// Message of the error event that ended the turn, if any.
    error: Option<String>,
}

/// Routes queries to tools and the LLM, streaming the results.
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    protocol: Arc<ProtocolClient>,
    llm: Arc<dyn ClientWrapper>,
    store: ConversationStore,
    options: OrchestratorOptions,
    /// Bumped by every successful LLM health re-check; conversations degraded in an older
    /// epoch may use the LLM again.
    recovery_epoch: AtomicU64,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        protocol: Arc<ProtocolClient>,
        llm: Arc<dyn ClientWrapper>,
    ) -> Self {
        let options = OrchestratorOptions::default();
        Self {
            registry,
            protocol,
            llm,
            store: ConversationStore::new(options.max_turns),
            options,
            recovery_epoch: AtomicU64::new(0),
            event_handler: None,
        }
    }

    /// Replace the options. Resets the conversation store, so call before serving queries.
    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.store = ConversationStore::new(options.max_turns);
        self.options = options;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn protocol(&self) -> &Arc<ProtocolClient> {
        &self.protocol
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.store
    }

    /// Registered tools, in catalog order.
    pub fn tools(&self) -> &[ToolSpec] {
        self.registry.list()
    }

    /// Forget the conversation of `session_id`. Returns whether one existed.
    pub fn clear(&self, session_id: &str) -> bool {
        let cleared = self.store.clear(session_id);
        log::info!("session {}: conversation cleared ({})", session_id, cleared);
        cleared
    }

    pub fn active_conversations(&self) -> usize {
        self.store.active_count()
    }

    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.store.evict_idle(max_idle)
    }

    async fn notify(&self, event: RouterEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_router_event(&event).await;
        }
    }

    async fn enter(&self, session_id: &str, phase: QueryPhase) {
        log::debug!("session {}: {:?}", session_id, phase);
        self.notify(RouterEvent::PhaseChanged {
            session_id: session_id.to_string(),
            phase,
        })
        .await;
    }

    /// Answer `query` in a background task and return its event stream.
    ///
    /// The conversation for `session_id` is created on first use and locked for the whole
    /// query, so queries of one session never interleave.  Dropping the returned stream
    /// cancels the query.
    pub fn stream_query(self: &Arc<Self>, session_id: &str, query: &str) -> EventStream {
        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let conversation = self.store.get_or_create(session_id);
        let this = Arc::clone(self);
        let session_id = session_id.to_string();
        let query = query.to_string();

        tokio::spawn(async move {
            let mut conversation = conversation.lock_owned().await;
            let mut sink = EventSink::new(tx, session_id.clone());

            // Nobody is listening any more; leave the conversation untouched.
            if sink.is_cancelled() {
                log::info!(
                    "session {}: caller left before the query started, skipping it",
                    session_id
                );
                this.notify(RouterEvent::QueryFinished {
                    session_id,
                    events: 0,
                    cancelled: true,
                })
                .await;
                return;
            }

            let outcome = AssertUnwindSafe(this.run_query(&mut conversation, &query, &mut sink))
                .catch_unwind()
                .await;

            if let Err(panic) = outcome {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!(
                    "secureguard::orchestrator::stream_query({}): query task panicked: {}",
                    session_id,
                    reason
                );
                if !sink.is_done() {
                    let err = SecureGuardError::Internal(reason);
                    let _ = sink.emit(StreamEvent::from(&err)).await;
                    let _ = sink.emit(StreamEvent::Done).await;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Answer one query against an explicitly supplied conversation.
    ///
    /// Emits into `sink` and always finishes with `Done` unless the consumer went away.
    pub async fn run_query(&self, conversation: &mut Conversation, query: &str, sink: &mut EventSink) {
        let session_id = conversation.id().to_string();
        let direct = is_direct_call(query);
        self.notify(RouterEvent::QueryStarted {
            session_id: session_id.clone(),
            query_preview: query.chars().take(120).collect(),
            direct,
        })
        .await;

        self.enter(&session_id, QueryPhase::ParsingQuery).await;
        conversation.push(Turn::user(query));

        let outcome = if direct {
            self.enter(&session_id, QueryPhase::DirectDispatch).await;
            self.direct_dispatch(conversation, query, sink).await
        } else {
            self.enter(&session_id, QueryPhase::LlmTurn).await;
            self.llm_turn(conversation, query, sink).await
        };

        self.enter(&session_id, QueryPhase::Finalizing).await;
        let outcome = match outcome {
            Ok(()) => sink.emit(StreamEvent::Done).await,
            Err(cancelled) => Err(cancelled),
        };
        if outcome.is_err() {
            log::info!(
                "session {}: query cancelled after {} event(s)",
                session_id,
                sink.sent()
            );
        }

        self.enter(&session_id, QueryPhase::Idle).await;
        self.notify(RouterEvent::QueryFinished {
            session_id,
            events: sink.sent(),
            cancelled: outcome.is_err(),
        })
        .await;
    }

    async fn direct_dispatch(
        &self,
        conversation: &mut Conversation,
        query: &str,
        sink: &mut EventSink,
    ) -> Result<(), Cancelled> {
        let call = match parse_direct_call(query) {
            Ok(call) => call,
            Err(err) => return self.reject_direct(conversation, &err, sink).await,
        };
        let arguments = Value::Object(call.arguments.clone());
        if let Err(err) = self.registry.validate(&call.name, &arguments) {
            return self.reject_direct(conversation, &err, sink).await;
        }

        let invocation = match self.execute(conversation.id(), &call.name, call.arguments, sink).await? {
            Some(invocation) => invocation,
            None => return Err(Cancelled),
        };
        conversation.push(
            Turn::tool(invocation.result.render()).with_invocations(vec![invocation.clone()]),
        );
        sink.emit(StreamEvent::ToolCallFinished { invocation }).await
    }

    /// Record a failed direct call on the conversation and report it to the caller.
    async fn reject_direct(
        &self,
        conversation: &mut Conversation,
        err: &SecureGuardError,
        sink: &mut EventSink,
    ) -> Result<(), Cancelled> {
        log::info!("session {}: direct call rejected: {}", conversation.id(), err);
        conversation.push(Turn::tool(err.to_string()));
        sink.emit(StreamEvent::from(err)).await
    }

    /// Emit `ToolCallStarted`, run the call and build its invocation record.
    ///
    /// Returns `Ok(None)` when the consumer left while the call was in flight; the result is
    /// then dropped. `ToolCallFinished` is left to the caller.
    async fn execute(
        &self,
        session_id: &str,
        name: &str,
        arguments: ToolArguments,
        sink: &mut EventSink,
    ) -> Result<Option<ToolInvocation>, Cancelled> {
        sink.emit(StreamEvent::ToolCallStarted {
            name: name.to_string(),
            arguments: arguments.clone(),
        })
        .await?;

        let started_at = Utc::now();
        let result = self.protocol.call_tool(name, &arguments).await;
        let invocation = ToolInvocation {
            tool_name: name.to_string(),
            arguments,
            result,
            started_at,
            finished_at: Utc::now(),
        };
        log::info!(
            "session {}: tool '{}' {} in {} ms",
            session_id,
            name,
            if invocation.result.is_success() {
                "succeeded"
            } else {
                "failed"
            },
            invocation.duration_ms()
        );

        if sink.is_cancelled() {
            log::warn!(
                "session {}: discarding result of '{}', the caller is gone",
                session_id,
                name
            );
            self.notify(RouterEvent::ResultDiscarded {
                session_id: session_id.to_string(),
                tool_name: name.to_string(),
            })
            .await;
            return Ok(None);
        }
        Ok(Some(invocation))
    }

    async fn llm_turn(
        &self,
        conversation: &mut Conversation,
        query: &str,
        sink: &mut EventSink,
    ) -> Result<(), Cancelled> {
        let epoch = self.recovery_epoch.load(Ordering::SeqCst);
        if !self.llm.is_configured() || conversation.is_llm_degraded(epoch) {
            let message = unavailable_message(query, &self.registry);
            log::info!(
                "session {}: LLM unavailable, suggesting direct calls",
                conversation.id()
            );
            conversation.push(Turn::assistant(message.clone()));
            return sink
                .emit(StreamEvent::error(ErrorKind::LlmUnavailable, message))
                .await;
        }

        let mut state = LlmTurnState::default();
        let outcome = self
            .drive_completions(conversation, query, epoch, &mut state, sink)
            .await;

        // The turn is recorded even when the caller left, so the history matches what was seen.
        let content = if state.text.is_empty() {
            state.error.take().unwrap_or_default()
        } else {
            std::mem::take(&mut state.text)
        };
        conversation.push(Turn::assistant(content).with_invocations(state.invocations));
        outcome
    }

    async fn drive_completions(
        &self,
        conversation: &mut Conversation,
        query: &str,
        epoch: u64,
        state: &mut LlmTurnState,
        sink: &mut EventSink,
    ) -> Result<(), Cancelled> {
        let session_id = conversation.id().to_string();
        let mut messages = vec![Message::system(system_prompt(&self.registry))];
        messages.extend(conversation.to_messages());

        loop {
            let stream = match self
                .llm
                .stream_completion(&messages, self.registry.list(), self.options.completion_budget)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    let message = if err.kind() == ErrorKind::LlmUnavailable {
                        conversation.mark_llm_degraded(epoch);
                        log::warn!("session {}: {}", session_id, err);
                        self.notify(RouterEvent::LlmDegraded {
                            session_id: session_id.clone(),
                            reason: err.to_string(),
                        })
                        .await;
                        unavailable_message(query, &self.registry)
                    } else {
                        log::error!("session {}: completion request failed: {}", session_id, err);
                        err.to_string()
                    };
                    state.error = Some(message.clone());
                    return sink.emit(StreamEvent::error(err.kind(), message)).await;
                }
            };

            let (round_text, requests, finish) = self.consume_completion(stream, state, sink).await?;

            if let FinishReason::Error(reason) = finish {
                log::error!("session {}: completion broke off: {}", session_id, reason);
                let err = SecureGuardError::LlmStream(reason);
                state.error = Some(err.to_string());
                return sink.emit(StreamEvent::from(&err)).await;
            }
            if requests.is_empty() {
                if finish == FinishReason::Length {
                    log::info!("session {}: completion hit the token budget", session_id);
                }
                return Ok(());
            }
            if state.rounds >= self.options.max_tool_rounds {
                let err = SecureGuardError::ToolLoopLimit(state.rounds);
                log::warn!("session {}: {}", session_id, err);
                state.error = Some(err.to_string());
                return sink.emit(StreamEvent::from(&err)).await;
            }

            state.rounds += 1;
            self.enter(&session_id, QueryPhase::ToolExecuting).await;
            messages.push(tool_call_message(&round_text, &requests));
            for request in &requests {
                let reply = self.execute_requested(&session_id, request, state, sink).await?;
                messages.push(Message::tool_result(request.id.clone(), reply));
            }
            self.notify(RouterEvent::ToolRoundCompleted {
                session_id: session_id.clone(),
                round: state.rounds,
                calls: requests.len(),
            })
            .await;
            self.enter(&session_id, QueryPhase::LlmTurn).await;
        }
    }

    /// Pull one completion to its end, forwarding tokens as they arrive.
    async fn consume_completion(
        &self,
        mut stream: CompletionStream,
        state: &mut LlmTurnState,
        sink: &mut EventSink,
    ) -> Result<(String, Vec<ToolCallRequest>, FinishReason), Cancelled> {
        let mut round_text = String::new();
        let mut requests = Vec::new();

        while let Some(event) = stream.next().await {
            match event {
                CompletionEvent::TokenChunk(text) => {
                    round_text.push_str(&text);
                    state.text.push_str(&text);
                    sink.emit(StreamEvent::Token { text }).await?;
                }
                CompletionEvent::ToolCallRequest(request) => requests.push(request),
                CompletionEvent::Finish(reason) => return Ok((round_text, requests, reason)),
            }
        }

        Ok((
            round_text,
            requests,
            FinishReason::Error("completion ended without a finish reason".to_string()),
        ))
    }

    /// Handle one tool call proposed by the LLM; returns the tool message content for it.
    async fn execute_requested(
        &self,
        session_id: &str,
        request: &ToolCallRequest,
        state: &mut LlmTurnState,
        sink: &mut EventSink,
    ) -> Result<String, Cancelled> {
        if sink.is_cancelled() {
            return Err(Cancelled);
        }

        let arguments = match self.registry.validate(&request.name, &request.arguments) {
            Ok(_) => match &request.arguments {
                Value::Object(map) => map.clone(),
                _ => ToolArguments::new(),
            },
            Err(err) => {
                log::info!(
                    "session {}: rejected tool call '{}': {}",
                    session_id,
                    request.name,
                    err
                );
                sink.emit(StreamEvent::from(&err)).await?;
                return Ok(InvocationResult::from(err).to_tool_message());
            }
        };

        let invocation = match self.execute(session_id, &request.name, arguments, sink).await? {
            Some(invocation) => invocation,
            None => return Err(Cancelled),
        };
        let reply = invocation.result.to_tool_message();
        state.invocations.push(invocation.clone());
        sink.emit(StreamEvent::ToolCallFinished { invocation }).await?;
        Ok(reply)
    }

    /// Probe the LLM. A success starts a new recovery epoch, clearing every degraded
    /// conversation.
    pub async fn recheck_llm(&self) -> bool {
        if !self.llm.is_configured() {
            return false;
        }
        if self.llm.health_check().await {
            self.recovery_epoch.fetch_add(1, Ordering::SeqCst);
            self.notify(RouterEvent::LlmRecovered).await;
            true
        } else {
            false
        }
    }

    async fn check_backends(&self) -> (HealthStatus, bool) {
        tokio::join!(self.protocol.health(), self.recheck_llm())
    }

    /// Reachability of both backends.
    pub async fn health(&self) -> HealthReport {
        let (mcp, llm_available) = self.check_backends().await;
        HealthReport {
            status: if mcp.reachable && llm_available {
                "healthy"
            } else {
                "degraded"
            },
            mcp_reachable: mcp.reachable,
            llm_available,
            latency_ms: mcp.latency_ms,
            components: HealthComponents {
                mcp_server: if mcp.reachable {
                    "connected"
                } else {
                    "disconnected"
                },
                llm: if llm_available {
                    "available"
                } else {
                    "unavailable"
                },
            },
        }
    }

    pub async fn detailed_status(&self) -> DetailedStatus {
        let (mcp, llm_available) = self.check_backends().await;
        let available_tools = if mcp.reachable {
            self.registry.names()
        } else {
            Vec::new()
        };
        DetailedStatus {
            mcp: McpStatus {
                url: self.protocol.endpoint().to_string(),
                connected: mcp.reachable,
                latency_ms: mcp.latency_ms,
                tools_count: available_tools.len(),
                available_tools,
            },
            llm: LlmStatus {
                available: llm_available,
                configured: self.llm.is_configured(),
                model: self.llm.model_name().to_string(),
            },
            sessions: SessionStatus {
                active: self.store.active_count(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_refuses_after_done() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = EventSink::new(tx, "s");
        assert!(sink.emit(StreamEvent::token("a")).await.is_ok());
        assert!(sink.emit(StreamEvent::Done).await.is_ok());
        assert_eq!(sink.emit(StreamEvent::token("late")).await, Err(Cancelled));
        assert_eq!(sink.sent(), 2);

        assert_eq!(rx.recv().await, Some(StreamEvent::token("a")));
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_sink_detects_dropped_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let mut sink = EventSink::new(tx, "s");
        drop(rx);
        assert!(sink.is_cancelled());
        assert_eq!(sink.emit(StreamEvent::Done).await, Err(Cancelled));
        assert!(!sink.is_done());
    }
}
