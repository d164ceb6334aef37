//! Orchestrator behaviour end to end, with a scripted LLM and an in-memory tool server.
//!
//! `ScriptedClient` replays canned completions in order (or repeats one forever) and
//! records every prompt it receives.  `StubTransport` answers tool calls from a table and
//! counts how often it was contacted.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use secureguard::catalog::default_registry;
use secureguard::client_wrapper::{
    ClientWrapper, CompletionEvent, CompletionStream, FinishReason, Message, Role, ToolCallRequest,
};
use secureguard::conversation::{Conversation, InvocationResult, TurnRole};
use secureguard::error::{ErrorKind, SecureGuardError};
use secureguard::event::{EventHandler, RouterEvent, StreamEvent};
use secureguard::orchestrator::{EventSink, Orchestrator, OrchestratorOptions};
use secureguard::protocol_client::{ProtocolClient, ProtocolClientConfig, TimeoutPolicy};
use secureguard::tool_registry::{ToolArguments, ToolSpec};
use secureguard::tool_transport::{ToolTransport, TransportError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

enum Reply {
    Events(Vec<CompletionEvent>),
    Unavailable,
    Panic,
}

struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    /// Replayed once `replies` runs dry.
    repeat: Option<Vec<CompletionEvent>>,
    configured: bool,
    healthy: AtomicBool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            configured: true,
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn repeating(events: Vec<CompletionEvent>) -> Self {
        let mut client = Self::new(Vec::new());
        client.repeat = Some(events);
        client
    }

    fn unconfigured() -> Self {
        let mut client = Self::new(Vec::new());
        client.configured = false;
        client
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn prompt(&self, index: usize) -> Vec<Message> {
        self.prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
        _max_tokens: usize,
    ) -> Result<CompletionStream, SecureGuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(messages.to_vec());

        let next = self.replies.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => reply,
            None => Reply::Events(self.repeat.clone().unwrap_or_else(|| {
                vec![CompletionEvent::Finish(FinishReason::Stop)]
            })),
        };
        match reply {
            Reply::Events(events) => Ok(Box::pin(futures_util::stream::iter(events))),
            Reply::Unavailable => Err(SecureGuardError::LlmUnavailable(
                "connection refused".to_string(),
            )),
            Reply::Panic => panic!("scripted client exploded"),
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct StubTransport {
    answers: HashMap<String, Result<Value, TransportError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubTransport {
    fn new() -> Self {
        Self {
            answers: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn answer(mut self, tool: &str, result: Result<Value, TransportError>) -> Self {
        self.answers.insert(tool.to_string(), result);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolTransport for StubTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        Ok(default_registry().list().to_vec())
    }

    async fn execute(
        &self,
        tool_name: &str,
        _arguments: &ToolArguments,
    ) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answers
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| Ok(json!({ "tool": tool_name, "ok": true })))
    }

    fn endpoint(&self) -> &str {
        "stub://tools"
    }
}

/// Collects router events so tests can wait for specific ones.
struct Recorder {
    tx: mpsc::UnboundedSender<RouterEvent>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_router_event(&self, event: &RouterEvent) {
        let _ = self.tx.send(event.clone());
    }
}

fn build(
    llm: Arc<ScriptedClient>,
    transport: Arc<StubTransport>,
    options: OrchestratorOptions,
) -> Arc<Orchestrator> {
    let registry = Arc::new(default_registry());
    let protocol = Arc::new(
        ProtocolClient::new(transport, registry.clone()).with_config(ProtocolClientConfig {
            call_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(10),
            timeout_policy: TimeoutPolicy::Surface,
        }),
    );
    Arc::new(Orchestrator::new(registry, protocol, llm).with_options(options))
}

fn default_build(llm: Arc<ScriptedClient>, transport: Arc<StubTransport>) -> Arc<Orchestrator> {
    build(llm, transport, OrchestratorOptions::default())
}

async fn ask(orchestrator: &Arc<Orchestrator>, session: &str, query: &str) -> Vec<StreamEvent> {
    tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.stream_query(session, query).collect::<Vec<_>>(),
    )
    .await
    .expect("query did not finish")
}

/// Event labels, with the error kind appended to error events.
fn shape(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            StreamEvent::Error { kind, .. } => format!("error:{}", kind),
            other => other.label().to_string(),
        })
        .collect()
}

fn tool_call(id: &str, name: &str, arguments: Value) -> CompletionEvent {
    CompletionEvent::ToolCallRequest(ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

fn token(text: &str) -> CompletionEvent {
    CompletionEvent::TokenChunk(text.to_string())
}

#[tokio::test]
async fn test_direct_call_success_sequence() {
    secureguard::init_logger();
    let llm = Arc::new(ScriptedClient::new(Vec::new()));
    let transport = Arc::new(
        StubTransport::new().answer("get_security_summary", Ok(json!({"openCases": 3}))),
    );
    let orchestrator = default_build(llm.clone(), transport.clone());

    let events = ask(&orchestrator, "s1", "tool: get_security_summary").await;

    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        StreamEvent::ToolCallStarted {
            name: "get_security_summary".into(),
            arguments: ToolArguments::new(),
        }
    );
    match &events[1] {
        StreamEvent::ToolCallFinished { invocation } => {
            assert_eq!(invocation.tool_name, "get_security_summary");
            assert_eq!(
                invocation.result,
                InvocationResult::Success {
                    value: json!({"openCases": 3})
                }
            );
            assert!(invocation.finished_at >= invocation.started_at);
        }
        other => panic!("expected tool_call_finished, got {:?}", other),
    }
    assert_eq!(events[2], StreamEvent::Done);
    assert_eq!(transport.calls(), 1);
    assert_eq!(llm.calls(), 0);

    let conversation = orchestrator.conversations().get("s1").unwrap();
    let conversation = conversation.lock().await;
    let roles: Vec<_> = conversation.turns().iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![TurnRole::User, TurnRole::Tool]);
    assert_eq!(conversation.turns()[1].invocations.len(), 1);
}

#[tokio::test]
async fn test_unknown_tool_never_contacts_server() {
    let transport = Arc::new(StubTransport::new());
    let orchestrator = default_build(Arc::new(ScriptedClient::new(Vec::new())), transport.clone());

    let events = ask(&orchestrator, "s", "tool: drop_all_tables").await;

    assert_eq!(shape(&events), vec!["error:UnknownToolError", "done"]);
    assert_eq!(transport.calls(), 0);

    // The failure is still recorded on the conversation.
    let conversation = orchestrator.conversations().get("s").unwrap();
    assert_eq!(conversation.lock().await.len(), 2);
}

#[tokio::test]
async fn test_invalid_direct_calls() {
    let transport = Arc::new(StubTransport::new());
    let orchestrator = default_build(Arc::new(ScriptedClient::new(Vec::new())), transport.clone());

    let missing = ask(&orchestrator, "s", "tool: get_case_details").await;
    assert_eq!(shape(&missing), vec!["error:ValidationError", "done"]);

    let unknown_param = ask(&orchestrator, "s", "tool: list_cases severity=high").await;
    assert_eq!(shape(&unknown_param), vec!["error:ValidationError", "done"]);

    let malformed = ask(&orchestrator, "s", "tool: list_cases active").await;
    assert_eq!(shape(&malformed), vec!["error:ProtocolParseError", "done"]);

    let empty = ask(&orchestrator, "s", "tool:").await;
    assert_eq!(shape(&empty), vec!["error:ProtocolParseError", "done"]);

    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_direct_call_remote_failure_is_a_finished_invocation() {
    let transport = Arc::new(StubTransport::new().answer(
        "get_case_details",
        Err(TransportError::Remote("case CASE404 not found".into())),
    ));
    let orchestrator = default_build(Arc::new(ScriptedClient::new(Vec::new())), transport);

    let events = ask(&orchestrator, "s", "tool: get_case_details case_id=CASE404").await;

    assert_eq!(shape(&events), vec!["tool_call_started", "tool_call_finished", "done"]);
    match &events[1] {
        StreamEvent::ToolCallFinished { invocation } => match &invocation.result {
            InvocationResult::Failure { kind, message } => {
                assert_eq!(*kind, ErrorKind::Remote);
                assert!(message.contains("CASE404"));
            }
            other => panic!("expected failure, got {:?}", other),
        },
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_identical_direct_calls_are_repeatable() {
    let transport = Arc::new(
        StubTransport::new().answer("list_cases", Ok(json!({"cases": ["CASE001", "CASE002"]}))),
    );
    let orchestrator = default_build(Arc::new(ScriptedClient::new(Vec::new())), transport);

    let normalize = |events: Vec<StreamEvent>| -> Vec<StreamEvent> {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        events
            .into_iter()
            .map(|event| match event {
                StreamEvent::ToolCallFinished { mut invocation } => {
                    invocation.started_at = epoch;
                    invocation.finished_at = epoch;
                    StreamEvent::ToolCallFinished { invocation }
                }
                other => other,
            })
            .collect()
    };

    let first = normalize(ask(&orchestrator, "a", "tool: list_cases status=active").await);
    let second = normalize(ask(&orchestrator, "a", "tool: list_cases status=active").await);
    assert_eq!(first, second);
    assert_eq!(
        first[0],
        StreamEvent::ToolCallStarted {
            name: "list_cases".into(),
            arguments: [("status".to_string(), json!("active"))].into_iter().collect(),
        }
    );
}

#[tokio::test]
async fn test_conversation_never_exceeds_max_turns() {
    let orchestrator = build(
        Arc::new(ScriptedClient::new(Vec::new())),
        Arc::new(StubTransport::new()),
        OrchestratorOptions {
            max_turns: 3,
            ..OrchestratorOptions::default()
        },
    );

    for i in 0..5 {
        let query = format!("tool: get_case_details case_id=CASE00{}", i);
        ask(&orchestrator, "bounded", &query).await;

        let conversation = orchestrator.conversations().get("bounded").unwrap();
        let conversation = conversation.lock().await;
        assert!(conversation.len() <= 3);
        let last_user = conversation
            .turns()
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .unwrap();
        assert_eq!(last_user.content, query);
    }
}

#[tokio::test]
async fn test_tool_loop_stops_after_max_rounds() {
    let llm = Arc::new(ScriptedClient::repeating(vec![
        tool_call("call_1", "health", json!({})),
        CompletionEvent::Finish(FinishReason::ToolCalls),
    ]));
    let transport = Arc::new(StubTransport::new());
    let orchestrator = default_build(llm.clone(), transport.clone());

    let events = ask(&orchestrator, "loop", "keep checking health forever").await;

    assert_eq!(transport.calls(), 5);
    assert_eq!(llm.calls(), 6);
    let shape = shape(&events);
    assert_eq!(
        shape[shape.len() - 2..],
        ["error:ToolLoopLimitError".to_string(), "done".to_string()]
    );
    assert_eq!(
        shape.iter().filter(|s| *s == "tool_call_finished").count(),
        5
    );
}

#[tokio::test]
async fn test_custom_round_limit() {
    let llm = Arc::new(ScriptedClient::repeating(vec![
        tool_call("call_1", "list_signals", json!({"org_name": "OrgA"})),
        CompletionEvent::Finish(FinishReason::ToolCalls),
    ]));
    let transport = Arc::new(StubTransport::new());
    let orchestrator = build(
        llm,
        transport.clone(),
        OrchestratorOptions {
            max_tool_rounds: 2,
            ..OrchestratorOptions::default()
        },
    );

    ask(&orchestrator, "s", "signals please").await;
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_llm_unavailable_degrades_until_recheck() {
    let llm = Arc::new(ScriptedClient::new(vec![
        Reply::Unavailable,
        Reply::Events(vec![token("back"), CompletionEvent::Finish(FinishReason::Stop)]),
    ]));
    let transport = Arc::new(StubTransport::new());
    let orchestrator = default_build(llm.clone(), transport.clone());

    let first = ask(&orchestrator, "d", "give me a security overview").await;
    assert_eq!(shape(&first), vec!["error:LLMUnavailableError", "done"]);
    match &first[0] {
        StreamEvent::Error { message, .. } => {
            assert!(message.starts_with("LLM unavailable; try tool: get_security_summary"))
        }
        other => panic!("unexpected {:?}", other),
    }

    // Degraded: the LLM is not even asked.
    let second = ask(&orchestrator, "d", "and now?").await;
    assert_eq!(shape(&second), vec!["error:LLMUnavailableError", "done"]);
    assert_eq!(llm.calls(), 1);

    // Direct calls keep working meanwhile.
    let direct = ask(&orchestrator, "d", "tool: health").await;
    assert_eq!(shape(&direct), vec!["tool_call_started", "tool_call_finished", "done"]);

    assert!(orchestrator.recheck_llm().await);
    let third = ask(&orchestrator, "d", "and now?").await;
    assert_eq!(shape(&third), vec!["token", "done"]);
    assert_eq!(llm.calls(), 2);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_failed_recheck_keeps_degradation() {
    let llm = Arc::new(ScriptedClient::new(vec![Reply::Unavailable]));
    llm.healthy.store(false, Ordering::SeqCst);
    let orchestrator = default_build(llm.clone(), Arc::new(StubTransport::new()));

    ask(&orchestrator, "d", "hello").await;
    assert!(!orchestrator.recheck_llm().await);
    let again = ask(&orchestrator, "d", "hello again").await;
    assert_eq!(shape(&again), vec!["error:LLMUnavailableError", "done"]);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_unconfigured_llm_leaves_protocol_untouched() {
    let llm = Arc::new(ScriptedClient::unconfigured());
    let transport = Arc::new(StubTransport::new());
    let orchestrator = default_build(llm.clone(), transport.clone());

    let events = ask(&orchestrator, "u", "show me active incidents").await;

    assert_eq!(shape(&events), vec!["error:LLMUnavailableError", "done"]);
    match &events[0] {
        StreamEvent::Error { message, .. } => {
            assert!(message.contains("tool: list_cases status=active"))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(llm.calls(), 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_two_token_answer() {
    let llm = Arc::new(ScriptedClient::new(vec![Reply::Events(vec![
        token("All systems"),
        token(" nominal."),
        CompletionEvent::Finish(FinishReason::Stop),
    ])]));
    let orchestrator = default_build(llm.clone(), Arc::new(StubTransport::new()));

    let events = ask(&orchestrator, "t", "What's our status?").await;

    assert_eq!(
        events,
        vec![
            StreamEvent::token("All systems"),
            StreamEvent::token(" nominal."),
            StreamEvent::Done,
        ]
    );

    let conversation = orchestrator.conversations().get("t").unwrap();
    let conversation = conversation.lock().await;
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.turns()[0].role, TurnRole::User);
    assert_eq!(conversation.turns()[1].role, TurnRole::Assistant);
    assert_eq!(conversation.turns()[1].content, "All systems nominal.");

    let prompt = llm.prompt(0);
    assert_eq!(prompt[0].role, Role::System);
    assert!(prompt[0].content.contains("get_security_summary"));
    assert_eq!(prompt.last().unwrap().content, "What's our status?");
}

#[tokio::test]
async fn test_tool_results_precede_follow_up_tokens() {
    let llm = Arc::new(ScriptedClient::new(vec![
        Reply::Events(vec![
            token("Let me check. "),
            tool_call("call_9", "get_security_summary", Value::Null),
            CompletionEvent::Finish(FinishReason::ToolCalls),
        ]),
        Reply::Events(vec![
            token("You have "),
            token("3 open cases."),
            CompletionEvent::Finish(FinishReason::Stop),
        ]),
    ]));
    let transport = Arc::new(
        StubTransport::new().answer("get_security_summary", Ok(json!({"openCases": 3}))),
    );
    let orchestrator = default_build(llm.clone(), transport);

    let events = ask(&orchestrator, "o", "How many cases are open?").await;

    assert_eq!(
        shape(&events),
        vec!["token", "tool_call_started", "tool_call_finished", "token", "token", "done"]
    );

    let follow_up = llm.prompt(1);
    let assistant = &follow_up[follow_up.len() - 2];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.tool_calls[0].id, "call_9");
    let tool_message = follow_up.last().unwrap();
    assert_eq!(tool_message.role, Role::Tool);
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_9"));
    assert_eq!(tool_message.content, "{\"openCases\":3}");

    let conversation = orchestrator.conversations().get("o").unwrap();
    let conversation = conversation.lock().await;
    let answer = conversation.last().unwrap();
    assert_eq!(answer.role, TurnRole::Assistant);
    assert_eq!(answer.content, "Let me check. You have 3 open cases.");
    assert_eq!(answer.invocations.len(), 1);
}

#[tokio::test]
async fn test_invalid_llm_tool_call_is_reported_and_fed_back() {
    let llm = Arc::new(ScriptedClient::new(vec![
        Reply::Events(vec![
            tool_call("call_x", "delete_everything", json!({})),
            CompletionEvent::Finish(FinishReason::ToolCalls),
        ]),
        Reply::Events(vec![
            token("That tool does not exist."),
            CompletionEvent::Finish(FinishReason::Stop),
        ]),
    ]));
    let transport = Arc::new(StubTransport::new());
    let orchestrator = default_build(llm.clone(), transport.clone());

    let events = ask(&orchestrator, "i", "wipe it").await;

    assert_eq!(shape(&events), vec!["error:UnknownToolError", "token", "done"]);
    assert_eq!(transport.calls(), 0);
    let fed_back = llm.prompt(1).last().unwrap().clone();
    assert_eq!(fed_back.role, Role::Tool);
    assert!(fed_back.content.contains("UnknownToolError"));
}

#[tokio::test]
async fn test_transport_failures_are_fed_to_the_llm() {
    let llm = Arc::new(ScriptedClient::new(vec![
        Reply::Events(vec![
            tool_call("call_1", "list_cases", json!({"status": "active"})),
            CompletionEvent::Finish(FinishReason::ToolCalls),
        ]),
        Reply::Events(vec![
            token("The case service is down."),
            CompletionEvent::Finish(FinishReason::Stop),
        ]),
    ]));
    let transport = Arc::new(
        StubTransport::new().answer("list_cases", Err(TransportError::Remote("db offline".into()))),
    );
    let orchestrator = default_build(llm.clone(), transport);

    let events = ask(&orchestrator, "f", "active cases?").await;

    assert_eq!(
        shape(&events),
        vec!["tool_call_started", "tool_call_finished", "token", "done"]
    );
    assert!(llm.prompt(1).last().unwrap().content.contains("RemoteError"));
}

#[tokio::test]
async fn test_broken_stream_emits_stream_error() {
    let llm = Arc::new(ScriptedClient::new(vec![Reply::Events(vec![
        token("Partial"),
        CompletionEvent::Finish(FinishReason::Error("idle timeout after 30s".into())),
    ])]));
    let orchestrator = default_build(llm, Arc::new(StubTransport::new()));

    let events = ask(&orchestrator, "b", "summarize").await;

    assert_eq!(shape(&events), vec!["token", "error:LLMStreamError", "done"]);
    let conversation = orchestrator.conversations().get("b").unwrap();
    assert_eq!(conversation.lock().await.last().unwrap().content, "Partial");
}

#[tokio::test]
async fn test_panic_becomes_internal_error() {
    let llm = Arc::new(ScriptedClient::new(vec![Reply::Panic]));
    let orchestrator = default_build(llm, Arc::new(StubTransport::new()));

    let events = ask(&orchestrator, "p", "hello").await;

    assert_eq!(shape(&events), vec!["error:InternalError", "done"]);

    // The session is still usable afterwards.
    let next = ask(&orchestrator, "p", "tool: health").await;
    assert_eq!(shape(&next).last().map(String::as_str), Some("done"));
}

#[tokio::test]
async fn test_dropping_the_stream_discards_in_flight_result() {
    let (tx, mut router_events) = mpsc::unbounded_channel();
    let llm = Arc::new(ScriptedClient::new(vec![Reply::Events(vec![
        tool_call("call_1", "get_security_summary", json!({})),
        CompletionEvent::Finish(FinishReason::ToolCalls),
    ])]));
    let transport = Arc::new(StubTransport::new().with_delay(Duration::from_millis(200)));
    let registry = Arc::new(default_registry());
    let protocol = Arc::new(ProtocolClient::new(transport.clone(), registry.clone()));
    let orchestrator = Arc::new(
        Orchestrator::new(registry, protocol, llm.clone())
            .with_event_handler(Arc::new(Recorder { tx })),
    );

    let mut stream = orchestrator.stream_query("c", "summary please");
    let first = stream.next().await.unwrap();
    assert_eq!(first.label(), "tool_call_started");
    drop(stream);

    let mut discarded = false;
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = router_events.recv().await {
            match event {
                RouterEvent::ResultDiscarded { tool_name, .. } => {
                    assert_eq!(tool_name, "get_security_summary");
                    discarded = true;
                }
                RouterEvent::QueryFinished { cancelled, .. } => return cancelled,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap();

    assert!(finished);
    assert!(discarded);
    assert_eq!(transport.calls(), 1);
    // No follow-up completion after cancellation.
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_query_abandoned_while_waiting_for_the_session_leaves_no_trace() {
    let (tx, mut router_events) = mpsc::unbounded_channel();
    let llm = Arc::new(ScriptedClient::new(Vec::new()));
    let transport = Arc::new(StubTransport::new());
    let registry = Arc::new(default_registry());
    let protocol = Arc::new(ProtocolClient::new(transport.clone(), registry.clone()));
    let orchestrator = Arc::new(
        Orchestrator::new(registry, protocol, llm.clone())
            .with_event_handler(Arc::new(Recorder { tx })),
    );

    // Another query holds the session while this one is queued.
    let conversation = orchestrator.conversations().get_or_create("late");
    let guard = conversation.lock().await;
    let stream = orchestrator.stream_query("late", "tool: health");
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(stream);
    drop(guard);

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = router_events.recv().await {
            if let RouterEvent::QueryFinished {
                session_id,
                events,
                cancelled,
            } = event
            {
                return (session_id, events, cancelled);
            }
        }
        panic!("router events closed before the query finished");
    })
    .await
    .unwrap();

    assert_eq!(finished, ("late".to_string(), 0, true));
    assert_eq!(conversation.lock().await.len(), 0);
    assert_eq!(transport.calls(), 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_queries_in_one_session_do_not_interleave() {
    let llm = Arc::new(ScriptedClient::repeating(vec![
        token("a"),
        token("b"),
        token("c"),
        CompletionEvent::Finish(FinishReason::Stop),
    ]));
    let transport = Arc::new(StubTransport::new().with_delay(Duration::from_millis(50)));
    let orchestrator = default_build(llm, transport);

    let first = orchestrator.stream_query("same", "tool: health");
    let second = orchestrator.stream_query("same", "tell me something");
    let (first, second) = tokio::join!(
        first.collect::<Vec<_>>(),
        second.collect::<Vec<_>>()
    );

    assert_eq!(shape(&first), vec!["tool_call_started", "tool_call_finished", "done"]);
    assert_eq!(shape(&second), vec!["token", "token", "token", "done"]);

    let conversation = orchestrator.conversations().get("same").unwrap();
    let conversation = conversation.lock().await;
    assert_eq!(conversation.len(), 4);
    // Each query's user turn is directly followed by its own reply.
    for pair in conversation.turns().iter().collect::<Vec<_>>().chunks(2) {
        assert_eq!(pair[0].role, TurnRole::User);
        assert_ne!(pair[1].role, TurnRole::User);
    }
}

#[tokio::test]
async fn test_run_query_with_explicit_conversation() {
    let orchestrator = default_build(
        Arc::new(ScriptedClient::new(Vec::new())),
        Arc::new(StubTransport::new().answer("health", Ok(json!({"status": "healthy"})))),
    );
    let mut conversation = Conversation::new("explicit", 10);
    let (tx, mut rx) = mpsc::channel(16);
    let mut sink = EventSink::new(tx, "explicit");

    orchestrator
        .run_query(&mut conversation, "tool: health", &mut sink)
        .await;
    drop(sink);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(shape(&events), vec!["tool_call_started", "tool_call_finished", "done"]);
    assert_eq!(conversation.len(), 2);
    assert!(conversation.last().unwrap().content.contains("healthy"));
    // Explicit conversations are not registered in the store.
    assert_eq!(orchestrator.active_conversations(), 0);
}

#[tokio::test]
async fn test_clear_and_status() {
    let llm = Arc::new(ScriptedClient::new(Vec::new()));
    let orchestrator = default_build(llm, Arc::new(StubTransport::new()));

    ask(&orchestrator, "one", "tool: health").await;
    ask(&orchestrator, "two", "tool: health").await;
    assert_eq!(orchestrator.active_conversations(), 2);

    assert!(orchestrator.clear("one"));
    assert!(!orchestrator.clear("one"));

    let status = orchestrator.detailed_status().await;
    assert!(status.mcp.connected);
    assert_eq!(status.mcp.url, "stub://tools");
    assert_eq!(status.mcp.tools_count, 8);
    assert!(status.llm.available);
    assert_eq!(status.sessions.active, 1);

    let health = orchestrator.health().await;
    assert_eq!(health.status, "healthy");
    assert!(health.mcp_reachable && health.llm_available);
}
