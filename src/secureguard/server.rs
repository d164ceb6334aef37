//! HTTP surface for the [`Orchestrator`], available on the `server` feature.
//!
//! | Method | Path                     | Purpose                                         |
//! |--------|--------------------------|-------------------------------------------------|
//! | POST   | `/api/query`             | Answer a query as a server-sent event stream    |
//! | GET    | `/api/tools`             | Registered tool catalog                         |
//! | GET    | `/api/health`            | `healthy` / `degraded` summary                  |
//! | GET    | `/api/status`            | Detailed tool server, LLM and session status    |
//! | POST   | `/api/clear`             | Drop a session's conversation                   |
//! | GET    | `/api/mcp/summary`       | Shortcut for `get_security_summary`             |
//! | GET    | `/api/mcp/organizations` | Shortcut for `list_organizations`               |
//! | GET    | `/api/mcp/cases`         | Shortcut for `list_cases` (`?status=`)          |
//! | GET    | `/api/mcp/signals`       | Shortcut for `list_signals` (`?org=&type=`)     |
//!
//! Sessions are identified by `session_id` in the request body or an `x-session-id`
//! header.  A query without either starts a fresh session; its id is returned in the
//! `x-session-id` response header.
//!
//! Each SSE frame carries the event's `type` as its event name and the JSON encoded
//! [`StreamEvent`](crate::event::StreamEvent) as data.

use crate::secureguard::conversation::InvocationResult;
use crate::secureguard::error::ErrorKind;
use crate::secureguard::orchestrator::Orchestrator;
use crate::secureguard::tool_registry::ToolArguments;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Build the router. `orchestrator` is shared by every handler.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/query", post(handle_query))
        .route("/api/tools", get(list_tools))
        .route("/api/health", get(health))
        .route("/api/status", get(detailed_status))
        .route("/api/clear", post(clear_conversation))
        .route("/api/mcp/summary", get(mcp_summary))
        .route("/api/mcp/organizations", get(mcp_organizations))
        .route("/api/mcp/cases", get(mcp_cases))
        .route("/api/mcp/signals", get(mcp_signals))
        .with_state(orchestrator)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("secureguard listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(orchestrator)).await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": message.into(), "status": "error" })),
    )
        .into_response()
}

fn header_session(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

async fn handle_query(
    State(orchestrator): State<Arc<Orchestrator>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    let query = request.query.trim();
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Query cannot be empty");
    }

    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| header_session(&headers))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    log::info!("session {}: query received", session_id);

    let events = orchestrator.stream_query(&session_id, query).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().event(event.label()).data(data))
    });

    (
        [(SESSION_HEADER, session_id)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn list_tools(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(json!({ "status": "success", "tools": orchestrator.tools() })).into_response()
}

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(orchestrator.health().await).into_response()
}

async fn detailed_status(
    State(orchestrator): State<Arc<Orchestrator>>,
    headers: HeaderMap,
) -> Response {
    let status = orchestrator.detailed_status().await;
    let mut body = match serde_json::to_value(&status) {
        Ok(body) => body,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    body["sessions"]["current"] = json!(header_session(&headers));
    Json(body).into_response()
}

async fn clear_conversation(
    State(orchestrator): State<Arc<Orchestrator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ClearRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ClearRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
        }
    };
    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| header_session(&headers));
    let cleared = session_id
        .as_deref()
        .map(|id| orchestrator.clear(id))
        .unwrap_or(false);
    Json(json!({ "status": "success", "message": "cleared", "cleared": cleared })).into_response()
}

async fn call_shortcut(orchestrator: &Orchestrator, tool: &str, arguments: ToolArguments) -> Response {
    match orchestrator.protocol().call_tool(tool, &arguments).await {
        InvocationResult::Success { value } => Json(value).into_response(),
        InvocationResult::Failure { kind, message } => {
            let status = match kind {
                ErrorKind::Connection | ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Validation | ErrorKind::UnknownTool => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            log::warn!("shortcut {} failed: {}: {}", tool, kind, message);
            error_response(status, message)
        }
    }
}

fn arguments(pairs: &[(&str, String)]) -> ToolArguments {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
        .collect()
}

async fn mcp_summary(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    call_shortcut(&orchestrator, "get_security_summary", ToolArguments::new()).await
}

async fn mcp_organizations(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    call_shortcut(&orchestrator, "list_organizations", ToolArguments::new()).await
}

async fn mcp_cases(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let status = params.get("status").cloned().unwrap_or_else(|| "all".into());
    call_shortcut(&orchestrator, "list_cases", arguments(&[("status", status)])).await
}

async fn mcp_signals(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let org = params.get("org").cloned().unwrap_or_else(|| "all".into());
    let signal_type = params.get("type").cloned().unwrap_or_else(|| "all".into());
    call_shortcut(
        &orchestrator,
        "list_signals",
        arguments(&[("org_name", org), ("signal_type", signal_type)]),
    )
    .await
}
