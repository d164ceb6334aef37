//! Transport to the remote tool-serving process.
//!
//! [`ToolTransport`] is the seam between the [`ProtocolClient`](crate::protocol_client::ProtocolClient),
//! which owns validation, timeouts and retries, and the wire.  [`HttpToolTransport`] speaks
//! the JSON-over-HTTP dialect of the SecureGuard tool server:
//!
//! ```text
//! POST {endpoint}/tools/list     -> {"tools": [ToolSpec, ...]}
//! POST {endpoint}/tools/execute  {"tool": name, "parameters": {...}}
//!                                -> {"result": {"success": bool, "output": value, "error": msg?}}
//! ```
//!
//! Tests substitute their own implementation of the trait.

use crate::secureguard::http_pool::get_http_client;
use crate::secureguard::tool_registry::{ToolArguments, ToolSpec};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Failures observed at the transport level, before any retry policy is applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The remote process could not be reached at all; the request was not delivered.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The transport's own deadline elapsed.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The remote answered, but reported or caused a failure.
    #[error("{0}")]
    Remote(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else {
            TransportError::Remote(err.to_string())
        }
    }
}

/// Raw access to the tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Fetch the server's tool catalog.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError>;

    /// Execute a tool and return its structured output.
    async fn execute(&self, tool_name: &str, arguments: &ToolArguments)
        -> Result<Value, TransportError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), TransportError> {
        self.list_tools().await.map(|_| ())
    }

    /// Human readable location of the server, for status pages and logs.
    fn endpoint(&self) -> &str;
}

#[derive(Deserialize)]
struct ListToolsResponse {
    tools: Vec<ToolSpec>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    result: RemoteToolResult,
}

#[derive(Deserialize)]
struct RemoteToolResult {
    success: bool,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the SecureGuard tool server.
///
/// # Example
///
/// ```rust,no_run
/// use secureguard::tool_transport::{HttpToolTransport, ToolTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = HttpToolTransport::new("http://localhost:9002");
/// let tools = transport.list_tools().await?;
/// println!("{} tools available", tools.len());
/// # Ok(())
/// # }
/// ```
pub struct HttpToolTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpToolTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let client = get_http_client(&endpoint);
        Self { endpoint, client }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| status.to_string());
            return Err(TransportError::Remote(format!(
                "tool server returned {}: {}",
                status, detail
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        let response = self.post("/tools/list", &serde_json::json!({})).await?;
        let listed: ListToolsResponse = response.json().await?;
        Ok(listed.tools)
    }

    async fn execute(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<Value, TransportError> {
        let response = self
            .post(
                "/tools/execute",
                &serde_json::json!({
                    "tool": tool_name,
                    "parameters": arguments,
                }),
            )
            .await?;

        let executed: ExecuteResponse = response.json().await?;
        if executed.result.success {
            Ok(executed.result.output)
        } else {
            Err(TransportError::Remote(
                executed
                    .result
                    .error
                    .unwrap_or_else(|| format!("tool '{}' failed", tool_name)),
            ))
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
