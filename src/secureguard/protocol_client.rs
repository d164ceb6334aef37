//! Protocol client for the remote tool server.
//!
//! [`ProtocolClient`] sits on top of a [`ToolTransport`] and owns the policy the transport
//! does not: argument validation against the [`ToolRegistry`], per-call timeouts, and the
//! single automatic retry on connection failures.
//!
//! Failures never escape [`ProtocolClient::call_tool`] as `Err`; they come back as
//! [`InvocationResult::Failure`] so the caller can record them on a turn or feed them to
//! the LLM as tool output.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use secureguard::catalog::default_registry;
//! use secureguard::protocol_client::ProtocolClient;
//! use secureguard::tool_transport::HttpToolTransport;
//!
//! # async fn example() {
//! let client = ProtocolClient::new(
//!     Arc::new(HttpToolTransport::new("http://localhost:9002")),
//!     Arc::new(default_registry()),
//! );
//! let result = client.call_tool("get_security_summary", &Default::default()).await;
//! println!("{:?}", result);
//! # }
//! ```

use crate::secureguard::conversation::InvocationResult;
use crate::secureguard::error::{Result, SecureGuardError};
use crate::secureguard::tool_registry::{ToolArguments, ToolRegistry, ToolSpec};
use crate::secureguard::tool_transport::{ToolTransport, TransportError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when a tool call exceeds its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Report `TimeoutError` immediately.
    #[default]
    Surface,
    /// Try once more before reporting `TimeoutError`.
    RetryOnce,
}

#[derive(Debug, Clone)]
pub struct ProtocolClientConfig {
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
    /// Pause before the automatic retry.
    pub retry_backoff: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for ProtocolClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
            timeout_policy: TimeoutPolicy::Surface,
        }
    }
}

/// Result of [`ProtocolClient::health`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ProtocolClient {
    transport: Arc<dyn ToolTransport>,
    registry: Arc<ToolRegistry>,
    config: ProtocolClientConfig,
}

impl ProtocolClient {
    pub fn new(transport: Arc<dyn ToolTransport>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            transport,
            registry,
            config: ProtocolClientConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProtocolClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Fetch the remote catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        self.with_retry("tools/list", || self.transport.list_tools())
            .await
    }

    /// Validate and execute one tool call.
    ///
    /// Unknown tools and invalid arguments are rejected without contacting the remote.
    pub async fn call_tool(&self, name: &str, arguments: &ToolArguments) -> InvocationResult {
        if let Err(err) = self
            .registry
            .resolve(name)
            .and_then(|spec| spec.validate_arguments(arguments))
        {
            return err.into();
        }

        log::debug!(
            "secureguard::protocol_client::call_tool({}): dispatching {}",
            name,
            Value::Object(arguments.clone())
        );

        match self
            .with_retry(name, || self.transport.execute(name, arguments))
            .await
        {
            Ok(value) => InvocationResult::success(value),
            Err(err) => {
                log::warn!(
                    "secureguard::protocol_client::call_tool({}): {}",
                    name,
                    err
                );
                err.into()
            }
        }
    }

    /// Probe the tool server and measure round-trip latency.
    pub async fn health(&self) -> HealthStatus {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.call_timeout, self.transport.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(())) => HealthStatus {
                reachable: true,
                latency_ms,
                error: None,
            },
            Ok(Err(err)) => HealthStatus {
                reachable: false,
                latency_ms,
                error: Some(err.to_string()),
            },
            Err(_) => HealthStatus {
                reachable: false,
                latency_ms,
                error: Some(format!("no answer within {:?}", self.config.call_timeout)),
            },
        }
    }

    /// Run `attempt` under the call timeout, retrying once on connection failure and,
    /// depending on the timeout policy, once on timeout.
    async fn with_retry<T, F, Fut>(&self, label: &str, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, TransportError>>,
    {
        match self.attempt_once(&attempt).await {
            Err(TransportError::Connection(msg)) => {
                log::warn!(
                    "secureguard::protocol_client({}): connection failed ({}), retrying in {:?}",
                    label,
                    msg,
                    self.config.retry_backoff
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                self.attempt_once(&attempt).await.map_err(into_error)
            }
            Err(TransportError::Timeout(msg))
                if self.config.timeout_policy == TimeoutPolicy::RetryOnce =>
            {
                log::warn!(
                    "secureguard::protocol_client({}): timed out ({}), retrying once",
                    label,
                    msg
                );
                self.attempt_once(&attempt).await.map_err(into_error)
            }
            other => other.map_err(into_error),
        }
    }

    async fn attempt_once<T, F, Fut>(&self, attempt: &F) -> std::result::Result<T, TransportError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, attempt()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout(format!(
                "no answer within {:?}",
                self.config.call_timeout
            ))),
        }
    }
}

fn into_error(err: TransportError) -> SecureGuardError {
    match err {
        TransportError::Connection(msg) => SecureGuardError::Connection(msg),
        TransportError::Timeout(msg) => SecureGuardError::Timeout(msg),
        TransportError::Remote(msg) => SecureGuardError::Remote(msg),
    }
}
