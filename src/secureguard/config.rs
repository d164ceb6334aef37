//! Configuration for SecureGuard.
//!
//! Provides the [`SecureGuardConfig`] struct.  Construct it by hand, start from
//! [`Default`], or read overrides from the environment with [`SecureGuardConfig::from_env`].
//! No config-file parsing dependencies are involved.
//!
//! # Example
//!
//! ```rust
//! use secureguard::SecureGuardConfig;
//!
//! let config = SecureGuardConfig {
//!     mcp_url: "http://tools.internal:9002".into(),
//!     max_tool_rounds: 3,
//!     ..SecureGuardConfig::default()
//! };
//! assert_eq!(config.max_turns, 20);
//! ```

use crate::secureguard::clients::openai::{DEFAULT_MODEL, GROQ_BASE_URL};
use crate::secureguard::protocol_client::{ProtocolClientConfig, TimeoutPolicy};
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings for the router and its HTTP surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SecureGuardConfig {
    /// Credential for the LLM backend. `None` runs in direct-call mode only.
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    /// Completion budget per LLM request.
    pub llm_max_tokens: usize,
    /// A streamed completion that stays silent this long is abandoned.
    pub llm_idle_timeout: Duration,
    /// Base URL of the tool server.
    pub mcp_url: String,
    /// Deadline for a single tool call attempt.
    pub tool_timeout: Duration,
    pub tool_timeout_policy: TimeoutPolicy,
    /// Pause before retrying a tool call that could not connect.
    pub tool_retry_backoff: Duration,
    /// Address the HTTP server listens on.
    pub bind_addr: String,
    /// Turns kept per conversation.
    pub max_turns: usize,
    /// Tool rounds allowed per query before `ToolLoopLimitError`.
    pub max_tool_rounds: usize,
    /// Conversations untouched this long are dropped.
    pub session_idle: Duration,
}

impl Default for SecureGuardConfig {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_base_url: GROQ_BASE_URL.to_string(),
            llm_model: DEFAULT_MODEL.to_string(),
            llm_max_tokens: 1024,
            llm_idle_timeout: Duration::from_secs(30),
            mcp_url: "http://localhost:9002".to_string(),
            tool_timeout: Duration::from_secs(30),
            tool_timeout_policy: TimeoutPolicy::Surface,
            tool_retry_backoff: Duration::from_millis(500),
            bind_addr: "0.0.0.0:5000".to_string(),
            max_turns: 20,
            max_tool_rounds: 5,
            session_idle: Duration::from_secs(60 * 60),
        }
    }
}

impl SecureGuardConfig {
    /// Defaults overridden by any of the `GROQ_API_KEY` / `SECUREGUARD_*` variables that are
    /// set.  Values that fail to parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        config.llm_api_key = text("GROQ_API_KEY");
        if let Some(url) = text("SECUREGUARD_LLM_BASE_URL") {
            config.llm_base_url = url;
        }
        if let Some(model) = text("SECUREGUARD_LLM_MODEL") {
            config.llm_model = model;
        }
        if let Some(url) = text("SECUREGUARD_MCP_URL") {
            config.mcp_url = url;
        }
        if let Some(addr) = text("SECUREGUARD_BIND") {
            config.bind_addr = addr;
        }
        if let Some(policy) = text("SECUREGUARD_TOOL_TIMEOUT_POLICY") {
            match policy.to_ascii_lowercase().as_str() {
                "surface" => config.tool_timeout_policy = TimeoutPolicy::Surface,
                "retry" | "retry_once" => config.tool_timeout_policy = TimeoutPolicy::RetryOnce,
                other => log::warn!(
                    "secureguard::config: ignoring SECUREGUARD_TOOL_TIMEOUT_POLICY={}",
                    other
                ),
            }
        }

        parse_into(&text, "SECUREGUARD_MAX_TURNS", &mut config.max_turns);
        parse_into(&text, "SECUREGUARD_MAX_TOOL_ROUNDS", &mut config.max_tool_rounds);
        parse_into(&text, "SECUREGUARD_LLM_MAX_TOKENS", &mut config.llm_max_tokens);

        let mut secs = None;
        parse_into(&text, "SECUREGUARD_TOOL_TIMEOUT_SECS", &mut secs);
        if let Some(secs) = secs {
            config.tool_timeout = Duration::from_secs(secs);
        }
        let mut secs = None;
        parse_into(&text, "SECUREGUARD_LLM_IDLE_TIMEOUT_SECS", &mut secs);
        if let Some(secs) = secs {
            config.llm_idle_timeout = Duration::from_secs(secs);
        }
        let mut secs = None;
        parse_into(&text, "SECUREGUARD_SESSION_IDLE_SECS", &mut secs);
        if let Some(secs) = secs {
            config.session_idle = Duration::from_secs(secs);
        }

        config
    }

    /// Settings for the [`ProtocolClient`](crate::protocol_client::ProtocolClient).
    pub fn protocol_client_config(&self) -> ProtocolClientConfig {
        ProtocolClientConfig {
            call_timeout: self.tool_timeout,
            retry_backoff: self.tool_retry_backoff,
            timeout_policy: self.tool_timeout_policy,
        }
    }
}

trait ParseTarget {
    fn assign(&mut self, raw: &str) -> bool;
}

impl ParseTarget for usize {
    fn assign(&mut self, raw: &str) -> bool {
        usize::from_str(raw).map(|v| *self = v).is_ok()
    }
}

impl ParseTarget for Option<u64> {
    fn assign(&mut self, raw: &str) -> bool {
        u64::from_str(raw).map(|v| *self = Some(v)).is_ok()
    }
}

fn parse_into<F, T>(text: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: ParseTarget,
{
    if let Some(raw) = text(key) {
        if !target.assign(&raw) {
            log::warn!("secureguard::config: ignoring {}={}, not a number", key, raw);
        }
    }
}
