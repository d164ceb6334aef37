//! Error taxonomy shared by every layer of the router.
//!
//! Each [`SecureGuardError`] variant maps onto exactly one [`ErrorKind`], and the kind's
//! string form is what callers see in `error` stream events.  The strings are part of the
//! wire contract and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, machine readable classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "UnknownToolError")]
    UnknownTool,
    #[serde(rename = "DuplicateNameError")]
    DuplicateName,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "ConnectionError")]
    Connection,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "RemoteError")]
    Remote,
    #[serde(rename = "LLMUnavailableError")]
    LlmUnavailable,
    #[serde(rename = "LLMStreamError")]
    LlmStream,
    #[serde(rename = "ToolLoopLimitError")]
    ToolLoopLimit,
    #[serde(rename = "ProtocolParseError")]
    ProtocolParse,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    /// The wire name of the kind, e.g. `"UnknownToolError"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "UnknownToolError",
            ErrorKind::DuplicateName => "DuplicateNameError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Remote => "RemoteError",
            ErrorKind::LlmUnavailable => "LLMUnavailableError",
            ErrorKind::LlmStream => "LLMStreamError",
            ErrorKind::ToolLoopLimit => "ToolLoopLimitError",
            ErrorKind::ProtocolParse => "ProtocolParseError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the router knows how to name.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SecureGuardError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool already registered: {0}")]
    DuplicateName(String),
    #[error("Invalid arguments: {0}")]
    Validation(String),
    #[error("Tool server unreachable: {0}")]
    Connection(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Tool reported failure: {0}")]
    Remote(String),
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),
    #[error("LLM stream failed: {0}")]
    LlmStream(String),
    #[error("Tool loop limit reached after {0} rounds")]
    ToolLoopLimit(usize),
    #[error("Malformed direct call: {0}")]
    ProtocolParse(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SecureGuardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecureGuardError::UnknownTool(_) => ErrorKind::UnknownTool,
            SecureGuardError::DuplicateName(_) => ErrorKind::DuplicateName,
            SecureGuardError::Validation(_) => ErrorKind::Validation,
            SecureGuardError::Connection(_) => ErrorKind::Connection,
            SecureGuardError::Timeout(_) => ErrorKind::Timeout,
            SecureGuardError::Remote(_) => ErrorKind::Remote,
            SecureGuardError::LlmUnavailable(_) => ErrorKind::LlmUnavailable,
            SecureGuardError::LlmStream(_) => ErrorKind::LlmStream,
            SecureGuardError::ToolLoopLimit(_) => ErrorKind::ToolLoopLimit,
            SecureGuardError::ProtocolParse(_) => ErrorKind::ProtocolParse,
            SecureGuardError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SecureGuardError>;
