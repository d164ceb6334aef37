//! Direct-call detection and parsing.
//!
//! Grammar: `tool: <name> [<key>=<value>]*`, whitespace separated.  The `tool:` prefix is
//! matched case-insensitively after trimming.  Values are literal strings running up to the
//! next whitespace; there is no quoting.

use crate::secureguard::error::{Result, SecureGuardError};
use crate::secureguard::tool_registry::ToolArguments;
use serde_json::Value;

const PREFIX: &str = "tool:";

/// A parsed `tool:` query.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectCall {
    pub name: String,
    /// Every value is a JSON string.
    pub arguments: ToolArguments,
}

/// Whether the query asks for a direct tool call.
pub fn is_direct_call(query: &str) -> bool {
    let trimmed = query.trim_start();
    trimmed
        .get(..PREFIX.len())
        .map(|head| head.eq_ignore_ascii_case(PREFIX))
        .unwrap_or(false)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Parse a direct call. Callers check [`is_direct_call`] first.
///
/// ```rust
/// use secureguard::query::parse_direct_call;
///
/// let call = parse_direct_call("TOOL: list_signals org_name=OrgA signal_type=MALWARE").unwrap();
/// assert_eq!(call.name, "list_signals");
/// assert_eq!(call.arguments["org_name"], "OrgA");
///
/// assert!(parse_direct_call("tool: list_signals OrgA").is_err());
/// ```
pub fn parse_direct_call(query: &str) -> Result<DirectCall> {
    let trimmed = query.trim();
    if !is_direct_call(trimmed) {
        return Err(SecureGuardError::ProtocolParse(format!(
            "expected '{}' prefix",
            PREFIX
        )));
    }

    let mut tokens = trimmed[PREFIX.len()..].split_whitespace();
    let name = tokens.next().ok_or_else(|| {
        SecureGuardError::ProtocolParse("missing tool name after 'tool:'".to_string())
    })?;
    if !is_identifier(name) {
        return Err(SecureGuardError::ProtocolParse(format!(
            "'{}' is not a valid tool name",
            name
        )));
    }

    let mut arguments = ToolArguments::new();
    for token in tokens {
        let (key, value) = token.split_once('=').ok_or_else(|| {
            SecureGuardError::ProtocolParse(format!(
                "expected key=value, got '{}'",
                token
            ))
        })?;
        if key.is_empty() {
            return Err(SecureGuardError::ProtocolParse(format!(
                "empty parameter name in '{}'",
                token
            )));
        }
        if !is_identifier(key) {
            return Err(SecureGuardError::ProtocolParse(format!(
                "'{}' is not a valid parameter name",
                key
            )));
        }
        if arguments.contains_key(key) {
            return Err(SecureGuardError::ProtocolParse(format!(
                "parameter '{}' given more than once",
                key
            )));
        }
        arguments.insert(key.to_string(), Value::String(value.to_string()));
    }

    Ok(DirectCall {
        name: name.to_string(),
        arguments,
    })
}
