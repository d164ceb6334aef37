//! Prompt text: the assistant system prompt and the direct-call suggestions offered when
//! the LLM cannot be used.

use crate::secureguard::tool_registry::ToolRegistry;

/// System prompt listing every registered tool.
pub fn system_prompt(registry: &ToolRegistry) -> String {
    let tool_context = registry
        .list()
        .iter()
        .map(|spec| {
            let description = if spec.description.is_empty() {
                "No description"
            } else {
                spec.description.as_str()
            };
            format!("- {}: {}", spec.name, description)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a helpful SecureGuard security monitoring assistant.\n\n\
         Available tools:\n{}\n\n\
         You can help users understand their security posture, analyze cases, and manage organizations.\n\
         For direct tool access, users can type 'tool: <tool_name> [parameters]'.",
        tool_context
    )
}

enum Suggestion {
    Fixed(&'static str),
    /// First matching refinement wins; `fallback` applies when none matches.
    Refined {
        refinements: &'static [(&'static [&'static str], &'static str)],
        fallback: Option<&'static str>,
    },
}

const SUGGESTIONS: &[(&[&str], Suggestion)] = &[
    (
        &["summary", "overview", "status", "metrics"],
        Suggestion::Fixed("tool: get_security_summary"),
    ),
    (
        &["organization", "org", "company"],
        Suggestion::Refined {
            refinements: &[
                (&["list", "all"], "tool: list_organizations"),
                (
                    &["details", "info", "about"],
                    "tool: get_organization_details org_name=OrgA",
                ),
            ],
            fallback: None,
        },
    ),
    (
        &["case", "incident"],
        Suggestion::Refined {
            refinements: &[
                (&["active"], "tool: list_cases status=active"),
                (&["details", "info"], "tool: get_case_details case_id=CASE001"),
            ],
            fallback: Some("tool: list_cases"),
        },
    ),
    (
        &["signal", "alert", "detection"],
        Suggestion::Fixed("tool: list_signals"),
    ),
    (
        &["health", "check", "status"],
        Suggestion::Fixed("tool: health"),
    ),
];

/// Direct calls that plausibly answer `query`, matched on keywords (substring, case-insensitive).
///
/// ```rust
/// use secureguard::prompt::tool_suggestions;
///
/// assert_eq!(
///     tool_suggestions("show me active incidents"),
///     vec!["tool: list_cases status=active"]
/// );
/// ```
pub fn tool_suggestions(query: &str) -> Vec<String> {
    let query = query.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| query.contains(w));

    let mut suggestions = Vec::new();
    for (keywords, suggestion) in SUGGESTIONS {
        if !mentions(keywords) {
            continue;
        }
        let picked = match suggestion {
            Suggestion::Fixed(call) => Some(*call),
            Suggestion::Refined {
                refinements,
                fallback,
            } => refinements
                .iter()
                .find(|(words, _)| mentions(words))
                .map(|(_, call)| *call)
                .or(*fallback),
        };
        if let Some(call) = picked {
            suggestions.push(call.to_string());
        }
    }
    suggestions
}

/// Message for the `LLMUnavailableError` event.
pub fn unavailable_message(query: &str, registry: &ToolRegistry) -> String {
    let suggestions = tool_suggestions(query);
    match suggestions.split_first() {
        Some((first, rest)) => {
            let mut message = format!("LLM unavailable; try {}", first);
            for other in rest {
                message.push_str(&format!("\n• {}", other));
            }
            message
        }
        None => {
            let names = registry.names();
            let example = names.first().map(String::as_str).unwrap_or("<name>");
            format!(
                "LLM unavailable; try tool: {} (available: {})",
                example,
                names.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secureguard::catalog::default_registry;

    #[test]
    fn test_status_matches_summary_and_health() {
        assert_eq!(
            tool_suggestions("What's our STATUS?"),
            vec!["tool: get_security_summary", "tool: health"]
        );
    }

    #[test]
    fn test_refinements_and_fallbacks() {
        assert_eq!(
            tool_suggestions("list all organizations"),
            vec!["tool: list_organizations"]
        );
        assert_eq!(
            tool_suggestions("tell me about company X"),
            vec!["tool: get_organization_details org_name=OrgA"]
        );
        assert_eq!(tool_suggestions("organization"), Vec::<String>::new());
        assert_eq!(tool_suggestions("any new cases?"), vec!["tool: list_cases"]);
        assert_eq!(tool_suggestions("recent alerts"), vec!["tool: list_signals"]);
        assert!(tool_suggestions("hello there").is_empty());
    }

    #[test]
    fn test_unavailable_message() {
        let registry = default_registry();
        assert_eq!(
            unavailable_message("security overview please", &registry),
            "LLM unavailable; try tool: get_security_summary"
        );
        let generic = unavailable_message("hello", &registry);
        assert!(generic.starts_with("LLM unavailable; try tool: list_organizations"));
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let prompt = system_prompt(&default_registry());
        assert!(prompt.contains("- get_case_details: Get details for a security case"));
        assert!(prompt.contains("tool: <tool_name> [parameters]"));
    }
}
