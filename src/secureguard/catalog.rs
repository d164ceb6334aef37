//! Built-in description of the SecureGuard tool catalog.
//!
//! Used when the tool server's own catalog cannot be fetched at startup, so that direct
//! calls can still be validated and the LLM still knows which tools exist.

use crate::secureguard::tool_registry::{ToolParameter, ToolParameterType, ToolRegistry, ToolSpec};
use serde_json::json;

/// The eight tools served by the SecureGuard tool server, in their canonical order.
pub fn security_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "list_organizations",
            "List all organizations monitored by SecureGuard",
        ),
        ToolSpec::new(
            "get_organization_details",
            "Get detailed info about a specific organization",
        )
        .with_parameter(
            ToolParameter::new("org_name", ToolParameterType::String)
                .with_description("Name of the organization, e.g. 'OrgA'")
                .required(),
        ),
        ToolSpec::new("filter_organizations_by_type", "Filter organizations by type")
            .with_parameter(
                ToolParameter::new("org_type", ToolParameterType::String)
                    .with_description("Organization type, e.g. 'technology' or 'finance'")
                    .required(),
            ),
        ToolSpec::new(
            "list_cases",
            "List security cases, optionally filtered by status",
        )
        .with_parameter(
            ToolParameter::new("status", ToolParameterType::String)
                .with_description("Case status such as 'active' or 'resolved'; 'all' for no filter")
                .with_default(json!("all")),
        ),
        ToolSpec::new("get_case_details", "Get details for a security case").with_parameter(
            ToolParameter::new("case_id", ToolParameterType::String)
                .with_description("Case identifier, e.g. 'CASE001'")
                .required(),
        ),
        ToolSpec::new("list_signals", "List security signals with optional filtering")
            .with_parameter(
                ToolParameter::new("org_name", ToolParameterType::String)
                    .with_description("Organization name; 'all' for no filter")
                    .with_default(json!("all")),
            )
            .with_parameter(
                ToolParameter::new("signal_type", ToolParameterType::String)
                    .with_description("Signal type such as 'MALWARE'; 'all' for no filter")
                    .with_default(json!("all")),
            ),
        ToolSpec::new(
            "get_security_summary",
            "Get a comprehensive security summary with key metrics",
        ),
        ToolSpec::new("health", "Check the health status of the tool server"),
    ]
}

/// A registry pre-populated with [`security_tools`].
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for spec in security_tools() {
        // names in the built-in catalog are unique
        let _ = registry.register(spec);
    }
    registry
}
