//! SecureGuard HTTP server.
//!
//! Configuration comes from the environment (see `SecureGuardConfig::from_env`); set
//! `RUST_LOG=info` for request logging.

use secureguard::catalog::default_registry;
use secureguard::clients::openai::OpenAIClient;
use secureguard::orchestrator::OrchestratorOptions;
use secureguard::protocol_client::ProtocolClient;
use secureguard::tool_registry::ToolRegistry;
use secureguard::tool_transport::{HttpToolTransport, ToolTransport};
use secureguard::{Orchestrator, SecureGuardConfig};
use std::sync::Arc;
use std::time::Duration;

/// Use the tool server's own catalog when it can be fetched, the built-in one otherwise.
async fn load_registry(transport: &HttpToolTransport) -> ToolRegistry {
    match transport.list_tools().await {
        Ok(specs) if !specs.is_empty() => match ToolRegistry::from_specs(specs) {
            Ok(registry) => {
                log::info!(
                    "loaded {} tools from {}",
                    registry.len(),
                    transport.endpoint()
                );
                registry
            }
            Err(err) => {
                log::warn!("remote catalog rejected ({}), using built-in catalog", err);
                default_registry()
            }
        },
        Ok(_) => {
            log::warn!("remote catalog is empty, using built-in catalog");
            default_registry()
        }
        Err(err) => {
            log::warn!(
                "tool server {} unreachable ({}), using built-in catalog",
                transport.endpoint(),
                err
            );
            default_registry()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    secureguard::init_logger();
    let config = SecureGuardConfig::from_env();

    let transport = Arc::new(HttpToolTransport::new(&config.mcp_url));
    let registry = Arc::new(load_registry(&transport).await);
    let protocol = Arc::new(
        ProtocolClient::new(transport, registry.clone())
            .with_config(config.protocol_client_config()),
    );

    let llm = Arc::new(
        OpenAIClient::new_with_base_url(
            config.llm_api_key.clone(),
            &config.llm_model,
            &config.llm_base_url,
        )
        .with_idle_timeout(config.llm_idle_timeout),
    );
    if config.llm_api_key.is_none() {
        log::warn!("GROQ_API_KEY not set; only direct tool calls will be answered");
    }

    let orchestrator = Arc::new(
        Orchestrator::new(registry, protocol, llm).with_options(OrchestratorOptions {
            max_tool_rounds: config.max_tool_rounds,
            completion_budget: config.llm_max_tokens,
            max_turns: config.max_turns,
            ..OrchestratorOptions::default()
        }),
    );

    let sweeper = orchestrator.clone();
    let session_idle = config.session_idle;
    tokio::spawn(async move {
        let period = Duration::from_secs(60)
            .min(session_idle)
            .max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            sweeper.evict_idle(session_idle);
        }
    });

    secureguard::server::serve(orchestrator, &config.bind_addr).await?;
    Ok(())
}
