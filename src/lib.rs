//! # SecureGuard
//!
//! SecureGuard is a conversational front end over a catalog of security-data query tools
//! (organizations, cases, signals, summaries) served by a remote tool server.
//!
//! A query is answered in one of two ways:
//!
//! * **Direct dispatch**: `tool: <name> [key=value ...]` is parsed, validated against the
//!   [`tool_registry::ToolRegistry`] and executed through the [`protocol_client::ProtocolClient`].
//! * **LLM-mediated**: anything else goes to an OpenAI-compatible LLM (Groq by default) that
//!   may call tools itself; its answer is streamed token by token.
//!
//! Either way the caller receives an ordered stream of [`event::StreamEvent`]s that always
//! ends with exactly one `done`, and the session's [`conversation::Conversation`] is updated.
//!
//! ## Core pieces
//!
//! * [`Orchestrator`]: the query state machine, plus conversation bookkeeping and health.
//! * [`client_wrapper::ClientWrapper`]: streaming LLM seam, implemented by
//!   [`clients::openai::OpenAIClient`].
//! * [`tool_transport::ToolTransport`]: tool server seam, implemented by
//!   [`tool_transport::HttpToolTransport`].
//! * `server` (feature `server`): axum routes exposing the orchestrator over HTTP and SSE.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use secureguard::catalog::default_registry;
//! use secureguard::clients::openai::OpenAIClient;
//! use secureguard::protocol_client::ProtocolClient;
//! use secureguard::tool_transport::HttpToolTransport;
//! use secureguard::{Orchestrator, SecureGuardConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     secureguard::init_logger();
//!     let config = SecureGuardConfig::from_env();
//!
//!     let registry = Arc::new(default_registry());
//!     let protocol = Arc::new(
//!         ProtocolClient::new(Arc::new(HttpToolTransport::new(&config.mcp_url)), registry.clone())
//!             .with_config(config.protocol_client_config()),
//!     );
//!     let llm = Arc::new(OpenAIClient::new(config.llm_api_key.clone()));
//!     let orchestrator = Arc::new(Orchestrator::new(registry, protocol, llm));
//!
//!     let mut events = orchestrator.stream_query("demo", "What's our security status?");
//!     while let Some(event) = events.next().await {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding SecureGuard opt in to `RUST_LOG` driven diagnostics by calling this
/// early; repeated calls are no-ops.
///
/// ```rust
/// secureguard::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::try_init();
    });
}

// Import the top-level `secureguard` module.
pub mod secureguard;

// Re-exporting key items for easier external access.
pub use secureguard::catalog;
pub use secureguard::client_wrapper;
pub use secureguard::client_wrapper::{ClientWrapper, CompletionEvent, FinishReason, Message, Role};
pub use secureguard::clients;
pub use secureguard::config::SecureGuardConfig;
pub use secureguard::conversation;
pub use secureguard::conversation::{Conversation, ConversationStore, Turn};
pub use secureguard::error;
pub use secureguard::error::{ErrorKind, SecureGuardError};
pub use secureguard::event;
pub use secureguard::event::StreamEvent;
pub use secureguard::http_pool;
pub use secureguard::orchestrator;
pub use secureguard::orchestrator::Orchestrator;
pub use secureguard::prompt;
pub use secureguard::protocol_client;
pub use secureguard::query;
#[cfg(feature = "server")]
pub use secureguard::server;
pub use secureguard::tool_registry;
pub use secureguard::tool_transport;
