// src/secureguard/mod.rs

pub mod catalog;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod http_pool;
pub mod orchestrator;
pub mod prompt;
pub mod protocol_client;
pub mod query;
#[cfg(feature = "server")]
pub mod server;
pub mod tool_registry;
pub mod tool_transport;

// Let's explicitly export the Orchestrator so callers can write secureguard::Orchestrator
pub use orchestrator::Orchestrator;
