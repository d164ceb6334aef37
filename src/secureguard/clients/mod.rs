//! Provider specific [`ClientWrapper`](crate::client_wrapper::ClientWrapper) implementations.
//!
//! SecureGuard talks to a single OpenAI-compatible backend (Groq by default); the SSE
//! decoding lives in its own module so it can be tested without a network.

pub mod openai;
pub mod sse;
