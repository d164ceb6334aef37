//! HTTP Client Pool for maintaining persistent connections per base URL.
//!
//! Both the tool server transport and the LLM client talk to a single base URL for the
//! lifetime of the process, so each base URL gets one shared `reqwest::Client`:
//! - HTTP connections are reused across requests (connection pooling)
//! - DNS lookups and TLS handshakes are minimized
//! - TCP keepalive prevents idle connections from being dropped
//!
//! No overall request timeout is configured on the client: the LLM stream may legitimately
//! stay open for minutes.  Callers apply their own per-call or per-read timeouts.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    /// Global HTTP client pool, lazily initialized on first access.
    static ref HTTP_CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> =
        Mutex::new(HashMap::new());
}

/// Get or create the shared HTTP client for the given base URL.
///
/// The returned client is a cheap clone sharing the pooled connections.
pub fn get_http_client(base_url: &str) -> reqwest::Client {
    let mut pool = match HTTP_CLIENT_POOL.lock() {
        Ok(pool) => pool,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }

    let client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|err| {
            log::warn!(
                "secureguard::http_pool::get_http_client({}): falling back to default client: {}",
                base_url,
                err
            );
            reqwest::Client::new()
        });

    pool.insert(base_url.to_string(), client.clone());
    client
}
