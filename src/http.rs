use reqwest::{
    Client,
    header::{ACCEPT, HeaderMap, HeaderValue},
};
use std::time::Duration;

const USER_AGENT: &str = concat!("tcg-sync-rs/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client for catalog APIs and the WebDriver endpoint.
///
/// Catalog APIs reject anonymous clients, so every request carries a
/// user agent and asks for JSON.
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .build()
        .unwrap_or_else(|_| Client::new())
}
