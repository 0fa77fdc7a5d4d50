use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING};
use reqwest::Client;

const APP_USER_AGENT: &str = concat!("spectra-updater/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client.
///
/// Payloads are verified byte-for-byte against the catalog, so transparent
/// recompression must be disabled. The `http_proxy` environment variable
/// (`http://host:port[/]`) is honored for outbound requests.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    let mut builder = Client::builder()
        .user_agent(APP_USER_AGENT)
        .default_headers(default_headers)
        .connect_timeout(Duration::from_secs(10));

    if let Some(proxy) = proxy_from_env() {
        builder = builder.proxy(proxy);
    }

    builder.build()
}

fn proxy_from_env() -> Option<reqwest::Proxy> {
    let raw = std::env::var("http_proxy").ok()?;
    let trimmed = raw.trim_end_matches('/');
    if !trimmed.starts_with("http://") {
        return None;
    }
    reqwest::Proxy::http(trimmed).ok()
}
