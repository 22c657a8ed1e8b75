//! Network capability of a surface.
//!
//! `fetch()` inside a surface reaches the network only for origins on the
//! allow-list, which is empty unless configured. Redirects are followed
//! only while they stay on an allowed origin.

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{redirect, Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use url::Url;

const MAX_REDIRECTS: usize = 5;

/// Origins (scheme + host + port) a surface may fetch from.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    pub allowed_origins: Vec<String>,
}

impl NetworkPolicy {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/') == origin)
    }

    fn client(&self) -> Result<Client, anyhow::Error> {
        let policy = self.clone();
        Client::builder()
            .redirect(redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if policy.is_origin_allowed(attempt.url()) {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let policy = state.borrow().borrow::<NetworkPolicy>().clone();
    fetch(request, &policy).await
}

async fn fetch(request: FetchRequest, policy: &NetworkPolicy) -> Result<FetchResponse, anyhow::Error> {
    let url = Url::parse(&request.url).map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !policy.is_origin_allowed(&url) {
        tracing::debug!(url = %url, "fetch blocked by network policy");
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not allowed in the sandbox",
            url.origin().ascii_serialization()
        ));
    }

    let method = request.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| anyhow!("Unsupported HTTP method: {}", method))?;

    let mut builder = policy.client()?.request(method, url);
    for (key, value) in request.headers.iter().flatten() {
        builder = builder.header(key, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| anyhow!("Fetch failed: {}", e))?;
    let status = response.status();
    let final_url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(key, value)| value.to_str().ok().map(|v| (key.to_string(), v.to_string())))
        .collect();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

    Ok(FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers,
        url: final_url,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let policy = NetworkPolicy {
            allowed_origins: vec!["https://api.example.com".into(), "http://localhost:3000/".into()],
        };

        assert!(policy.is_origin_allowed(&Url::parse("https://api.example.com/users").unwrap()));
        assert!(policy.is_origin_allowed(&Url::parse("http://localhost:3000/api").unwrap()));

        assert!(!policy.is_origin_allowed(&Url::parse("http://api.example.com/users").unwrap()));
        assert!(!policy.is_origin_allowed(&Url::parse("https://api.example.com:8443/").unwrap()));
        assert!(!policy.is_origin_allowed(&Url::parse("https://evil.example/").unwrap()));
    }

    #[test]
    fn test_default_policy_blocks_everything() {
        let policy = NetworkPolicy::default();
        assert!(!policy.is_origin_allowed(&Url::parse("https://anything.example").unwrap()));
    }

    #[tokio::test]
    async fn test_blocked_fetch_never_touches_network() {
        let request = FetchRequest {
            url: "https://example.com/data".into(),
            method: None,
            headers: None,
            body: None,
        };
        let err = fetch(request, &NetworkPolicy::default()).await.unwrap_err();
        assert!(err.to_string().contains("Fetch blocked"));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let request = FetchRequest {
            url: "not a url".into(),
            method: None,
            headers: None,
            body: None,
        };
        let err = fetch(request, &NetworkPolicy::default()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid URL"));
    }
}
