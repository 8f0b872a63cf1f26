//! Generic JSON-over-HTTP name source.
//!
//! Issues `GET {base_url}/products/{product_id}` and expects a JSON object with a
//! `name` (or `title`) field and an optional `brand`. Authentication is a bearer
//! token read from an environment variable at construction time.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use shared_utils::env::get_env_var;
use tracing::debug;

use crate::{
    errors::{FetchError, SourceInitError},
    source::{FetchedName, NameSource},
};

/// Settings for [`HttpNameSource`].
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Base URL, e.g. `https://catalog.example.com/api/v1`.
    pub base_url: String,
    /// Name of the env var holding the bearer token; `None` sends no auth header.
    pub token_env: Option<String>,
    /// Per-request timeout enforced by the client.
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct NameResponse {
    name: Option<String>,
    title: Option<String>,
    brand: Option<String>,
}

pub struct HttpNameSource {
    client: Client,
    base_url: Url,
    label: String,
}

impl HttpNameSource {
    /// Creates a client for `cfg`.
    ///
    /// Fails when the token variable is configured but unset, or when the base URL
    /// cannot carry path segments.
    pub fn new(cfg: &HttpSourceConfig) -> Result<Self, SourceInitError> {
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|_| SourceInitError::BaseUrl(cfg.base_url.clone()))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceInitError::BaseUrl(cfg.base_url.clone()));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        // the secret lives on only inside the sensitive default header
        if let Some(var) = &cfg.token_env {
            let token = SecretString::new(get_env_var(var)?.into());
            let mut value =
                header::HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(cfg.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            label: base_url.host_str().unwrap_or("http").to_string(),
            base_url,
        })
    }

    fn product_url(&self, product_id: &str) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in `new`, so segments are always available
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().push("products").push(product_id);
        }
        url
    }
}

/// Maps a non-success HTTP status to the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let msg = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Fatal(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::Transient(msg)
        }
        s if s.is_server_error() => FetchError::Transient(msg),
        _ => FetchError::Fatal(msg),
    }
}

#[async_trait]
impl NameSource for HttpNameSource {
    async fn fetch_name(&self, product_id: &str) -> Result<FetchedName, FetchError> {
        let url = self.product_url(product_id);
        debug!(%url, "fetching product name");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(classify_status(status, &body));
        }

        let payload = response.json::<NameResponse>().await?;
        let name = payload
            .name
            .or(payload.title)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| FetchError::NotFound(format!("{product_id}: response carried no name")))?;

        Ok(FetchedName {
            name,
            brand: payload
                .brand
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty()),
        })
    }

    fn label(&self) -> &str {
        &self.label
    }
}
