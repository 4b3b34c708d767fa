//! Network access used by the strategies, install and bulk caching.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::http::{Request, Response};

/// Failure to obtain a usable response from the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// The transport rejected the request (offline, DNS, TLS, reset...)
  #[error("network request to {url} failed: {message}")]
  Transport { url: String, message: String },
  /// A response arrived but the caller required a different status
  #[error("{url} responded with status {status}")]
  Status { url: String, status: u16 },
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl FetchError {
  pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Transport {
      url: url.into(),
      message: message.into(),
    }
  }
}

/// Something that can turn a request into a response.
///
/// Like `fetch()`, any HTTP status is a successful fetch; only transport
/// failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Network backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(format!("method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| FetchError::InvalidRequest(format!("header {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| FetchError::InvalidRequest(format!("header value: {}", e)))?;
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::transport(request.url.as_str(), e.to_string()))?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::transport(request.url.as_str(), e.to_string()))?;

    Ok(
      headers
        .iter()
        .fold(Response::new(status, body.to_vec()), |resp, (k, v)| {
          resp.with_header(k, v)
        }),
    )
  }
}

/// Fetch and insist on a 2xx response, the way `Cache.addAll` does.
pub async fn fetch_ok(network: &dyn Network, request: &Request) -> Result<Response, FetchError> {
  let response = network.fetch(request).await?;
  if response.is_ok() {
    Ok(response)
  } else {
    Err(FetchError::Status {
      url: request.url.to_string(),
      status: response.status,
    })
  }
}
