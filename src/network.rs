//! Network abstraction: requests, responses and the HTTP client behind them.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{AgentError, AgentResult};

/// An outbound request as seen by the agent.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Look up a header value (case-insensitive name).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether the caller is navigating to an HTML document.
  pub fn accepts_html(&self) -> bool {
    self.method == "GET"
      && self
        .header("accept")
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
  }
}

/// A response received from the network or served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// Final URL after redirects
  pub url: Url,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Anything that can carry a request to the network.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> AgentResult<Response>;
}

/// Network implementation backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> AgentResult<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| AgentError::Network(format!("failed to build http client: {}", e)))?;

    Ok(Self { client, timeout })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> AgentResult<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| AgentError::Network(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| map_reqwest_error(e, self.timeout))?;

    let status = resp.status().as_u16();
    let url = resp.url().clone();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = resp
      .bytes()
      .await
      .map_err(|e| map_reqwest_error(e, self.timeout))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "network response");

    Ok(Response {
      status,
      headers,
      body,
      url,
    })
  }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> AgentError {
  if e.is_timeout() {
    AgentError::Timeout(timeout)
  } else {
    AgentError::Network(e.to_string())
  }
}
