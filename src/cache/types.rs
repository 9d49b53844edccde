//! Core types for the response cache.

use chrono::{DateTime, Utc};
use url::Url;

use super::fingerprint::Fingerprint;
use crate::network::{Request, Response};

/// A response as written to a cache generation.
///
/// Entries are replaced wholesale on refresh, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub fingerprint: Fingerprint,
  /// URL as the client issued it, minus the fragment
  pub request_url: Url,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
  /// Capture a network response under the fingerprint of the request that produced it.
  pub fn capture(request: &Request, response: &Response) -> Self {
    let mut request_url = request.url.clone();
    request_url.set_fragment(None);

    Self {
      fingerprint: Fingerprint::from_request(request),
      request_url,
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Turn the stored entry back into a response for the caller.
  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      url: self.request_url.clone(),
    }
  }
}

/// Result of an intercepted request, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ServeSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::Network,
      cached_at: None,
    }
  }

  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::Passthrough,
      cached_at: None,
    }
  }

  pub fn from_cache(stored: &StoredResponse, source: ServeSource) -> Self {
    Self {
      response: stored.to_response(),
      source,
      cached_at: Some(stored.stored_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
  /// Fresh response from the network
  Network,
  /// Network unavailable, served from the active generation
  Cache,
  /// Network unavailable and no entry; served the offline document
  OfflineFallback,
  /// Outside the agent's origin, forwarded untouched
  Passthrough,
}
