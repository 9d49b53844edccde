//! Request fingerprints: the key under which cache-equivalent requests are stored.

use sha2::{Digest, Sha256};
use url::Url;

use crate::network::Request;

/// Method plus normalized URL of a request.
///
/// Two requests with equal fingerprints are served the same cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
  method: String,
  url: String,
}

impl Fingerprint {
  pub fn new(method: &str, url: &Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url: normalize_url(url),
    }
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// Rebuild a fingerprint from its stored parts without renormalizing.
  pub(crate) fn from_parts(method: String, url: String) -> Self {
    Self { method, url }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable, fixed-length storage key.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Normalize a URL for fingerprinting.
///
/// Scheme and host are already lowercased and default ports dropped by the parser.
/// The fragment is removed and query pairs are sorted.
fn normalize_url(url: &Url) -> String {
  let mut normalized = url.clone();
  normalized.set_fragment(None);

  let mut pairs: Vec<(String, String)> = normalized.query_pairs().into_owned().collect();
  if pairs.is_empty() {
    normalized.set_query(None);
  } else {
    pairs.sort();
    normalized.query_pairs_mut().clear().extend_pairs(pairs);
  }

  normalized.to_string()
}
