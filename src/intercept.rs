//! Request interception: network first, cache as fallback.
//!
//! Requests outside the agent's origin are forwarded untouched. In-scope
//! requests go to the network with a bounded wait; cacheable responses are
//! copied into the active generation in the background. When the network
//! fails the active generation answers, then the offline document for HTML
//! navigations, and otherwise the network error reaches the caller.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, Fingerprint, ServeSource, Served, StoredResponse};
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::LifecycleManager;
use crate::network::{Network, Request, Response};

pub struct Interceptor<N: Network, S: CacheStorage> {
  network: Arc<N>,
  storage: Arc<S>,
  lifecycle: Arc<LifecycleManager<S>>,
  origin: Url,
  timeout: Duration,
  offline_fallback: Option<Fingerprint>,
}

impl<N: Network, S: CacheStorage> Interceptor<N, S> {
  pub fn new(
    network: Arc<N>,
    storage: Arc<S>,
    lifecycle: Arc<LifecycleManager<S>>,
    origin: Url,
    timeout: Duration,
  ) -> Self {
    Self {
      network,
      storage,
      lifecycle,
      origin,
      timeout,
      offline_fallback: None,
    }
  }

  /// Serve this document to HTML navigations that miss the cache while offline.
  pub fn with_offline_fallback(mut self, url: &Url) -> Self {
    self.offline_fallback = Some(Fingerprint::new("GET", url));
    self
  }

  pub fn in_scope(&self, url: &Url) -> bool {
    same_origin(url, &self.origin)
  }

  pub async fn fetch(&self, request: Request) -> AgentResult<Served> {
    if !self.in_scope(&request.url) {
      debug!(url = %request.url, "outside origin, passing through");
      let response = self.network.fetch(&request).await?;
      return Ok(Served::passthrough(response));
    }

    // Keeps the serving generation from being cut over under this request
    let guard = self.lifecycle.begin_serving();
    let tag = guard.as_ref().map(|g| g.tag().to_string());
    let fingerprint = Fingerprint::from_request(&request);

    let error = match tokio::time::timeout(self.timeout, self.network.fetch(&request)).await {
      Ok(Ok(response)) => {
        match &tag {
          Some(tag) if is_cacheable(&request, &response, &self.origin) => {
            self.store_in_background(tag, &request, &response)
          }
          _ => debug!(url = %request.url, status = response.status, "response not cached"),
        }
        return Ok(Served::from_network(response));
      }
      Ok(Err(e)) => e,
      Err(_) => AgentError::Timeout(self.timeout),
    };

    debug!(url = %request.url, error = %error, "network failed, falling back to cache");
    self.fallback(&request, &fingerprint, tag.as_deref(), error)
  }

  fn fallback(
    &self,
    request: &Request,
    fingerprint: &Fingerprint,
    tag: Option<&str>,
    error: AgentError,
  ) -> AgentResult<Served> {
    let Some(tag) = tag else {
      return Err(error);
    };

    if let Some(stored) = self.lookup(tag, fingerprint) {
      debug!(fingerprint = %fingerprint, "serving from cache");
      return Ok(Served::from_cache(&stored, ServeSource::Cache));
    }

    if request.accepts_html() {
      if let Some(offline) = &self.offline_fallback {
        if let Some(stored) = self.lookup(tag, offline) {
          debug!(url = %request.url, "serving offline document");
          return Ok(Served::from_cache(&stored, ServeSource::OfflineFallback));
        }
      }
    }

    Err(error)
  }

  fn lookup(&self, tag: &str, fingerprint: &Fingerprint) -> Option<StoredResponse> {
    match self.storage.get(tag, fingerprint) {
      Ok(stored) => stored,
      Err(e) => {
        warn!(fingerprint = %fingerprint, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// Write a copy of the response without holding up the caller. Failures are only logged.
  fn store_in_background(&self, tag: &str, request: &Request, response: &Response) {
    let storage = Arc::clone(&self.storage);
    let tag = tag.to_string();
    let entry = StoredResponse::capture(request, response);

    tokio::task::spawn_blocking(move || match storage.put(&tag, &entry) {
      Ok(()) => debug!(tag = %tag, fingerprint = %entry.fingerprint, "cached response"),
      Err(e) => warn!(tag = %tag, fingerprint = %entry.fingerprint, error = %e, "cache write failed"),
    });
  }
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
  a.origin() == b.origin()
}

/// Only complete, same-origin GET responses are worth keeping.
pub fn is_cacheable(request: &Request, response: &Response, origin: &Url) -> bool {
  request.method == "GET" && response.status == 200 && same_origin(&response.url, origin)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{GenerationRecord, SqliteStorage};
  use crate::db::Database;
  use crate::event::EventBus;
  use crate::lifecycle::GenerationState;
  use crate::testing::MockNetwork;

  const TIMEOUT: Duration = Duration::from_millis(100);
  const ORIGIN: &str = "https://app.example.com/";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn html(path: &str) -> Request {
    Request::get(url(path)).with_header("Accept", "text/html")
  }

  struct Fixture<S: CacheStorage> {
    network: Arc<MockNetwork>,
    storage: Arc<S>,
    interceptor: Interceptor<MockNetwork, S>,
  }

  async fn fixture_with<S: CacheStorage>(storage: S) -> Fixture<S> {
    let network = Arc::new(MockNetwork::new());
    network.respond("GET", "https://app.example.com/offline.html", 200, "you are offline");

    let storage = Arc::new(storage);
    let lifecycle = Arc::new(LifecycleManager::open(storage.clone(), EventBus::default()).unwrap());
    lifecycle
      .install("v1", &[url("/offline.html")], network.as_ref(), TIMEOUT)
      .await
      .unwrap();

    let interceptor = Interceptor::new(
      network.clone(),
      storage.clone(),
      lifecycle,
      url("/"),
      TIMEOUT,
    )
    .with_offline_fallback(&url("/offline.html"));

    Fixture {
      network,
      storage,
      interceptor,
    }
  }

  async fn fixture() -> Fixture<SqliteStorage> {
    fixture_with(SqliteStorage::new(Database::open_in_memory().unwrap())).await
  }

  async fn wait_for_entry<S: CacheStorage>(storage: &S, request: &Request) -> StoredResponse {
    let fingerprint = Fingerprint::from_request(request);
    for _ in 0..100 {
      if let Some(stored) = storage.get("v1", &fingerprint).unwrap() {
        return stored;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("entry for {} never stored", fingerprint);
  }

  #[tokio::test]
  async fn test_online_then_offline_serves_cached_copy() {
    let f = fixture().await;
    f.network.respond("GET", "https://app.example.com/data.json", 200, "{\"n\":1}");

    let request = Request::get(url("/data.json"));
    let online = f.interceptor.fetch(request.clone()).await.unwrap();
    assert_eq!(online.source, ServeSource::Network);
    wait_for_entry(f.storage.as_ref(), &request).await;

    f.network.set_online(false);
    let offline = f.interceptor.fetch(request).await.unwrap();

    assert_eq!(offline.source, ServeSource::Cache);
    assert_eq!(offline.response.body, online.response.body);
    assert_eq!(offline.response.status, 200);
    assert_eq!(offline.response.headers, online.response.headers);
    assert!(offline.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_preferred_over_cache() {
    let f = fixture().await;
    f.network.respond("GET", "https://app.example.com/v", 200, "first");
    let request = Request::get(url("/v"));
    f.interceptor.fetch(request.clone()).await.unwrap();
    wait_for_entry(f.storage.as_ref(), &request).await;

    f.network.respond("GET", "https://app.example.com/v", 200, "second");
    let served = f.interceptor.fetch(request).await.unwrap();

    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.body, b"second");
  }

  #[tokio::test]
  async fn test_timeout_falls_back_to_cache() {
    let f = fixture().await;
    f.network.hang("GET", "https://app.example.com/offline.html");

    let served = f.interceptor.fetch(Request::get(url("/offline.html"))).await.unwrap();

    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(served.response.body, b"you are offline");
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_fallback_document() {
    let f = fixture().await;
    f.network.set_online(false);

    let served = f.interceptor.fetch(html("/never-visited")).await.unwrap();
    assert_eq!(served.source, ServeSource::OfflineFallback);
    assert_eq!(served.response.body, b"you are offline");

    let err = f
      .interceptor
      .fetch(Request::get(url("/api/never-visited")))
      .await
      .unwrap_err();
    assert!(matches!(err, AgentError::Network(_)));
  }

  #[tokio::test]
  async fn test_foreign_origin_passes_through() {
    let f = fixture().await;
    f.network.respond("GET", "https://cdn.other.com/lib.js", 200, "lib");

    let request = Request::get(Url::parse("https://cdn.other.com/lib.js").unwrap());
    let served = f.interceptor.fetch(request.clone()).await.unwrap();
    assert_eq!(served.source, ServeSource::Passthrough);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f
      .storage
      .get("v1", &Fingerprint::from_request(&request))
      .unwrap()
      .is_none());

    f.network.set_online(false);
    let offline = Request::get(Url::parse("https://cdn.other.com/lib.js").unwrap())
      .with_header("Accept", "text/html");
    assert!(f.interceptor.fetch(offline).await.is_err());
  }

  #[tokio::test]
  async fn test_uncacheable_responses_are_returned_but_not_stored() {
    let f = fixture().await;
    f.network.respond("GET", "https://app.example.com/missing", 404, "nope");
    f.network.respond_with(
      "GET",
      "https://app.example.com/redirect",
      Response {
        status: 200,
        headers: Vec::new(),
        body: b"elsewhere".to_vec(),
        url: Url::parse("https://evil.example.net/landing").unwrap(),
      },
    );
    f.network.respond("POST", "https://app.example.com/form", 200, "ok");

    let requests = vec![
      Request::get(url("/missing")),
      Request::get(url("/redirect")),
      Request::new("POST", url("/form")),
    ];
    for request in &requests {
      f.interceptor.fetch(request.clone()).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    for request in &requests {
      assert!(f
        .storage
        .get("v1", &Fingerprint::from_request(request))
        .unwrap()
        .is_none());
    }
  }

  /// Storage whose single-entry writes always fail.
  struct ReadOnly(SqliteStorage);

  impl CacheStorage for ReadOnly {
    fn get(&self, tag: &str, fp: &Fingerprint) -> AgentResult<Option<StoredResponse>> {
      self.0.get(tag, fp)
    }
    fn put(&self, _tag: &str, _entry: &StoredResponse) -> AgentResult<()> {
      Err(AgentError::CacheWrite("disk full".into()))
    }
    fn put_many(&self, tag: &str, entries: &[StoredResponse]) -> AgentResult<()> {
      self.0.put_many(tag, entries)
    }
    fn delete_all_except(&self, tag: &str) -> AgentResult<usize> {
      self.0.delete_all_except(tag)
    }
    fn list_fingerprints(&self, tag: &str) -> AgentResult<Vec<Fingerprint>> {
      self.0.list_fingerprints(tag)
    }
    fn list_requests(&self, tag: &str) -> AgentResult<Vec<Request>> {
      self.0.list_requests(tag)
    }
    fn set_generation_state(&self, tag: &str, state: GenerationState) -> AgentResult<()> {
      self.0.set_generation_state(tag, state)
    }
    fn activate_generation(&self, tag: &str) -> AgentResult<()> {
      self.0.activate_generation(tag)
    }
    fn delete_generation(&self, tag: &str) -> AgentResult<()> {
      self.0.delete_generation(tag)
    }
    fn active_generation(&self) -> AgentResult<Option<String>> {
      self.0.active_generation()
    }
    fn generations(&self) -> AgentResult<Vec<GenerationRecord>> {
      self.0.generations()
    }
  }

  #[tokio::test]
  async fn test_cache_write_failure_never_reaches_caller() {
    let f = fixture_with(ReadOnly(SqliteStorage::new(Database::open_in_memory().unwrap()))).await;
    f.network.respond("GET", "https://app.example.com/a", 200, "fresh");

    let served = f.interceptor.fetch(Request::get(url("/a"))).await.unwrap();

    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(served.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_no_active_generation_means_no_fallback() {
    let network = Arc::new(MockNetwork::new());
    let storage = Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()));
    let lifecycle = Arc::new(LifecycleManager::open(storage.clone(), EventBus::default()).unwrap());
    let interceptor = Interceptor::new(network.clone(), storage, lifecycle, url("/"), TIMEOUT);

    network.respond("GET", "https://app.example.com/a", 200, "x");
    assert!(interceptor.fetch(Request::get(url("/a"))).await.is_ok());

    network.set_online(false);
    assert!(interceptor.fetch(html("/a")).await.is_err());
  }

  #[test]
  fn test_scope() {
    assert!(same_origin(&url("/a/b?c"), &url("/")));
    assert!(!same_origin(
      &Url::parse("http://app.example.com/").unwrap(),
      &url("/")
    ));
    assert!(!same_origin(
      &Url::parse("https://app.example.com:8443/").unwrap(),
      &url("/")
    ));
  }
}
