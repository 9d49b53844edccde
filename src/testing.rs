//! Scripted network and remote doubles shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::error::{AgentError, AgentResult};
use crate::network::{Network, Request, Response};
use crate::outbox::OutboxRecord;
use crate::sync::Remote;

#[derive(Clone)]
enum Route {
  Respond(Response),
  Delayed(Duration, Response),
  Fail,
  Hang,
}

/// In-memory network keyed by method and URL.
///
/// Unrouted requests get a 404; while offline every request fails.
pub struct MockNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<(String, String), Route>>,
  requests: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      requests: Mutex::new(Vec::new()),
    }
  }

  fn key(method: &str, url: &str) -> (String, String) {
    (method.to_uppercase(), Url::parse(url).unwrap().to_string())
  }

  pub fn respond(&self, method: &str, url: &str, status: u16, body: &str) {
    let response = Response {
      status,
      headers: vec![("content-type".into(), "text/plain".into())],
      body: body.as_bytes().to_vec(),
      url: Url::parse(url).unwrap(),
    };
    self.respond_with(method, url, response);
  }

  /// Answer only after `delay`
  pub fn respond_after(&self, method: &str, url: &str, delay: Duration, status: u16, body: &str) {
    let response = Response {
      status,
      headers: Vec::new(),
      body: body.as_bytes().to_vec(),
      url: Url::parse(url).unwrap(),
    };
    self
      .routes
      .lock()
      .unwrap()
      .insert(Self::key(method, url), Route::Delayed(delay, response));
  }

  pub fn respond_with(&self, method: &str, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(Self::key(method, url), Route::Respond(response));
  }

  pub fn fail(&self, method: &str, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(Self::key(method, url), Route::Fail);
  }

  /// Never answer, to exercise bounded waits
  pub fn hang(&self, method: &str, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(Self::key(method, url), Route::Hang);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Every request seen, as "METHOD url"
  pub fn calls(&self) -> Vec<String> {
    self
      .requests()
      .iter()
      .map(|request| format!("{} {}", request.method, request.url))
      .collect()
  }

  /// Every request seen, headers and body included
  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> AgentResult<Response> {
    self.requests.lock().unwrap().push(request.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(AgentError::Network("offline".into()));
    }

    let route = self
      .routes
      .lock()
      .unwrap()
      .get(&(request.method.clone(), request.url.to_string()))
      .cloned();

    match route {
      Some(Route::Respond(response)) => Ok(response),
      Some(Route::Delayed(delay, response)) => {
        tokio::time::sleep(delay).await;
        Ok(response)
      }
      Some(Route::Fail) => Err(AgentError::Network("connection refused".into())),
      Some(Route::Hang) => {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(AgentError::Network("hung".into()))
      }
      None => Ok(Response {
        status: 404,
        headers: Vec::new(),
        body: Vec::new(),
        url: request.url.clone(),
      }),
    }
  }
}

/// Remote endpoint that accepts or rejects deliveries from a script.
///
/// Scripted outcomes are consumed in order; once exhausted every delivery succeeds.
pub struct ScriptedRemote {
  script: Mutex<VecDeque<bool>>,
  received: Mutex<Vec<serde_json::Value>>,
  attempts: Mutex<Vec<i64>>,
}

impl ScriptedRemote {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      received: Mutex::new(Vec::new()),
      attempts: Mutex::new(Vec::new()),
    }
  }

  pub fn then_accept(&self) {
    self.script.lock().unwrap().push_back(true);
  }

  pub fn then_reject(&self) {
    self.script.lock().unwrap().push_back(false);
  }

  /// Payloads acknowledged, in arrival order
  pub fn received(&self) -> Vec<serde_json::Value> {
    self.received.lock().unwrap().clone()
  }

  /// Record ids of every attempt, accepted or not
  pub fn attempts(&self) -> Vec<i64> {
    self.attempts.lock().unwrap().clone()
  }
}

#[async_trait]
impl Remote for ScriptedRemote {
  async fn deliver(&self, record: &OutboxRecord) -> AgentResult<()> {
    self.attempts.lock().unwrap().push(record.id);

    let accept = self.script.lock().unwrap().pop_front().unwrap_or(true);
    if accept {
      self.received.lock().unwrap().push(record.payload.clone());
      Ok(())
    } else {
      Err(AgentError::Delivery {
        id: record.id,
        reason: "503 Service Unavailable".into(),
      })
    }
  }
}
