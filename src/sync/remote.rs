//! Delivery of outbox records to the remote endpoint.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{AgentError, AgentResult};
use crate::network::{Network, Request};
use crate::outbox::OutboxRecord;

/// The endpoint that receives queued writes.
///
/// `Ok` means the remote acknowledged the record; anything else is a delivery
/// failure to retry on a later drain.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
  async fn deliver(&self, record: &OutboxRecord) -> AgentResult<()>;
}

/// Posts each record's payload as JSON to a fixed endpoint.
///
/// The record id travels as `Idempotency-Key` so the endpoint can drop
/// redeliveries.
pub struct HttpRemote<N: Network> {
  network: Arc<N>,
  endpoint: Url,
  timeout: Duration,
}

impl<N: Network> HttpRemote<N> {
  pub fn new(network: Arc<N>, endpoint: Url, timeout: Duration) -> Self {
    Self {
      network,
      endpoint,
      timeout,
    }
  }
}

#[async_trait]
impl<N: Network> Remote for HttpRemote<N> {
  async fn deliver(&self, record: &OutboxRecord) -> AgentResult<()> {
    let request = Request::new("POST", self.endpoint.clone())
      .with_header("Content-Type", "application/json")
      .with_header("Idempotency-Key", &record.id.to_string())
      .with_body(serde_json::to_vec(&record.payload)?);

    let failed = |reason: String| AgentError::Delivery {
      id: record.id,
      reason,
    };

    let response = match tokio::time::timeout(self.timeout, self.network.fetch(&request)).await {
      Ok(Ok(response)) => response,
      Ok(Err(e)) => return Err(failed(e.to_string())),
      Err(_) => return Err(failed(format!("no answer within {:?}", self.timeout))),
    };

    if !response.is_success() {
      return Err(failed(format!("remote answered {}", response.status)));
    }

    debug!(id = record.id, status = response.status, "record acknowledged");
    Ok(())
  }
}
