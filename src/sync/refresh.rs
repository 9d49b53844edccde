//! Periodic refresh of the active generation.

use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Fingerprint, StoredResponse};
use crate::error::AgentResult;
use crate::intercept::is_cacheable;
use crate::network::Network;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
  pub refreshed: usize,
  /// Entries left stale because the refetch failed
  pub failed: usize,
}

/// Refetch every entry of generation `tag`, overwriting those that come back cacheable.
///
/// A failing entry keeps its stale copy and the sweep moves on.
pub async fn refresh_generation<N: Network, S: CacheStorage>(
  network: &N,
  storage: &S,
  tag: &str,
  origin: &Url,
  timeout: Duration,
) -> AgentResult<RefreshReport> {
  let requests = storage.list_requests(tag)?;
  let mut report = RefreshReport::default();

  for request in requests {
    let fingerprint = Fingerprint::from_request(&request);

    let response = match tokio::time::timeout(timeout, network.fetch(&request)).await {
      Ok(Ok(response)) if is_cacheable(&request, &response, origin) => response,
      Ok(Ok(response)) => {
        debug!(fingerprint = %fingerprint, status = response.status, "refresh not cacheable, keeping stale entry");
        report.failed += 1;
        continue;
      }
      Ok(Err(e)) => {
        debug!(fingerprint = %fingerprint, error = %e, "refresh failed, keeping stale entry");
        report.failed += 1;
        continue;
      }
      Err(_) => {
        debug!(fingerprint = %fingerprint, "refresh timed out, keeping stale entry");
        report.failed += 1;
        continue;
      }
    };

    match storage.put(tag, &StoredResponse::capture(&request, &response)) {
      Ok(()) => report.refreshed += 1,
      Err(e) => {
        warn!(fingerprint = %fingerprint, error = %e, "failed to store refreshed entry");
        report.failed += 1;
      }
    }
  }

  info!(tag, refreshed = report.refreshed, failed = report.failed, "cache refresh finished");
  Ok(report)
}
