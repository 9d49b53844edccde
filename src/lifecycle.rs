//! Cache generation lifecycle.
//!
//! A generation moves `Installing → Waiting → Active → Superseded`. Install
//! seeds the manifest all-or-nothing; cutover happens once no request is being
//! served by the older generation, or immediately on [`LifecycleManager::skip_waiting`].

use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, StoredResponse};
use crate::error::{AgentError, AgentResult};
use crate::event::{AgentEvent, EventBus};
use crate::network::{Network, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Installing,
  Waiting,
  Active,
  Superseded,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      GenerationState::Installing => "installing",
      GenerationState::Waiting => "waiting",
      GenerationState::Active => "active",
      GenerationState::Superseded => "superseded",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "installing" => Some(GenerationState::Installing),
      "waiting" => Some(GenerationState::Waiting),
      "active" => Some(GenerationState::Active),
      "superseded" => Some(GenerationState::Superseded),
      _ => None,
    }
  }
}

/// How an install request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  /// The tag already serves traffic; nothing was fetched
  AlreadyActive,
  /// Installed and took over immediately
  Activated,
  /// Installed; cutover deferred until the older generation goes idle
  Waiting,
}

#[derive(Debug, Default)]
struct Inner {
  active: Option<String>,
  waiting: Option<String>,
  installing: Option<String>,
  /// Requests currently being served by the active generation
  in_flight: usize,
  cleanup_pending: bool,
  /// Host asked for a takeover while an install was still running
  skip_waiting_requested: bool,
}

pub struct LifecycleManager<S: CacheStorage> {
  storage: Arc<S>,
  events: EventBus,
  inner: Mutex<Inner>,
  install_lock: tokio::sync::Mutex<()>,
}

impl<S: CacheStorage> LifecycleManager<S> {
  /// Load the persisted active generation and discard every other one.
  pub fn open(storage: Arc<S>, events: EventBus) -> AgentResult<Self> {
    let active = storage.active_generation()?;

    let manager = Self {
      storage,
      events,
      inner: Mutex::new(Inner {
        active: active.clone(),
        cleanup_pending: true,
        ..Default::default()
      }),
      install_lock: tokio::sync::Mutex::new(()),
    };

    {
      let mut inner = manager.inner.lock()?;
      match active {
        Some(tag) => {
          info!(tag = %tag, "resuming active generation");
          manager.cleanup(&mut inner, &tag);
        }
        None => manager.discard_all_generations(&mut inner),
      }
    }

    Ok(manager)
  }

  pub fn active_tag(&self) -> Option<String> {
    self.inner.lock().ok().and_then(|inner| inner.active.clone())
  }

  pub fn waiting_tag(&self) -> Option<String> {
    self.inner.lock().ok().and_then(|inner| inner.waiting.clone())
  }

  /// Mark a request as served by the active generation until the guard drops.
  ///
  /// Returns `None` when no generation is active yet.
  pub fn begin_serving(self: &Arc<Self>) -> Option<ServeGuard<S>> {
    let mut inner = self.inner.lock().ok()?;
    let tag = inner.active.clone()?;
    inner.in_flight += 1;

    Some(ServeGuard {
      manager: Arc::clone(self),
      tag,
    })
  }

  fn finish_serving(self: &Arc<Self>) {
    let cutover = {
      let Ok(mut inner) = self.inner.lock() else {
        return;
      };
      inner.in_flight = inner.in_flight.saturating_sub(1);
      inner.in_flight == 0 && inner.waiting.is_some()
    };
    if !cutover {
      return;
    }

    let manager = Arc::clone(self);
    match tokio::runtime::Handle::try_current() {
      // Activation and cleanup hit SQLite; keep them off the async workers
      Ok(handle) => {
        handle.spawn_blocking(move || manager.cutover_if_idle());
      }
      Err(_) => manager.cutover_if_idle(),
    }
  }

  /// Activate the waiting generation unless a request started serving meanwhile.
  fn cutover_if_idle(&self) {
    let Ok(mut inner) = self.inner.lock() else {
      return;
    };
    if inner.in_flight > 0 {
      return;
    }
    let Some(tag) = inner.waiting.clone() else {
      return;
    };

    debug!(tag = %tag, "older generation idle, cutting over");
    if let Err(e) = self.activate(&mut inner, &tag) {
      warn!(tag = %tag, error = %e, "deferred activation failed");
    }
  }

  /// Install a generation under `tag`, seeding it from `manifest`.
  ///
  /// Any manifest failure aborts the install and leaves the current active
  /// generation untouched.
  pub async fn install<N: Network>(
    &self,
    tag: &str,
    manifest: &[Url],
    network: &N,
    timeout: Duration,
  ) -> AgentResult<InstallOutcome> {
    let _installing = self.install_lock.lock().await;

    {
      let mut inner = self.inner.lock()?;
      if inner.active.as_deref() == Some(tag) {
        debug!(tag, "generation already active");
        return Ok(InstallOutcome::AlreadyActive);
      }
      if inner.waiting.as_deref() == Some(tag) {
        debug!(tag, "generation already installed and waiting");
        return Ok(InstallOutcome::Waiting);
      }
      inner.installing = Some(tag.to_string());
    }

    info!(tag, resources = manifest.len(), "installing generation");

    if let Err(e) = self.stage(tag, manifest, network, timeout).await {
      warn!(tag, error = %e, "install failed, keeping current generation");
      if let Err(cleanup) = self.storage.delete_generation(tag) {
        warn!(tag, error = %cleanup, "failed to discard aborted generation");
      }
      let mut inner = self.inner.lock()?;
      inner.installing = None;
      inner.skip_waiting_requested = false;
      self.retry_cleanup(&mut inner);

      return Err(AgentError::Install {
        tag: tag.to_string(),
        reason: e.to_string(),
      });
    }

    let mut inner = self.inner.lock()?;
    inner.installing = None;
    let forced = std::mem::take(&mut inner.skip_waiting_requested);

    if let Some(previous) = inner.waiting.replace(tag.to_string()) {
      debug!(tag = %previous, "replacing waiting generation");
      if let Err(e) = self.storage.delete_generation(&previous) {
        warn!(tag = %previous, error = %e, "failed to discard replaced generation");
        inner.cleanup_pending = true;
      }
    }

    if forced {
      info!(tag, "takeover was requested during install");
    }
    if inner.active.is_none() || inner.in_flight == 0 || forced {
      self.activate(&mut inner, tag)?;
      return Ok(InstallOutcome::Activated);
    }

    info!(tag, in_flight = inner.in_flight, "generation waiting for cutover");
    self.retry_cleanup(&mut inner);
    self
      .events
      .emit(AgentEvent::UpdateAvailable {
        tag: tag.to_string(),
      });
    Ok(InstallOutcome::Waiting)
  }

  /// Activate the waiting generation now, without waiting for in-flight requests.
  ///
  /// Returns the activated tag, or `None` if nothing was waiting. A request
  /// made while an install is running applies as soon as that install succeeds.
  pub fn skip_waiting(&self) -> AgentResult<Option<String>> {
    let mut inner = self.inner.lock()?;
    let Some(tag) = inner.waiting.clone() else {
      if let Some(installing) = inner.installing.clone() {
        info!(tag = %installing, "takeover requested, applying once install finishes");
        inner.skip_waiting_requested = true;
      }
      return Ok(None);
    };

    info!(tag = %tag, "forced cutover");
    self.activate(&mut inner, &tag)?;
    Ok(Some(tag))
  }

  /// Fetch the manifest and write it into a fresh generation in one transaction.
  async fn stage<N: Network>(
    &self,
    tag: &str,
    manifest: &[Url],
    network: &N,
    timeout: Duration,
  ) -> AgentResult<()> {
    self
      .storage
      .set_generation_state(tag, GenerationState::Installing)?;

    let entries = try_join_all(
      manifest
        .iter()
        .map(|url| fetch_manifest_entry(network, url, timeout)),
    )
    .await?;

    self.storage.put_many(tag, &entries)?;
    self
      .storage
      .set_generation_state(tag, GenerationState::Waiting)?;

    Ok(())
  }

  fn activate(&self, inner: &mut Inner, tag: &str) -> AgentResult<()> {
    // Single transaction: either the new tag is active or nothing changed
    self.storage.activate_generation(tag)?;

    let previous = inner.active.replace(tag.to_string());
    inner.waiting = None;
    info!(tag, previous = ?previous, "generation activated");
    self.events.emit(AgentEvent::Activated {
      tag: tag.to_string(),
    });

    self.cleanup(inner, tag);
    Ok(())
  }

  /// Delete everything not belonging to `active`. Best-effort; retried later on failure.
  fn cleanup(&self, inner: &mut Inner, active: &str) {
    if inner.installing.is_some() {
      // An install is writing its own generation; sweep once it finishes
      inner.cleanup_pending = true;
      return;
    }

    match self.storage.delete_all_except(active) {
      Ok(removed) => {
        if removed > 0 {
          info!(tag = active, removed, "removed superseded cache entries");
        }
        inner.cleanup_pending = false;
      }
      Err(e) => {
        warn!(tag = active, error = %e, "stale generation cleanup failed, will retry");
        inner.cleanup_pending = true;
      }
    }
  }

  fn retry_cleanup(&self, inner: &mut Inner) {
    if !inner.cleanup_pending {
      return;
    }
    let Some(active) = inner.active.clone() else {
      return;
    };

    // Keep a waiting generation alive across the sweep
    if inner.waiting.is_some() {
      return;
    }
    self.cleanup(inner, &active);
  }

  fn discard_all_generations(&self, inner: &mut Inner) {
    match self.storage.generations() {
      Ok(generations) => {
        for generation in generations {
          if let Err(e) = self.storage.delete_generation(&generation.tag) {
            warn!(tag = %generation.tag, error = %e, "failed to discard generation");
            return;
          }
        }
        inner.cleanup_pending = false;
      }
      Err(e) => warn!(error = %e, "failed to list generations"),
    }
  }
}

/// Held while a request is served by a generation.
pub struct ServeGuard<S: CacheStorage> {
  manager: Arc<LifecycleManager<S>>,
  tag: String,
}

impl<S: CacheStorage> ServeGuard<S> {
  pub fn tag(&self) -> &str {
    &self.tag
  }
}

impl<S: CacheStorage> Drop for ServeGuard<S> {
  fn drop(&mut self) {
    self.manager.finish_serving();
  }
}

async fn fetch_manifest_entry<N: Network>(
  network: &N,
  url: &Url,
  timeout: Duration,
) -> AgentResult<StoredResponse> {
  let request = Request::get(url.clone());

  let response = tokio::time::timeout(timeout, network.fetch(&request))
    .await
    .map_err(|_| AgentError::Timeout(timeout))??;

  if response.status != 200 {
    return Err(AgentError::Network(format!(
      "GET {} returned {}",
      url, response.status
    )));
  }

  Ok(StoredResponse::capture(&request, &response))
}
