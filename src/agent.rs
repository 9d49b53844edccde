//! The long-lived agent instance tying the cache, outbox and background work together.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, GenerationRecord, Served, SqliteStorage};
use crate::config::Config;
use crate::connectivity::{self, Connectivity};
use crate::db::Database;
use crate::error::AgentResult;
use crate::event::{AgentEvent, EventBus};
use crate::intercept::Interceptor;
use crate::lifecycle::{InstallOutcome, LifecycleManager};
use crate::network::{HttpNetwork, Network, Request};
use crate::notify::{self, Notification, NotificationAction};
use crate::outbox::{Outbox, OutboxId, OutboxRecord};
use crate::sync::{
  refresh_generation, DrainReport, DrainTrigger, HttpRemote, RefreshReport, Remote, SyncDispatcher,
};

/// Production agent: reqwest for both interception and delivery.
pub type HttpAgent = Agent<HttpNetwork, HttpRemote<HttpNetwork>>;

#[derive(Debug, Clone, Copy)]
struct Intervals {
  sync: Duration,
  refresh: Duration,
  probe: Duration,
}

/// Snapshot of agent state for the host.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub online: bool,
  pub active: Option<String>,
  pub waiting: Option<String>,
  pub pending: usize,
  pub generations: Vec<GenerationSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
  pub tag: String,
  pub state: &'static str,
  pub entries: usize,
}

impl From<GenerationRecord> for GenerationSummary {
  fn from(record: GenerationRecord) -> Self {
    Self {
      tag: record.tag,
      state: record.state.as_str(),
      entries: record.entries,
    }
  }
}

pub struct Agent<N: Network, R: Remote> {
  version: String,
  manifest: Vec<Url>,
  origin: Url,
  probe_url: Url,
  timeout: Duration,
  intervals: Intervals,
  network: Arc<N>,
  storage: Arc<SqliteStorage>,
  outbox: Outbox,
  lifecycle: Arc<LifecycleManager<SqliteStorage>>,
  interceptor: Interceptor<N, SqliteStorage>,
  dispatcher: Arc<SyncDispatcher<R>>,
  connectivity: Connectivity,
  events: EventBus,
}

impl HttpAgent {
  /// Open the agent's database and build the reqwest-backed network and remote.
  pub fn open(config: &Config) -> Result<Self> {
    let path = config.database_path()?;
    let db = Database::open(&path)?;
    info!(path = %path.display(), "opened agent database");

    let network = Arc::new(
      HttpNetwork::new(config.timeout()).map_err(|e| eyre!("Failed to create HTTP client: {}", e))?,
    );
    let remote = Arc::new(HttpRemote::new(
      network.clone(),
      config.sync_endpoint()?,
      config.timeout(),
    ));

    Self::with_parts(config, db, network, remote)
  }
}

impl<N: Network, R: Remote> Agent<N, R> {
  pub fn with_parts(config: &Config, db: Database, network: Arc<N>, remote: Arc<R>) -> Result<Self> {
    let events = EventBus::default();
    // Optimistic until the first probe says otherwise
    let connectivity = Connectivity::new(true, events.clone());

    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let lifecycle = Arc::new(
      LifecycleManager::open(storage.clone(), events.clone())
        .map_err(|e| eyre!("Failed to load cache generations: {}", e))?,
    );
    let outbox = Outbox::new(db);

    let origin = config.origin_url()?;
    let mut interceptor = Interceptor::new(
      network.clone(),
      storage.clone(),
      lifecycle.clone(),
      origin.clone(),
      config.timeout(),
    );
    if let Some(offline) = config.offline_fallback_url()? {
      interceptor = interceptor.with_offline_fallback(&offline);
    }

    let dispatcher = Arc::new(SyncDispatcher::new(
      outbox.clone(),
      remote,
      connectivity.clone(),
      events.clone(),
    ));

    Ok(Self {
      version: config.version.clone(),
      manifest: config.manifest_urls()?,
      origin,
      probe_url: config.probe_url()?,
      timeout: config.timeout(),
      intervals: Intervals {
        sync: Duration::from_secs(config.sync.interval_secs.max(1)),
        refresh: Duration::from_secs(config.refresh.interval_secs.max(1)),
        probe: Duration::from_secs(config.probe.interval_secs.max(1)),
      },
      network,
      storage,
      outbox,
      lifecycle,
      interceptor,
      dispatcher,
      connectivity,
      events,
    })
  }

  /// Take the platform's current connectivity and install the configured generation.
  ///
  /// An install failure is not fatal: the previous generation keeps serving.
  pub async fn start(&self) {
    self.probe().await;

    if let Err(e) = self.install().await {
      warn!(error = %e, "configured generation not installed");
    }
  }

  /// Install the configured version.
  pub async fn install(&self) -> AgentResult<InstallOutcome> {
    self.install_tag(&self.version).await
  }

  pub async fn install_tag(&self, tag: &str) -> AgentResult<InstallOutcome> {
    self
      .lifecycle
      .install(tag, &self.manifest, self.network.as_ref(), self.timeout)
      .await
  }

  /// Host's "activate now" signal.
  pub fn activate_now(&self) -> AgentResult<Option<String>> {
    self.lifecycle.skip_waiting()
  }

  /// Intercept an outbound request.
  pub async fn fetch(&self, request: Request) -> AgentResult<Served> {
    self.interceptor.fetch(request).await
  }

  /// Queue a write for delivery. Durable once this returns.
  pub fn enqueue(&self, payload: &Value) -> AgentResult<OutboxId> {
    let id = self.outbox.enqueue(payload)?;
    self.events.emit(AgentEvent::PendingCount {
      count: self.outbox.len()?,
    });
    self.dispatcher.trigger();
    Ok(id)
  }

  pub fn pending(&self) -> AgentResult<Vec<OutboxRecord>> {
    self.outbox.list()
  }

  pub fn pending_count(&self) -> AgentResult<usize> {
    self.outbox.len()
  }

  /// Host's background-sync signal: wake the running dispatcher.
  pub fn request_sync(&self) {
    self.dispatcher.trigger();
  }

  /// Run one drain pass in the caller's task.
  pub async fn drain(&self) -> AgentResult<DrainReport> {
    self.dispatcher.drain(DrainTrigger::BackgroundSync).await
  }

  /// Refetch every entry of the active generation. `None` when nothing is active.
  pub async fn refresh(&self) -> AgentResult<Option<RefreshReport>> {
    let Some(tag) = self.lifecycle.active_tag() else {
      return Ok(None);
    };

    let report = refresh_generation(
      self.network.as_ref(),
      self.storage.as_ref(),
      &tag,
      &self.origin,
      self.timeout,
    )
    .await?;
    Ok(Some(report))
  }

  /// Render an inbound push message.
  pub fn push(&self, payload: &[u8]) -> Notification {
    let notification = notify::from_push(payload);
    self.events.emit(AgentEvent::NotificationShown {
      notification: notification.clone(),
    });
    notification
  }

  /// Handle a click on a previously shown notification.
  pub fn notification_action(
    &self,
    notification: &Notification,
    action: NotificationAction,
  ) -> AgentEvent {
    let event = notify::handle_click(notification, action);
    self.events.emit(event.clone());
    event
  }

  pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
    self.events.subscribe()
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Feed a platform online/offline signal.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_online(online);
  }

  /// Probe the origin and record the result.
  pub async fn probe(&self) {
    let online = connectivity::probe(self.network.as_ref(), &self.probe_url, self.timeout).await;
    self.connectivity.set_online(online);
  }

  pub fn status(&self) -> AgentResult<Status> {
    Ok(Status {
      online: self.connectivity.is_online(),
      active: self.lifecycle.active_tag(),
      waiting: self.lifecycle.waiting_tag(),
      pending: self.outbox.len()?,
      generations: self
        .storage
        .generations()?
        .into_iter()
        .map(GenerationSummary::from)
        .collect(),
    })
  }

  /// Drive the timers until shutdown: drain, cache refresh and connectivity probe.
  pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
    let dispatcher = tokio::spawn(
      self
        .dispatcher
        .clone()
        .run(self.intervals.sync, shutdown.clone()),
    );

    let start = tokio::time::Instant::now();
    let mut refresh = tokio::time::interval_at(start + self.intervals.refresh, self.intervals.refresh);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probe = tokio::time::interval_at(start + self.intervals.probe, self.intervals.probe);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // At most one sweep at a time, off the timer loop
    let mut sweep: Option<tokio::task::JoinHandle<()>> = None;

    loop {
      tokio::select! {
        _ = refresh.tick() => {
          if sweep.as_ref().is_some_and(|running| !running.is_finished()) {
            debug!("previous cache refresh still running");
          } else {
            let agent = Arc::clone(&self);
            sweep = Some(tokio::spawn(async move {
              if let Err(e) = agent.refresh().await {
                warn!(error = %e, "cache refresh aborted");
              }
            }));
          }
        }
        _ = probe.tick() => self.probe().await,
        _ = shutdown.changed() => break,
      }
    }

    if let Some(sweep) = sweep {
      sweep.abort();
    }
    if let Err(e) = dispatcher.await {
      warn!(error = %e, "dispatcher task failed");
    }
    info!("agent stopped");
  }
}
