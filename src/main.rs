mod commands;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offsync::network::Request;
use offsync::notify::NotificationAction;
use offsync::{Config, HttpAgent};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};
use url::Url;

use commands::HostCommand;

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline proxy and durable sync agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offsync.yaml or $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Run the agent: host commands on stdin, JSON events on stdout
  Serve,
  /// Install a cache generation (defaults to the configured version)
  Install {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Fetch a URL through the agent and write the body to stdout
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Mark the request as an HTML navigation
    #[arg(long)]
    html: bool,
  },
  /// Queue a JSON payload for delivery
  Enqueue { payload: String },
  /// List pending outbox records
  Outbox,
  /// Deliver pending records now
  Drain,
  /// Refresh every entry of the active generation
  Refresh,
  /// Render a push payload and print the notification
  Push { payload: String },
  /// Print agent status
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = init_tracing(&config.data_dir()?.join("logs"))?;

  let agent = Arc::new(HttpAgent::open(&config)?);

  match args.command {
    Cmd::Serve => serve(agent).await?,
    Cmd::Install { tag } => {
      let tag = tag.unwrap_or_else(|| config.version.clone());
      let outcome = agent.install_tag(&tag).await?;
      println!("{}: {:?}", tag, outcome);
    }
    Cmd::Fetch { url, method, html } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid url '{}': {}", url, e))?;
      let mut request = Request::new(&method, url);
      if html {
        request = request.with_header("Accept", "text/html");
      }

      let served = agent.fetch(request).await?;
      eprintln!("{} ({:?})", served.response.status, served.source);
      std::io::stdout().write_all(&served.response.body)?;
    }
    Cmd::Enqueue { payload } => {
      let payload =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let id = agent.enqueue(&payload)?;
      println!("{}", id);
    }
    Cmd::Outbox => {
      println!("{}", serde_json::to_string_pretty(&agent.pending()?)?);
    }
    Cmd::Drain => {
      agent.probe().await;
      let report = agent.drain().await?;
      println!(
        "{:?}: delivered {}, remaining {}",
        report.outcome, report.delivered, report.remaining
      );
    }
    Cmd::Refresh => match agent.refresh().await? {
      Some(report) => println!(
        "refreshed {}, failed {}",
        report.refreshed, report.failed
      ),
      None => println!("no active generation"),
    },
    Cmd::Push { payload } => {
      let notification = agent.push(payload.as_bytes());
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Cmd::Status => {
      println!("{}", serde_json::to_string_pretty(&agent.status()?)?);
    }
  }

  Ok(())
}

/// Log to a daily file under `log_dir`, with warnings mirrored to stderr.
fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "offsync.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offsync=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN),
    )
    .init();

  Ok(guard)
}

/// Long-running mode: the host drives the agent over stdin and listens on stdout.
async fn serve(agent: Arc<HttpAgent>) -> Result<()> {
  let mut events = agent.subscribe();
  let printer = tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(event) => {
          if let Err(e) = write_json_line(&mut std::io::stdout().lock(), &event) {
            warn!(error = %e, "host stopped reading events");
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "host fell behind, events dropped")
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });

  agent.start().await;

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let runner = tokio::spawn(agent.clone().run(shutdown_rx));
  info!("agent running");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line? else {
          break;
        };
        if line.trim().is_empty() {
          continue;
        }

        match commands::parse_line(&line) {
          Ok(HostCommand::Quit) => break,
          Ok(command) => handle_command(&agent, command).await,
          Err(e) => warn!(line = %line, error = %e, "rejected host command"),
        }
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  let _ = shutdown_tx.send(true);
  runner
    .await
    .map_err(|e| eyre!("Agent task failed: {}", e))?;
  printer.abort();

  Ok(())
}

async fn handle_command(agent: &HttpAgent, command: HostCommand) {
  match command {
    HostCommand::Activate => match agent.activate_now() {
      Ok(Some(tag)) => info!(tag = %tag, "activated on host request"),
      Ok(None) => info!("no generation waiting yet"),
      Err(e) => warn!(error = %e, "activation failed"),
    },
    HostCommand::Enqueue(payload) => {
      if let Err(e) = agent.enqueue(&payload) {
        warn!(error = %e, "enqueue failed");
      }
    }
    HostCommand::Sync => agent.request_sync(),
    HostCommand::Refresh => {
      if let Err(e) = agent.refresh().await {
        warn!(error = %e, "refresh failed");
      }
    }
    HostCommand::Push(payload) => {
      agent.push(&payload);
    }
    HostCommand::Click(notification) => {
      agent.notification_action(&notification, NotificationAction::Open);
    }
    HostCommand::Dismiss(notification) => {
      agent.notification_action(&notification, NotificationAction::Dismiss);
    }
    HostCommand::Online(online) => agent.set_online(online),
    HostCommand::Status => match agent.status() {
      Ok(status) => {
        if let Err(e) = write_json_line(&mut std::io::stdout().lock(), &status) {
          warn!(error = %e, "failed to write status");
        }
      }
      Err(e) => warn!(error = %e, "status unavailable"),
    },
    HostCommand::Quit => {}
  }
}

/// Write `value` as one line of JSON. A closed pipe surfaces as an error.
fn write_json_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
  serde_json::to_writer(&mut *out, value)?;
  out.write_all(b"\n")?;
  out.flush()?;
  Ok(())
}
