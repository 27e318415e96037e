use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use readersync::config::{Config, LoggingConfig};
use readersync::engine::{parse_payload, Collaborators, Engine};
use readersync::event::SyncEvent;
use readersync::lifecycle::{ClientView, ClientWindows, Notification, NotificationSink};
use readersync::queue::MutationKind;
use readersync::transport::{HttpTransport, Request, ResourceFetcher};

#[derive(Parser, Debug)]
#[command(name = "readersync")]
#[command(about = "Offline-first request cache and mutation sync for the reader client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/readersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Start with connectivity marked offline
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Queue a mutation of any kind
  Enqueue {
    /// reading_progress, bookmark or settings
    #[arg(short, long)]
    kind: MutationKind,
    payload: String,
  },
  /// Queue a reading progress update for a book
  Progress { book_id: String, payload: String },
  /// Queue a bookmark change for a book
  Bookmark { book_id: String, payload: String },
  /// Queue a settings change
  Settings { payload: String },
  /// Drain the queue now
  Flush,
  /// Show queue and sync status
  Status,
  /// Drop every pending mutation
  Clear,
  /// Precache and activate the configured cache generation
  Install,
  /// Resolve a URL through the cache
  Fetch { url: Url },
  /// Show a notification for a push payload
  Push { payload: String },
  /// Sync in the background until Ctrl+C, printing events
  Watch,
}

/// Prints notifications to stdout.
struct ConsoleNotifier;

impl NotificationSink for ConsoleNotifier {
  fn show(&self, notification: &Notification) {
    match serde_json::to_string_pretty(notification) {
      Ok(json) => println!("{}", json),
      Err(_) => println!("{}: {}", notification.title, notification.body),
    }
  }
}

/// A terminal has no client views to focus; opening just reports the target.
struct ConsoleWindows;

impl ClientWindows for ConsoleWindows {
  fn clients(&self) -> Vec<ClientView> {
    Vec::new()
  }

  fn focus(&self, _id: &str) -> bool {
    false
  }

  fn open(&self, url: &str) {
    println!("open {}", url);
  }
}

fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("readersync=info"));

  match &config.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "readersync.log"));
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if args.offline {
    config.sync.start_online = false;
  }

  let _log_guard = init_logging(&config.logging)?;

  let transport = Arc::new(
    HttpTransport::new(config.api_base()?, Config::get_api_token(), config.timeout())
      .map_err(|e| eyre!("Failed to set up HTTP transport: {}", e))?,
  );
  let collaborators = Collaborators {
    fetcher: transport.clone(),
    dispatcher: transport.clone(),
    notifier: Arc::new(ConsoleNotifier),
    windows: Arc::new(ConsoleWindows),
  };

  let engine = Engine::init(&config, collaborators)?;
  let result = run(&engine, transport.as_ref(), args.command).await;
  engine.shutdown().await;
  result
}

async fn run(engine: &Engine, transport: &HttpTransport, command: Cmd) -> Result<()> {
  let orchestrator = engine.orchestrator();

  match command {
    Cmd::Enqueue { kind, payload } => {
      report_queued(orchestrator.enqueue(kind, parse_payload(&payload)?))
    }
    Cmd::Progress { book_id, payload } => {
      report_queued(orchestrator.sync_reading_progress(&book_id, parse_payload(&payload)?))
    }
    Cmd::Bookmark { book_id, payload } => {
      report_queued(orchestrator.sync_bookmark(&book_id, parse_payload(&payload)?))
    }
    Cmd::Settings { payload } => {
      report_queued(orchestrator.sync_settings(parse_payload(&payload)?))
    }
    Cmd::Flush => {
      let outcome = orchestrator.flush().await;
      println!("{:?}", outcome);
      Ok(())
    }
    Cmd::Status => {
      println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
      println!("cache generation: {}", engine.cache().active_generation());
      println!("worker: {:?}", engine.worker().state());
      Ok(())
    }
    Cmd::Clear => {
      let dropped = orchestrator.clear_queue()?;
      println!("dropped {} pending mutations", dropped);
      Ok(())
    }
    Cmd::Install => {
      let cached = engine.install().await?;
      println!(
        "generation {} active, {} resources cached",
        engine.worker().generation(),
        cached
      );
      Ok(())
    }
    Cmd::Fetch { url } => {
      let request = Request::get(url);
      match engine.worker().handle_fetch(&request).await {
        Some(result) => {
          println!(
            "{} {:?} ({} bytes)",
            result.data.status,
            result.source,
            result.data.body.len()
          );
          println!("{}", String::from_utf8_lossy(&result.data.body));
        }
        None => {
          info!(url = %request.url(), "Not intercepted, going to the network");
          let response = transport.fetch(&request).await?;
          println!("{} Network ({} bytes)", response.status, response.body.len());
          println!("{}", String::from_utf8_lossy(&response.body));
        }
      }
      Ok(())
    }
    Cmd::Push { payload } => {
      if engine.worker().on_push(payload.as_bytes()).is_none() {
        println!("nothing to show");
      }
      Ok(())
    }
    Cmd::Watch => watch(engine).await,
  }
}

fn report_queued(id: Option<readersync::queue::MutationId>) -> Result<()> {
  match id {
    Some(id) => {
      println!("queued {}", id);
      Ok(())
    }
    None => Err(eyre!("Mutation could not be persisted, see log for details")),
  }
}

async fn watch(engine: &Engine) -> Result<()> {
  let mut events = engine.subscribe();
  engine.start();
  engine.orchestrator().request_flush();
  println!("watching, Ctrl+C to stop");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.next() => match event {
        Some(event) => print_event(&event),
        None => break,
      },
    }
  }

  Ok(())
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::ItemSynced(record) => println!("{} {} {}", event.topic(), record.kind, record.id),
    SyncEvent::ItemFailed(failure) => println!("{} {}", event.topic(), failure),
    SyncEvent::DrainStart { pending } => println!("{} pending={}", event.topic(), pending),
    SyncEvent::DrainComplete(summary) => println!(
      "{} synced={} failed={} pending={}",
      event.topic(),
      summary.synced,
      summary.failed,
      summary.pending
    ),
    SyncEvent::DrainError(reason) => println!("{} {}", event.topic(), reason),
    SyncEvent::BecameOnline | SyncEvent::BecameOffline => println!("{}", event.topic()),
  }
}
