mod cache;
mod classify;
mod clients;
mod config;
mod control;
mod http;
mod lifecycle;
mod network;
mod push;
mod strategy;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{CacheRegistry, SqliteStorage};
use clients::PageSet;
use control::ControlMessage;
use http::{Destination, Request};
use lifecycle::{Command, Continuation, Worker};
use network::HttpNetwork;
use push::Notification;
use strategy::Outcome;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline caching layer for installable web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Deployed version tag, overriding the config file
  #[arg(long, global = true)]
  app_version: Option<String>,

  /// Log more (-v info, -vv debug); RUST_LOG takes precedence
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// URL of a page the host has open (repeatable); used by activate and click
  #[arg(long = "page", global = true)]
  pages: Vec<String>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Precache the manifest for the configured version
  Install {
    /// Activate immediately when the install signals readiness
    #[arg(long)]
    activate: bool,
  },
  /// Remove stale partitions and take control of open pages
  Activate,
  /// Send one request through the caching pipeline
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Request destination (document, image, script, style, ...)
    #[arg(short, long)]
    destination: Option<Destination>,
    /// Extra request header as 'Name: value' (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write the response body to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Send a control message, e.g. '{"type":"CLEAR_CACHE"}'
  Message { json: String },
  /// List partitions and their entry counts
  Partitions,
  /// Build the notification for a push payload
  Push { payload: Option<String> },
  /// Route a notification click to a page
  Click { url: String },
  /// Run a background sync tag
  Sync { tag: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose, args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = if let Some(version) = args.app_version {
    config::Config { version, ..config }
  } else {
    config
  };

  let pages = PageSet::new();
  for url in &args.pages {
    pages.add(url)?;
  }

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let worker = Worker::new(
    config.worker_config()?,
    CacheRegistry::new(storage),
    Arc::new(HttpNetwork::new()?),
    Arc::new(pages),
  )
  .restore()?;

  run(&worker, args.command).await
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let default = match verbose {
    0 => "shellcache=warn",
    1 => "shellcache=info",
    _ => "shellcache=debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

async fn run(worker: &Worker<SqliteStorage>, command: Cmd) -> Result<()> {
  match command {
    Cmd::Install { activate } => {
      if let Continuation::Installed {
        ready_to_activate,
        cached,
      } = worker.handle(Command::Install).await?
      {
        println!(
          "installed {} ({} precached)",
          worker.config().version,
          cached
        );
        if activate && ready_to_activate {
          print_continuation(worker.handle(Command::Activate).await?)?;
        }
      }
    }
    Cmd::Activate => print_continuation(worker.handle(Command::Activate).await?)?,
    Cmd::Fetch {
      url,
      method,
      destination,
      headers,
      output,
    } => {
      let url = worker.config().resolve(&url)?;
      let mut request = Request::get(url)
        .with_method(&method)
        .with_destination(destination.unwrap_or_default());
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      let continuation = worker.handle(Command::Request(request)).await?;
      if let (Some(path), Continuation::Response(Ok(outcome))) = (&output, &continuation) {
        if let Some(served) = outcome.served() {
          std::fs::write(path, &served.response.body)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
        }
      }
      print_continuation(continuation)?;
    }
    Cmd::Message { json } => {
      let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid message JSON: {}", e))?;
      match worker.post_message(ControlMessage::from_value(value)).await? {
        Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
        None => println!("no reply"),
      }
    }
    Cmd::Partitions => {
      let registry = worker.registry();
      let current = worker.config().current_partitions();
      for name in registry.list_names()? {
        let state = if current.contains(&name.as_str()) {
          "current"
        } else {
          "stale"
        };
        println!("{:<32} {:>6} entries  {}", name, registry.entry_count(&name)?, state);
      }
    }
    Cmd::Push { payload } => {
      print_continuation(
        worker
          .handle(Command::Push(payload.map(String::into_bytes)))
          .await?,
      )?;
    }
    Cmd::Click { url } => {
      let payload = serde_json::json!({ "data": { "url": url } }).to_string();
      let notification =
        Notification::from_payload(&worker.config().notification, Some(payload.as_bytes()));
      print_continuation(
        worker
          .handle(Command::NotificationClick(notification))
          .await?,
      )?;
    }
    Cmd::Sync { tag } => print_continuation(worker.handle(Command::Sync(tag)).await?)?,
  }

  Ok(())
}

fn print_continuation(continuation: Continuation) -> Result<()> {
  match continuation {
    Continuation::Installed {
      ready_to_activate,
      cached,
    } => println!("installed ({} precached, ready: {})", cached, ready_to_activate),
    Continuation::Activated { removed, claimed } => {
      for name in &removed {
        println!("removed {}", name);
      }
      println!("activated, claimed {} page(s)", claimed);
    }
    Continuation::Response(Ok(Outcome::Served(served))) => {
      let from = served.partition.as_deref().unwrap_or("network");
      println!("{} via {:?} from {}", served.response, served.source, from);
      if let Some(content_type) = served.response.header("content-type") {
        println!("content-type: {}", content_type);
      }
      if let Some(cached_at) = served.cached_at {
        println!("cached at {}", cached_at.format("%Y-%m-%d %H:%M:%S UTC"));
      }
    }
    Continuation::Response(Ok(Outcome::Unavailable)) => println!("unavailable"),
    Continuation::Response(Err(e)) => return Err(eyre!(e)),
    Continuation::MessageHandled => println!("message handled"),
    Continuation::ShowNotification(notification) => {
      println!("{}", serde_json::to_string_pretty(&notification)?)
    }
    Continuation::Click(action) => println!("{:?}", action),
    Continuation::Synced { handled } => println!("sync handled: {}", handled),
  }

  Ok(())
}
