//! Lifecycle controller: the worker's install/activate state machine.
//!
//! The host drives a [`Worker`] with typed [`Command`]s. Each command returns
//! a [`Continuation`] describing what happened, so the host decides what to
//! do next (for example, activating right after a successful install).
//!
//! ```text
//! Parsed --Install--> Installed --Activate / SkipWaiting--> Activated
//!   ^                    |
//!   +--install failed----+ (nothing persisted; retry from scratch)
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{CacheRegistry, PartitionStore, Served};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::control::{self, ControlMessage, Envelope, Reply};
use crate::http::Request;
use crate::network::{fetch_ok, FetchError, Network};
use crate::push::{route_click, ClickAction, Notification};
use crate::strategy::{Outcome, StrategyEngine};

/// Background sync tag the host registers for deferred work.
pub const SYNC_TAG: &str = "sync-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Not installed yet, or the last install failed
  Parsed,
  Installing,
  /// Precache populated, waiting to take over
  Installed,
  Activating,
  /// Controlling pages and serving requests
  Activated,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
    };
    f.write_str(name)
  }
}

impl FromStr for Phase {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "parsed" => Ok(Self::Parsed),
      "installing" => Ok(Self::Installing),
      "installed" => Ok(Self::Installed),
      "activating" => Ok(Self::Activating),
      "activated" => Ok(Self::Activated),
      other => Err(eyre!("Unknown worker phase: {}", other)),
    }
  }
}

/// Commands the host can send to a worker.
#[derive(Debug)]
pub enum Command {
  Install,
  Activate,
  Request(Request),
  Message(Envelope),
  /// Push delivery with its raw payload
  Push(Option<Vec<u8>>),
  NotificationClick(Notification),
  Sync(String),
}

/// Result of handling one command.
#[derive(Debug)]
pub enum Continuation {
  /// Precache stored. With `ready_to_activate` the host should activate now.
  Installed {
    ready_to_activate: bool,
    cached: usize,
  },
  Activated {
    removed: Vec<String>,
    claimed: usize,
  },
  Response(Result<Outcome, FetchError>),
  /// A control message was handled; any reply went to its port
  MessageHandled,
  ShowNotification(Notification),
  Click(ClickAction),
  Synced { handled: bool },
}

/// One worker instance for one deployed version.
pub struct Worker<S: PartitionStore> {
  config: Arc<WorkerConfig>,
  registry: CacheRegistry<S>,
  network: Arc<dyn Network>,
  clients: Arc<dyn Clients>,
  engine: StrategyEngine<S>,
  phase: Mutex<Phase>,
  /// Skip-waiting requested before the install finished
  skip_waiting: AtomicBool,
}

impl<S: PartitionStore> Worker<S> {
  pub fn new(
    config: WorkerConfig,
    registry: CacheRegistry<S>,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
  ) -> Self {
    let config = Arc::new(config);
    let engine = StrategyEngine::new(registry.clone(), Arc::clone(&network), Arc::clone(&config));

    Self {
      config,
      registry,
      network,
      clients,
      engine,
      phase: Mutex::new(Phase::Parsed),
      skip_waiting: AtomicBool::new(false),
    }
  }

  /// Pick up the phase a previous process recorded for this version.
  ///
  /// A run that died mid-install starts over; one that died mid-activation
  /// is installed and activates again.
  pub fn restore(self) -> Result<Self> {
    let recorded = match self.registry.worker_phase(&self.config.version)? {
      Some(phase) => phase.parse::<Phase>()?,
      None => Phase::Parsed,
    };
    let phase = match recorded {
      Phase::Installing => Phase::Parsed,
      Phase::Activating => Phase::Installed,
      other => other,
    };

    debug!(version = %self.config.version, %phase, "Restored worker");
    *self.phase.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = phase;
    Ok(self)
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn registry(&self) -> &CacheRegistry<S> {
    &self.registry
  }

  pub fn phase(&self) -> Result<Phase> {
    self
      .phase
      .lock()
      .map(|p| *p)
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_phase(&self, phase: Phase) -> Result<()> {
    let mut current = self.phase.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    self.record_phase(phase)?;
    *current = phase;
    Ok(())
  }

  /// Move from `from` to `to`, failing if the worker is elsewhere.
  fn transition(&self, from: Phase, to: Phase) -> Result<()> {
    let mut current = self.phase.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if *current != from {
      return Err(eyre!("Cannot move to {} from {} (expected {})", to, *current, from));
    }
    self.record_phase(to)?;
    *current = to;
    Ok(())
  }

  /// Persist the phase so the next process for this version resumes from it.
  fn record_phase(&self, phase: Phase) -> Result<()> {
    self
      .registry
      .set_worker_phase(&self.config.version, &phase.to_string())
  }

  fn keep_set(&self) -> BTreeSet<&str> {
    self.config.current_partitions().into_iter().collect()
  }

  /// Handle one command.
  pub async fn handle(&self, command: Command) -> Result<Continuation> {
    match command {
      Command::Install => self.install().await,
      Command::Activate => self.activate().await,
      Command::Request(request) => Ok(Continuation::Response(self.fetch(&request).await)),
      Command::Message(envelope) => {
        self.on_message(envelope).await?;
        Ok(Continuation::MessageHandled)
      }
      Command::Push(payload) => {
        info!("Push received");
        Ok(Continuation::ShowNotification(Notification::from_payload(
          &self.config.notification,
          payload.as_deref(),
        )))
      }
      Command::NotificationClick(notification) => {
        info!("Notification clicked");
        let action = route_click(
          self.clients.as_ref(),
          &notification,
          &self.config.notification,
          &self.config.base_url,
        )
        .await?;
        Ok(Continuation::Click(action))
      }
      Command::Sync(tag) => {
        let handled = tag == SYNC_TAG;
        info!(%tag, handled, "Background sync");
        Ok(Continuation::Synced { handled })
      }
    }
  }

  /// Populate the precache partition, all or nothing.
  ///
  /// Every manifest URL is fetched before anything is written; a single
  /// failure aborts the install with nothing persisted.
  pub async fn install(&self) -> Result<Continuation> {
    self.transition(Phase::Parsed, Phase::Installing)?;
    info!(version = %self.config.version, "Install");

    let network = self.network.as_ref();
    let fetches = self.config.precache_manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = fetch_ok(network, &request).await?;
      Ok::<_, FetchError>((request, response))
    });

    let entries = match try_join_all(fetches).await {
      Ok(entries) => entries,
      Err(e) => {
        warn!(error = %e, "Precache failed, install aborted");
        self.skip_waiting.store(false, Ordering::SeqCst);
        self.set_phase(Phase::Parsed)?;
        return Err(eyre!("Install failed: {}", e));
      }
    };

    debug!(count = entries.len(), "Precaching app shell");
    if let Err(e) = self.registry.handle(&self.config.precache_name).put_all(&entries) {
      self.skip_waiting.store(false, Ordering::SeqCst);
      self.set_phase(Phase::Parsed)?;
      return Err(eyre!("Install failed: {}", e));
    }

    self.set_phase(Phase::Installed)?;
    let skip_requested = self.skip_waiting.swap(false, Ordering::SeqCst);
    Ok(Continuation::Installed {
      ready_to_activate: self.config.skip_waiting_on_install || skip_requested,
      cached: entries.len(),
    })
  }

  /// Sweep stale partitions and take control of open pages.
  pub async fn activate(&self) -> Result<Continuation> {
    self.transition(Phase::Installed, Phase::Activating)?;
    info!(version = %self.config.version, "Activate");

    match self.sweep_and_claim().await {
      Ok((removed, claimed)) => {
        self.set_phase(Phase::Activated)?;
        Ok(Continuation::Activated { removed, claimed })
      }
      Err(e) => {
        self.set_phase(Phase::Installed)?;
        Err(e)
      }
    }
  }

  async fn sweep_and_claim(&self) -> Result<(Vec<String>, usize)> {
    let keep = self.keep_set();
    for name in &keep {
      self.registry.open(name)?;
    }

    let mut removed = Vec::new();
    for name in self.registry.list_names()? {
      if !keep.contains(name.as_str()) {
        info!(partition = %name, "Removing old cache");
        self.registry.delete(&name)?;
        removed.push(name);
      }
    }

    let claimed = self.clients.claim(&self.config.version).await?;
    Ok((removed, claimed))
  }

  /// Route a request. Until this version is activated it controls no pages,
  /// so requests go straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<Outcome, FetchError> {
    let controlling = matches!(self.phase(), Ok(Phase::Activated));
    if !controlling {
      debug!(url = %request.url, "Not controlling yet, passing through");
      let response = self.network.fetch(request).await?;
      return Ok(Outcome::Served(Served::from_network(response)));
    }

    self.engine.handle(request).await
  }

  async fn on_message(&self, envelope: Envelope) -> Result<()> {
    debug!(message = ?envelope.message, "Message received");

    match envelope.message.clone() {
      ControlMessage::SkipWaiting => match self.phase()? {
        Phase::Installed => {
          self.activate().await?;
        }
        Phase::Parsed | Phase::Installing => {
          debug!("Skip waiting requested before install finished");
          self.skip_waiting.store(true, Ordering::SeqCst);
        }
        Phase::Activating | Phase::Activated => {}
      },
      ControlMessage::ClearAllCaches => {
        let reply = control::clear_all(&self.registry);
        envelope.reply(reply);
      }
      ControlMessage::CacheUrls { urls } => {
        let reply =
          control::cache_urls(&self.registry, self.network.as_ref(), &self.config, &urls).await;
        envelope.reply(reply);
      }
      ControlMessage::Unknown => {}
    }

    Ok(())
  }

  /// Convenience for hosts: send a message and wait for its reply, if any.
  pub async fn post_message(&self, message: ControlMessage) -> Result<Option<Reply>> {
    let (envelope, rx) = Envelope::with_reply(message);
    self.handle(Command::Message(envelope)).await?;
    Ok(rx.await.ok())
  }
}
