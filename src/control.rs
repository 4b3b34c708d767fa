//! Control channel: one-shot commands from the host application.
//!
//! Messages are JSON objects `{"type": ..., ...payload}`. The page-side wire
//! names (`SKIP_WAITING`, `CLEAR_CACHE`, `CACHE_URLS`) are accepted alongside
//! the descriptive ones. Unknown or malformed messages are ignored.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::cache::{CacheRegistry, PartitionStore};
use crate::config::WorkerConfig;
use crate::http::Request;
use crate::network::{fetch_ok, Network};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
  /// Activate the installed-but-waiting version now
  #[serde(rename = "SKIP_WAITING", alias = "skip-waiting")]
  SkipWaiting,
  /// Delete every partition, current ones included
  #[serde(rename = "CLEAR_CACHE", alias = "clear-all-caches")]
  ClearAllCaches,
  /// Fetch and store URLs into the runtime partition
  #[serde(rename = "CACHE_URLS", alias = "bulk-cache-urls")]
  CacheUrls { urls: Vec<String> },
  #[serde(other)]
  Unknown,
}

impl ControlMessage {
  /// Parse a message. Anything unrecognizable becomes [`ControlMessage::Unknown`].
  pub fn from_value(value: Value) -> Self {
    match serde_json::from_value(value) {
      Ok(message) => message,
      Err(e) => {
        warn!(error = %e, "Ignoring malformed control message");
        Self::Unknown
      }
    }
  }
}

/// Acknowledgement sent back over the reply port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub results: Option<Vec<UrlResult>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Reply {
  pub fn ok() -> Self {
    Self {
      success: true,
      results: None,
      error: None,
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      success: false,
      results: None,
      error: Some(error.into()),
    }
  }

  /// Batch reply; successful only when every item succeeded.
  pub fn batch(results: Vec<UrlResult>) -> Self {
    Self {
      success: results.iter().all(|r| r.success),
      results: Some(results),
      error: None,
    }
  }
}

/// Per-URL outcome of a bulk cache request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlResult {
  pub url: String,
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl UrlResult {
  fn ok(url: &str) -> Self {
    Self {
      url: url.to_string(),
      success: true,
      error: None,
    }
  }

  fn failed(url: &str, error: impl Into<String>) -> Self {
    Self {
      url: url.to_string(),
      success: false,
      error: Some(error.into()),
    }
  }
}

/// A message plus the optional port its reply goes to.
#[derive(Debug)]
pub struct Envelope {
  pub message: ControlMessage,
  reply_to: Option<oneshot::Sender<Reply>>,
}

impl Envelope {
  /// A message whose sender does not want a reply.
  pub fn new(message: ControlMessage) -> Self {
    Self {
      message,
      reply_to: None,
    }
  }

  /// A message with a reply port.
  pub fn with_reply(message: ControlMessage) -> (Self, oneshot::Receiver<Reply>) {
    let (tx, rx) = oneshot::channel();
    (
      Self {
        message,
        reply_to: Some(tx),
      },
      rx,
    )
  }

  /// Send the reply, at most once. A sender that went away is not an error.
  pub fn reply(self, reply: Reply) {
    if let Some(tx) = self.reply_to {
      let _ = tx.send(reply);
    }
  }
}

/// Delete every partition regardless of version.
pub fn clear_all<S: PartitionStore>(registry: &CacheRegistry<S>) -> Reply {
  let names = match registry.list_names() {
    Ok(names) => names,
    Err(e) => return Reply::failed(e.to_string()),
  };

  for name in &names {
    if let Err(e) = registry.delete(name) {
      warn!(partition = %name, error = %e, "Failed to delete partition");
      return Reply::failed(e.to_string());
    }
  }

  info!(count = names.len(), "Cleared all partitions");
  Reply::ok()
}

/// Fetch every URL and store the successful ones into the runtime partition.
///
/// Best-effort: one failure does not stop the others, and the reply lists
/// the outcome per URL.
pub async fn cache_urls<S: PartitionStore>(
  registry: &CacheRegistry<S>,
  network: &dyn Network,
  config: &WorkerConfig,
  urls: &[String],
) -> Reply {
  let partition = registry.handle(&config.runtime_name);
  let partition = &partition;

  let fetches = urls.iter().map(|raw| async move {
    let url = match config.resolve(raw) {
      Ok(url) => url,
      Err(e) => return UrlResult::failed(raw, e.to_string()),
    };
    let request = Request::get(url);

    match fetch_ok(network, &request).await {
      Ok(response) => match partition.put(&request, &response) {
        Ok(()) => UrlResult::ok(raw),
        Err(e) => UrlResult::failed(raw, e.to_string()),
      },
      Err(e) => UrlResult::failed(raw, e.to_string()),
    }
  });

  let results = join_all(fetches).await;
  let failed = results.iter().filter(|r| !r.success).count();
  if failed > 0 {
    warn!(failed, total = results.len(), "Some URLs could not be cached");
  } else {
    info!(total = results.len(), "Cached URLs");
  }

  Reply::batch(results)
}
