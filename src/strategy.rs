//! Strategy engine: runs the caching algorithm for a request's resource class.
//!
//! Each class has an explicit, ordered fallback chain. Steps run in order and
//! the first one that yields a response wins:
//!
//! | class        | chain                                                  |
//! |--------------|--------------------------------------------------------|
//! | remote-api   | network (store 200) → remote-api partition             |
//! | cdn-asset    | runtime partition → network (store 200)                |
//! | document     | network (store 200) → current partitions → root page   |
//! | static-asset | current partitions → network (store 200)               |
//!
//! When the chain is exhausted, static assets resolve to
//! [`Outcome::Unavailable`]; every other class propagates the network error.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheRegistry, CacheSource, CachedEntry, PartitionStore, Served};
use crate::classify::{classify, ResourceClass};
use crate::config::{Role, WorkerConfig};
use crate::http::{Request, Response};
use crate::network::{FetchError, Network};

/// Where a cache lookup looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  /// Only the current partition for one role
  Role(Role),
  /// All current partitions: precache, runtime, remote-api
  Current,
}

/// One step of a fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  /// Fetch from the network and store 200 responses into the role's partition.
  /// With `server_error_is_failure`, a 5xx counts as a failed fetch.
  Network {
    store_into: Role,
    server_error_is_failure: bool,
  },
  /// Serve a stored entry for the request
  Cached(Scope),
  /// Serve the stored root document
  FallbackDocument,
}

const REMOTE_API_CHAIN: &[Step] = &[
  Step::Network {
    store_into: Role::RemoteApi,
    server_error_is_failure: true,
  },
  Step::Cached(Scope::Role(Role::RemoteApi)),
];

const CDN_ASSET_CHAIN: &[Step] = &[
  Step::Cached(Scope::Role(Role::Runtime)),
  Step::Network {
    store_into: Role::Runtime,
    server_error_is_failure: false,
  },
];

const DOCUMENT_CHAIN: &[Step] = &[
  Step::Network {
    store_into: Role::Runtime,
    server_error_is_failure: false,
  },
  Step::Cached(Scope::Current),
  Step::FallbackDocument,
];

const STATIC_ASSET_CHAIN: &[Step] = &[
  Step::Cached(Scope::Current),
  Step::Network {
    store_into: Role::Runtime,
    server_error_is_failure: false,
  },
];

/// The ordered fallback chain for a resource class.
pub fn fallback_chain(class: ResourceClass) -> &'static [Step] {
  match class {
    ResourceClass::RemoteApi => REMOTE_API_CHAIN,
    ResourceClass::CdnAsset => CDN_ASSET_CHAIN,
    ResourceClass::Document => DOCUMENT_CHAIN,
    ResourceClass::StaticAsset => STATIC_ASSET_CHAIN,
  }
}

/// Terminal outcome of the request pipeline.
#[derive(Debug, Clone)]
pub enum Outcome {
  Served(Served),
  /// Non-critical asset: offline and nothing stored
  Unavailable,
}

impl Outcome {
  pub fn served(&self) -> Option<&Served> {
    match self {
      Self::Served(served) => Some(served),
      Self::Unavailable => None,
    }
  }
}

/// Runs the per-class caching algorithms against the partition registry.
pub struct StrategyEngine<S: PartitionStore> {
  registry: CacheRegistry<S>,
  network: Arc<dyn Network>,
  config: Arc<WorkerConfig>,
}

impl<S: PartitionStore> StrategyEngine<S> {
  pub fn new(
    registry: CacheRegistry<S>,
    network: Arc<dyn Network>,
    config: Arc<WorkerConfig>,
  ) -> Self {
    Self {
      registry,
      network,
      config,
    }
  }

  /// Classify the request and run its strategy. Requests that are not
  /// cacheable go straight to the network without touching any partition.
  pub async fn handle(&self, request: &Request) -> Result<Outcome, FetchError> {
    let Some(class) = classify(request, &self.config) else {
      debug!(method = %request.method, url = %request.url, "Bypassing cache");
      let response = self.network.fetch(request).await?;
      return Ok(Outcome::Served(Served::from_network(response)));
    };

    self.run(class, request).await
  }

  /// Evaluate the fallback chain for `class`.
  pub async fn run(&self, class: ResourceClass, request: &Request) -> Result<Outcome, FetchError> {
    let mut network_error: Option<FetchError> = None;

    for step in fallback_chain(class) {
      let served = match *step {
        Step::Network {
          store_into,
          server_error_is_failure,
        } => match self.network.fetch(request).await {
          Ok(response) if server_error_is_failure && response.is_server_error() => {
            debug!(%class, url = %request.url, status = response.status, "Server error, trying cache");
            network_error = Some(FetchError::Status {
              url: request.url.to_string(),
              status: response.status,
            });
            None
          }
          Ok(response) => {
            self.store(store_into, request, &response);
            Some(Served::from_network(response))
          }
          Err(e) => {
            debug!(%class, url = %request.url, error = %e, "Network failed");
            network_error = Some(e);
            None
          }
        },
        Step::Cached(scope) => {
          let source = if network_error.is_some() {
            CacheSource::Offline
          } else {
            CacheSource::Cache
          };
          self
            .lookup(scope, request)
            .map(|(entry, partition)| Served::from_cache(entry, partition, source))
        }
        Step::FallbackDocument => {
          let fallback = Request::get(self.config.fallback_document.clone());
          self.lookup(Scope::Current, &fallback).map(|(entry, partition)| {
            debug!(url = %request.url, "Serving fallback document");
            Served::from_cache(entry, partition, CacheSource::FallbackDocument)
          })
        }
      };

      if let Some(served) = served {
        return Ok(Outcome::Served(served));
      }
    }

    match class {
      ResourceClass::StaticAsset => {
        debug!(url = %request.url, "Asset unavailable");
        Ok(Outcome::Unavailable)
      }
      _ => Err(network_error.unwrap_or_else(|| {
        FetchError::transport(request.url.as_str(), "no response available")
      })),
    }
  }

  /// First stored entry for the request within `scope`. Storage errors
  /// degrade to a miss.
  fn lookup(&self, scope: Scope, request: &Request) -> Option<(CachedEntry, &str)> {
    let names: Vec<&str> = match scope {
      Scope::Role(role) => vec![self.config.partition_name(role)],
      Scope::Current => self.config.current_partitions().to_vec(),
    };

    for name in names {
      match self.registry.handle(name).get(request) {
        Ok(Some(entry)) => return Some((entry, name)),
        Ok(None) => {}
        Err(e) => warn!(partition = name, error = %e, "Cache lookup failed"),
      }
    }

    None
  }

  /// Write a duplicate of a 200 response into the role's partition. The
  /// original is still returned to the caller if the write fails.
  fn store(&self, role: Role, request: &Request, response: &Response) {
    if !response.is_cacheable() {
      return;
    }

    let name = self.config.partition_name(role);
    if let Err(e) = self.registry.handle(name).put(request, response) {
      warn!(partition = name, url = %request.url, error = %e, "Failed to store response");
    }
  }
}

impl<S: PartitionStore> Clone for StrategyEngine<S> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      network: Arc::clone(&self.network),
      config: Arc::clone(&self.config),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::http::Destination;
  use crate::testing::FakeNetwork;
  use url::Url;

  const API: &str = "https://db.example.co/rest/v1/items";
  const CDN: &str = "https://cdn.jsdelivr.net/npm/lib@2/lib.min.js";
  const PAGE: &str = "https://app.example/about.html";
  const INDEX: &str = "https://app.example/index.html";
  const ICON: &str = "https://app.example/icons/icon-192x192.png";

  struct Harness {
    engine: StrategyEngine<SqliteStorage>,
    registry: CacheRegistry<SqliteStorage>,
    network: Arc<FakeNetwork>,
    config: Arc<WorkerConfig>,
  }

  fn harness() -> Harness {
    let config = Arc::new(
      Config {
        base_url: "https://app.example/".to_string(),
        remote_api_origin: Some("https://db.example.co".to_string()),
        ..Config::default()
      }
      .worker_config()
      .unwrap(),
    );
    let registry = CacheRegistry::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let engine = StrategyEngine::new(registry.clone(), network.clone(), Arc::clone(&config));

    Harness {
      engine,
      registry,
      network,
      config,
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn body(outcome: &Outcome) -> &[u8] {
    &outcome.served().unwrap().response.body
  }

  #[tokio::test]
  async fn test_non_get_never_touches_partitions() {
    let h = harness();
    h.network.respond(API, 200, "created");
    let post = get(API).with_method("POST");

    let outcome = h.engine.handle(&post).await.unwrap();
    assert_eq!(outcome.served().unwrap().source, CacheSource::Network);
    assert!(h.registry.list_names().unwrap().is_empty());

    // Even with a stored GET for the same URL, a failing POST is not served from cache
    h.registry
      .handle(&h.config.remote_api_name)
      .put(&get(API), &Response::new(200, "cached"))
      .unwrap();
    h.network.go_offline();
    assert!(h.engine.handle(&post).await.is_err());
  }

  #[tokio::test]
  async fn test_remote_api_stores_and_falls_back() {
    let h = harness();
    h.network.respond(API, 200, "[1,2]");

    let fresh = h.engine.handle(&get(API)).await.unwrap();
    assert_eq!(body(&fresh), b"[1,2]");

    h.network.go_offline();
    let offline = h.engine.handle(&get(API)).await.unwrap();
    let served = offline.served().unwrap();
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.response.body, b"[1,2]");
    assert_eq!(served.partition.as_deref(), Some(h.config.remote_api_name.as_str()));
  }

  #[tokio::test]
  async fn test_remote_api_server_error_uses_stored_copy() {
    let h = harness();
    h.network.respond(API, 200, "good");
    h.engine.handle(&get(API)).await.unwrap();

    h.network.respond(API, 500, "boom");
    let outcome = h.engine.handle(&get(API)).await.unwrap();
    assert_eq!(body(&outcome), b"good");
  }

  #[tokio::test]
  async fn test_remote_api_server_error_without_copy_fails() {
    let h = harness();
    h.network.respond(API, 500, "boom");

    let err = h.engine.handle(&get(API)).await.unwrap_err();
    assert_eq!(
      err,
      FetchError::Status {
        url: API.to_string(),
        status: 500
      }
    );
  }

  #[tokio::test]
  async fn test_remote_api_offline_without_copy_fails() {
    let h = harness();
    assert!(matches!(
      h.engine.handle(&get(API)).await,
      Err(FetchError::Transport { .. })
    ));
  }

  #[tokio::test]
  async fn test_remote_api_client_error_is_returned_but_not_stored() {
    let h = harness();
    h.network.respond(API, 404, "missing");

    let outcome = h.engine.handle(&get(API)).await.unwrap();
    assert_eq!(outcome.served().unwrap().response.status, 404);
    assert_eq!(h.registry.entry_count(&h.config.remote_api_name).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cdn_hit_never_fetches() {
    let h = harness();
    h.network.respond(CDN, 200, "lib");

    h.engine.handle(&get(CDN)).await.unwrap();
    assert_eq!(h.network.calls_for(CDN), 1);

    // Network changes or disappears; the stored copy keeps winning
    h.network.respond(CDN, 200, "lib-v2");
    for _ in 0..3 {
      let outcome = h.engine.handle(&get(CDN)).await.unwrap();
      assert_eq!(body(&outcome), b"lib");
      assert_eq!(outcome.served().unwrap().source, CacheSource::Cache);
    }
    h.network.go_offline();
    assert_eq!(body(&h.engine.handle(&get(CDN)).await.unwrap()), b"lib");
    assert_eq!(h.network.calls_for(CDN), 1);
  }

  #[tokio::test]
  async fn test_cdn_miss_offline_fails() {
    let h = harness();
    assert!(h.engine.handle(&get(CDN)).await.is_err());
  }

  #[tokio::test]
  async fn test_document_prefers_fresh_network_copy() {
    let h = harness();
    h.network.respond(PAGE, 200, "<p>v1</p>");
    h.engine.handle(&get(PAGE)).await.unwrap();

    h.network.respond(PAGE, 200, "<p>v2</p>");
    let outcome = h.engine.handle(&get(PAGE)).await.unwrap();
    assert_eq!(body(&outcome), b"<p>v2</p>");
    assert_eq!(outcome.served().unwrap().source, CacheSource::Network);

    // And the stored copy was refreshed
    let stored = h
      .registry
      .handle(&h.config.runtime_name)
      .get(&get(PAGE))
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"<p>v2</p>");
  }

  #[tokio::test]
  async fn test_document_offline_serves_cached_then_root() {
    let h = harness();
    h.registry
      .handle(&h.config.precache_name)
      .put(&get(INDEX), &Response::new(200, "<shell/>"))
      .unwrap();
    h.network.respond(PAGE, 200, "<about/>");
    h.engine.handle(&get(PAGE)).await.unwrap();
    h.network.go_offline();

    let cached = h.engine.handle(&get(PAGE)).await.unwrap();
    assert_eq!(body(&cached), b"<about/>");
    assert_eq!(cached.served().unwrap().source, CacheSource::Offline);

    let nav = get("https://app.example/never-seen").with_destination(Destination::Document);
    let fallback = h.engine.handle(&nav).await.unwrap();
    assert_eq!(body(&fallback), b"<shell/>");
    assert_eq!(
      fallback.served().unwrap().source,
      CacheSource::FallbackDocument
    );
  }

  #[tokio::test]
  async fn test_document_offline_without_any_copy_fails() {
    let h = harness();
    assert!(h.engine.handle(&get(PAGE)).await.is_err());
  }

  #[tokio::test]
  async fn test_static_asset_served_from_precache() {
    let h = harness();
    h.registry
      .handle(&h.config.precache_name)
      .put(&get(ICON), &Response::new(200, "png"))
      .unwrap();

    let outcome = h.engine.handle(&get(ICON)).await.unwrap();
    assert_eq!(body(&outcome), b"png");
    assert_eq!(h.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_static_asset_fills_runtime_on_miss() {
    let h = harness();
    let js = "https://app.example/app.js";
    h.network.respond(js, 200, "code");

    h.engine.handle(&get(js)).await.unwrap();
    h.network.go_offline();

    let outcome = h.engine.handle(&get(js)).await.unwrap();
    assert_eq!(body(&outcome), b"code");
    assert_eq!(h.network.calls_for(js), 1);
  }

  #[tokio::test]
  async fn test_static_asset_offline_is_unavailable() {
    let h = harness();
    let outcome = h.engine.handle(&get("https://app.example/app.js")).await.unwrap();
    assert!(matches!(outcome, Outcome::Unavailable));
  }

  #[tokio::test]
  async fn test_static_asset_non_200_returned_not_stored() {
    let h = harness();
    let js = "https://app.example/missing.js";
    h.network.respond(js, 404, "nope");

    let outcome = h.engine.handle(&get(js)).await.unwrap();
    assert_eq!(outcome.served().unwrap().response.status, 404);
    assert_eq!(h.registry.entry_count(&h.config.runtime_name).unwrap(), 0);
  }

  #[test]
  fn test_chains_start_as_documented() {
    assert!(matches!(
      fallback_chain(ResourceClass::RemoteApi)[0],
      Step::Network { .. }
    ));
    assert_eq!(
      fallback_chain(ResourceClass::CdnAsset)[0],
      Step::Cached(Scope::Role(Role::Runtime))
    );
    assert_eq!(
      fallback_chain(ResourceClass::Document).last(),
      Some(&Step::FallbackDocument)
    );
    assert_eq!(
      fallback_chain(ResourceClass::StaticAsset)[0],
      Step::Cached(Scope::Current)
    );
  }
}
