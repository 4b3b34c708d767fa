//! Core types shared by the storage backends and the strategy engine.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A stored response together with its insertion time.
///
/// There is no TTL: freshness is decided by the strategy, not the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Cache hit served without consulting the network
  Cache,
  /// Network unavailable, serving the stored copy
  Offline,
  /// Network unavailable and nothing stored; serving the root document
  FallbackDocument,
}

/// A response plus metadata about how it was obtained.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// Partition the response was read from, if any
  pub partition: Option<String>,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Create a result from fresh network data.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      partition: None,
      cached_at: None,
    }
  }

  /// Create a result from a cached entry.
  pub fn from_cache(entry: CachedEntry, partition: &str, source: CacheSource) -> Self {
    Self {
      response: entry.response,
      source,
      partition: Some(partition.to_string()),
      cached_at: Some(entry.cached_at),
    }
  }
}
