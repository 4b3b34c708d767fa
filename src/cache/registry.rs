//! Named partition handles on top of a storage backend.

use color_eyre::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::storage::PartitionStore;
use super::traits::CachedEntry;
use crate::http::{Request, Response};

/// The set of named cache partitions.
///
/// The registry holds no version policy; deciding which partitions are stale
/// belongs to the lifecycle controller.
pub struct CacheRegistry<S: PartitionStore> {
  storage: Arc<S>,
}

impl<S: PartitionStore> CacheRegistry<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Get a handle to a partition, creating it if absent.
  pub fn open(&self, name: &str) -> Result<Partition<S>> {
    self.storage.open(name)?;
    Ok(self.handle(name))
  }

  /// Get a handle without creating the partition; writes create it lazily.
  pub fn handle(&self, name: &str) -> Partition<S> {
    Partition {
      storage: Arc::clone(&self.storage),
      name: name.to_string(),
    }
  }

  pub fn list_names(&self) -> Result<BTreeSet<String>> {
    self.storage.list_names()
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete(name)
  }

  pub fn entry_count(&self, name: &str) -> Result<usize> {
    self.storage.entry_count(name)
  }

  /// Lifecycle phase last recorded for a worker version.
  pub fn worker_phase(&self, version: &str) -> Result<Option<String>> {
    self.storage.worker_phase(version)
  }

  pub fn set_worker_phase(&self, version: &str, phase: &str) -> Result<()> {
    self.storage.set_worker_phase(version, phase)
  }
}

impl<S: PartitionStore> Clone for CacheRegistry<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// Handle to one named partition. Entries are keyed by [`Request::cache_key`].
pub struct Partition<S: PartitionStore> {
  storage: Arc<S>,
  name: String,
}

impl<S: PartitionStore> Partition<S> {
  pub fn get(&self, request: &Request) -> Result<Option<CachedEntry>> {
    self.storage.get(&self.name, &request.cache_key())
  }

  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self.storage.put(&self.name, &request.cache_key(), response)
  }

  /// Store a batch atomically.
  pub fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
    let keyed: Vec<(String, Response)> = entries
      .iter()
      .map(|(req, resp)| (req.cache_key(), resp.clone()))
      .collect();
    self.storage.put_all(&self.name, &keyed)
  }
}

#[cfg(test)]
impl<S: PartitionStore> Partition<S> {
  /// Whether a usable entry exists; entries failing the digest check do not count.
  pub fn has(&self, request: &Request) -> Result<bool> {
    self.get(request).map(|entry| entry.is_some())
  }
}
