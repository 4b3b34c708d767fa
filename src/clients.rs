//! Open application pages controlled by a worker.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Mutex;

/// An open page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
  pub id: u64,
  pub url: String,
  /// Version of the worker serving this page, if any
  pub controller: Option<String>,
  pub focused: bool,
}

/// The host's view of open pages.
#[async_trait]
pub trait Clients: Send + Sync {
  /// Make `version` the controller of every open page. Returns how many pages changed hands.
  async fn claim(&self, version: &str) -> Result<usize>;

  /// All open pages, including ones not yet controlled.
  async fn list(&self) -> Result<Vec<Page>>;

  async fn focus(&self, id: u64) -> Result<Page>;

  /// Open a new page at `url`.
  async fn open(&self, url: &str) -> Result<Page>;
}

/// In-process page set, used by the CLI host and tests.
#[derive(Default)]
pub struct PageSet {
  pages: Mutex<Vec<Page>>,
}

impl PageSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a page the host already has open.
  pub fn add(&self, url: &str) -> Result<Page> {
    let mut pages = self.pages.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let page = Page {
      id: pages.len() as u64 + 1,
      url: url.to_string(),
      controller: None,
      focused: false,
    };
    pages.push(page.clone());
    Ok(page)
  }
}

#[async_trait]
impl Clients for PageSet {
  async fn claim(&self, version: &str) -> Result<usize> {
    let mut pages = self.pages.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut claimed = 0;
    for page in pages.iter_mut() {
      if page.controller.as_deref() != Some(version) {
        page.controller = Some(version.to_string());
        claimed += 1;
      }
    }
    Ok(claimed)
  }

  async fn list(&self) -> Result<Vec<Page>> {
    let pages = self.pages.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(pages.clone())
  }

  async fn focus(&self, id: u64) -> Result<Page> {
    let mut pages = self.pages.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut focused = None;
    for page in pages.iter_mut() {
      page.focused = page.id == id;
      if page.focused {
        focused = Some(page.clone());
      }
    }
    focused.ok_or_else(|| eyre!("No open page with id {}", id))
  }

  async fn open(&self, url: &str) -> Result<Page> {
    let mut pages = self.pages.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    for page in pages.iter_mut() {
      page.focused = false;
    }
    let page = Page {
      id: pages.len() as u64 + 1,
      url: url.to_string(),
      controller: None,
      focused: true,
    };
    pages.push(page.clone());
    Ok(page)
  }
}
