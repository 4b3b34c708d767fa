//! Test doubles shared by the module tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::http::{Request, Response};
use crate::network::{FetchError, Network};

enum Scripted {
  Respond(Response),
  Fail,
}

/// Scripted network. Unscripted URLs behave as if the device were offline.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Scripted>>,
  calls: Mutex<Vec<String>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.routes.lock().unwrap().insert(
      url.to_string(),
      Scripted::Respond(Response::new(status, body)),
    );
  }

  pub fn fail(&self, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Scripted::Fail);
  }

  /// Drop every scripted route so all fetches fail.
  pub fn go_offline(&self) {
    self.routes.lock().unwrap().clear();
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_for(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|u| u.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    match self.routes.lock().unwrap().get(&url) {
      Some(Scripted::Respond(resp)) => Ok(resp.clone()),
      Some(Scripted::Fail) | None => Err(FetchError::transport(url, "offline")),
    }
  }
}
