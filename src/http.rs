//! Request and response snapshots that flow through the caching pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// What the page intends to do with the response (mirrors `Request.destination`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// No destination, e.g. `fetch()` from script
  #[default]
  Empty,
  /// Top-level navigation
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  Other,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "" | "empty" => Ok(Self::Empty),
      "document" => Ok(Self::Document),
      "image" => Ok(Self::Image),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "font" => Ok(Self::Font),
      "manifest" => Ok(Self::Manifest),
      "other" => Ok(Self::Other),
      other => Err(format!("unknown request destination '{}'", other)),
    }
  }
}

/// An intercepted request. Only method, URL, destination and headers are consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// A plain GET with no destination.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      destination: Destination::Empty,
      headers: Vec::new(),
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_uppercase();
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Normalized cache key: method plus URL with the query kept and the fragment dropped.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method.to_uppercase(), url)
  }
}

/// A fully buffered response. Cloning yields a byte-identical duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Whether the status is in the 2xx range (`Response.ok`).
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only exact 200 responses are written to runtime partitions.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn is_server_error(&self) -> bool {
    (500..600).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

impl fmt::Display for Response {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({} bytes)", self.status, self.body.len())
  }
}
