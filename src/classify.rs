//! Maps an intercepted request to the resource class that picks its strategy.

use std::fmt;

use crate::config::WorkerConfig;
use crate::http::{Destination, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  /// Remote data API (network-first, cache fallback)
  RemoteApi,
  /// Library assets on the CDN, immutable by URL (cache-first)
  CdnAsset,
  /// Navigations and HTML pages (network-first, default page)
  Document,
  /// Everything else (cache-first, "unavailable" on failure)
  StaticAsset,
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::RemoteApi => "remote-api",
      Self::CdnAsset => "cdn-asset",
      Self::Document => "document",
      Self::StaticAsset => "static-asset",
    };
    f.write_str(name)
  }
}

/// Classify a request. `None` means not cacheable: the request bypasses
/// every partition and goes straight to the network.
///
/// Rules are evaluated in order and the first match wins.
pub fn classify(request: &Request, config: &WorkerConfig) -> Option<ResourceClass> {
  if !request.is_get() {
    return None;
  }

  let url = &request.url;

  if let Some(origin) = &config.remote_api_origin {
    if &url.origin() == origin {
      return Some(ResourceClass::RemoteApi);
    }
  }

  if let (Some(cdn), Some(host)) = (&config.cdn_host, url.host_str()) {
    if host.eq_ignore_ascii_case(cdn) {
      return Some(ResourceClass::CdnAsset);
    }
  }

  let path = url.path();
  let is_document = request.destination == Destination::Document
    || path.ends_with('/')
    || config
      .document_suffixes
      .iter()
      .any(|suffix| path.ends_with(suffix.as_str()));

  if is_document {
    Some(ResourceClass::Document)
  } else {
    Some(ResourceClass::StaticAsset)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use url::Url;

  fn config() -> WorkerConfig {
    Config {
      base_url: "https://app.example/".to_string(),
      remote_api_origin: Some("https://db.example.co".to_string()),
      cdn_host: Some("cdn.jsdelivr.net".to_string()),
      ..Config::default()
    }
    .worker_config()
    .unwrap()
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_get_is_not_cacheable() {
    let cfg = config();
    for method in ["POST", "PUT", "DELETE", "HEAD"] {
      let req = get("https://db.example.co/rest/v1/items").with_method(method);
      assert_eq!(classify(&req, &cfg), None);
    }
  }

  #[test]
  fn test_remote_api_matches_origin_not_host() {
    let cfg = config();
    assert_eq!(
      classify(&get("https://db.example.co/rest/v1/items?id=eq.1"), &cfg),
      Some(ResourceClass::RemoteApi)
    );
    // Same host, different scheme is a different origin
    assert_eq!(
      classify(&get("http://db.example.co/rest/v1/items"), &cfg),
      Some(ResourceClass::StaticAsset)
    );
  }

  #[test]
  fn test_cdn_host() {
    let cfg = config();
    assert_eq!(
      classify(&get("https://cdn.jsdelivr.net/npm/lib@2/dist/lib.min.js"), &cfg),
      Some(ResourceClass::CdnAsset)
    );
  }

  #[test]
  fn test_remote_api_wins_over_document_rules() {
    let cfg = config();
    let req = get("https://db.example.co/").with_destination(Destination::Document);
    assert_eq!(classify(&req, &cfg), Some(ResourceClass::RemoteApi));
  }

  #[test]
  fn test_documents() {
    let cfg = config();
    assert_eq!(
      classify(&get("https://app.example/"), &cfg),
      Some(ResourceClass::Document)
    );
    assert_eq!(
      classify(&get("https://app.example/about.html"), &cfg),
      Some(ResourceClass::Document)
    );
    let nav = get("https://app.example/settings").with_destination(Destination::Document);
    assert_eq!(classify(&nav, &cfg), Some(ResourceClass::Document));
  }

  #[test]
  fn test_everything_else_is_static() {
    let cfg = config();
    assert_eq!(
      classify(&get("https://app.example/icons/icon-192x192.png"), &cfg),
      Some(ResourceClass::StaticAsset)
    );
    assert_eq!(
      classify(&get("https://app.example/app.js"), &cfg),
      Some(ResourceClass::StaticAsset)
    );
  }

  #[test]
  fn test_classification_is_deterministic() {
    let cfg = config();
    let req = get("https://app.example/page.html?x=1");
    let first = classify(&req, &cfg);
    for _ in 0..10 {
      assert_eq!(classify(&req, &cfg), first);
    }
  }

  #[test]
  fn test_unconfigured_origins_fall_through() {
    let cfg = Config {
      base_url: "https://app.example/".to_string(),
      remote_api_origin: None,
      cdn_host: None,
      ..Config::default()
    }
    .worker_config()
    .unwrap();

    assert_eq!(
      classify(&get("https://cdn.jsdelivr.net/npm/lib.js"), &cfg),
      Some(ResourceClass::StaticAsset)
    );
  }
}
