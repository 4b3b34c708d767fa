//! Push payloads to notifications, and notification clicks to pages.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::clients::{Clients, Page};

/// Notification shown when a payload is missing or does not override a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Page opened on click when the payload carries no `data.url`
  pub url: String,
  pub tag: String,
  pub vibrate: Vec<u32>,
  pub require_interaction: bool,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "Notification".to_string(),
      body: "You have a new notification".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      url: "/index.html".to_string(),
      tag: "shell-notification".to_string(),
      vibrate: vec![200, 100, 200],
      require_interaction: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Arbitrary payload data; `data.url` drives click routing
  pub data: Value,
  pub tag: String,
  pub vibrate: Vec<u32>,
  pub require_interaction: bool,
}

impl Notification {
  fn from_defaults(defaults: &NotificationDefaults) -> Self {
    Self {
      title: defaults.title.clone(),
      body: defaults.body.clone(),
      icon: defaults.icon.clone(),
      badge: defaults.badge.clone(),
      data: serde_json::json!({ "url": defaults.url }),
      tag: defaults.tag.clone(),
      vibrate: defaults.vibrate.clone(),
      require_interaction: defaults.require_interaction,
    }
  }

  /// Build the notification for a push payload.
  ///
  /// A JSON object is merged over the defaults field by field (top level
  /// only, so a payload `data` replaces the default `data` entirely). Any
  /// other payload keeps the defaults and shows its text as the body.
  pub fn from_payload(defaults: &NotificationDefaults, payload: Option<&[u8]>) -> Self {
    let mut notification = Self::from_defaults(defaults);

    let Some(payload) = payload.filter(|p| !p.is_empty()) else {
      return notification;
    };

    match serde_json::from_slice::<Value>(payload) {
      Ok(Value::Object(fields)) => notification.merge(fields),
      _ => {
        debug!("Push payload is not a JSON object, using it as text");
        notification.body = String::from_utf8_lossy(payload).into_owned();
      }
    }

    notification
  }

  fn merge(&mut self, mut fields: Map<String, Value>) {
    for (key, slot) in [
      ("title", &mut self.title),
      ("body", &mut self.body),
      ("icon", &mut self.icon),
      ("badge", &mut self.badge),
    ] {
      match fields.remove(key) {
        Some(Value::String(s)) => *slot = s,
        Some(Value::Null) | None => {}
        Some(other) => *slot = other.to_string(),
      }
    }

    if let Some(data) = fields.remove("data") {
      self.data = data;
    }
  }

  /// Where a click should lead, resolved against the app location.
  pub fn target_url(&self, defaults: &NotificationDefaults, base_url: &Url) -> String {
    let raw = self
      .data
      .get("url")
      .and_then(Value::as_str)
      .filter(|u| !u.is_empty())
      .unwrap_or(defaults.url.as_str());

    base_url
      .join(raw)
      .map(|u| u.to_string())
      .unwrap_or_else(|_| raw.to_string())
  }
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
  Focused(Page),
  Opened(Page),
}

/// Focus the open page showing the notification's URL, or open a new one.
pub async fn route_click(
  clients: &dyn Clients,
  notification: &Notification,
  defaults: &NotificationDefaults,
  base_url: &Url,
) -> Result<ClickAction> {
  let target = notification.target_url(defaults, base_url);

  let existing = clients.list().await?.into_iter().find(|p| p.url == target);
  match existing {
    Some(page) => {
      debug!(url = %target, id = page.id, "Focusing existing page");
      Ok(ClickAction::Focused(clients.focus(page.id).await?))
    }
    None => {
      debug!(url = %target, "Opening new page");
      Ok(ClickAction::Opened(clients.open(&target).await?))
    }
  }
}
