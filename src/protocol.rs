//! Wire format shared by the broker and the client.
//!
//! Every frame is a single JSON object:
//!
//! ```text
//! { "event": "chat", "message": { ... }, "responseEventId": "x7Gd0..." }
//! ```
//!
//! `responseEventId` is only present when the sender expects an answer. The
//! answer is sent back as a normal frame whose event name is
//! `"<event>#<responseEventId>"`, see [`response_event`].

use crate::error::{Result, SocketError};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Dispatched locally once a connection reaches the open state.
pub const CONNECTED: &str = "connected";
/// Dispatched locally once a connection is gone for good.
pub const DISCONNECTED: &str = "disconnected";
/// Dispatched locally when the transport reports a failure.
pub const ERROR: &str = "error";

/// Length of generated correlation ids.
pub const CORRELATION_ID_LENGTH: usize = 16;

/// Message envelope for WebSocket communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
  pub event: String,
  #[serde(default)]
  pub message: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub response_event_id: Option<String>,
}

impl Envelope {
  pub fn new(event: impl Into<String>, message: Value) -> Self {
    Self {
      event: event.into(),
      message,
      response_event_id: None,
    }
  }

  /// Envelope that asks the receiver to answer on `event#<id>`.
  pub fn with_response_id(mut self, id: impl Into<String>) -> Self {
    self.response_event_id = Some(id.into());
    self
  }

  /// The frame answering this one, if the sender asked for an answer.
  pub fn reply(&self, message: Value) -> Option<Envelope> {
    self
      .response_event_id
      .as_deref()
      .map(|id| Envelope::new(response_event(&self.event, id), message))
  }

  pub fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn decode(text: &str) -> Result<Self> {
    Ok(serde_json::from_str(text)?)
  }
}

/// Event name under which the answer to a correlated emit travels.
pub fn response_event(event: &str, correlation_id: &str) -> String {
  format!("{}#{}", event, correlation_id)
}

/// Fixed-length alphanumeric token used for client and correlation ids.
///
/// Not cryptographically secure.
pub fn random_token(length: usize) -> String {
  rand::rng()
    .sample_iter(&Alphanumeric)
    .take(length)
    .map(char::from)
    .collect()
}

/// Turn whatever the caller configured into a `ws://` or `wss://` URL.
///
/// `http` maps to `ws`, `https` to `wss`, and a bare `host:port/path` is
/// treated as plain `ws`.
pub fn websocket_url(raw: &str) -> Result<String> {
  let candidate = if raw.contains("://") {
    raw.to_string()
  } else {
    format!("ws://{}", raw)
  };

  let mut url = Url::parse(&candidate)
    .map_err(|e| SocketError::Connect(format!("invalid url '{}': {}", raw, e)))?;

  let scheme = match url.scheme() {
    "http" | "ws" => "ws",
    "https" | "wss" => "wss",
    other => {
      return Err(SocketError::Connect(format!(
        "unsupported scheme '{}' in '{}'",
        other, raw
      )))
    }
  };
  if url.scheme() != scheme {
    // http(s) -> ws(s) are all special schemes, so the swap is accepted.
    let _ = url.set_scheme(scheme);
  }
  Ok(url.to_string())
}
