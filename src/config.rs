//! Client and server configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`SocketClient`](crate::client::SocketClient).
///
/// Deserializes from camelCase keys, e.g.
/// `{"url": "localhost:3000", "reconnectAttempts": 3}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
  /// Server address; `http(s)://`, `ws(s)://` or a bare `host:port/path`.
  pub url: String,
  /// Whether to reconnect after an unexpected close
  #[serde(default = "default_reconnect")]
  pub reconnect: bool,
  /// Maximum number of consecutive reconnect attempts
  #[serde(default = "default_reconnect_attempts")]
  pub reconnect_attempts: u32,
  /// Fixed delay between reconnect attempts
  #[serde(default = "default_reconnect_interval_ms")]
  pub reconnect_interval_ms: u64,
  /// Suppress per-message debug logging
  #[serde(default)]
  pub silent: bool,
  /// Subprotocols offered during the handshake
  #[serde(default)]
  pub protocols: Vec<String>,
  /// Give up on a correlated response after this long (None = wait forever)
  #[serde(default)]
  pub response_timeout_ms: Option<u64>,
}

fn default_reconnect() -> bool {
  true
}

fn default_reconnect_attempts() -> u32 {
  10
}

fn default_reconnect_interval_ms() -> u64 {
  1000
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ClientConfig {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      reconnect: default_reconnect(),
      reconnect_attempts: default_reconnect_attempts(),
      reconnect_interval_ms: default_reconnect_interval_ms(),
      silent: false,
      protocols: Vec::new(),
      response_timeout_ms: None,
    }
  }

  pub fn with_reconnect(mut self, attempts: u32, interval: Duration) -> Self {
    self.reconnect = true;
    self.reconnect_attempts = attempts;
    self.reconnect_interval_ms = millis(interval);
    self
  }

  pub fn without_reconnect(mut self) -> Self {
    self.reconnect = false;
    self
  }

  pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.protocols = protocols.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
    self.response_timeout_ms = Some(millis(timeout));
    self
  }

  pub fn silent(mut self, silent: bool) -> Self {
    self.silent = silent;
    self
  }

  pub fn reconnect_interval(&self) -> Duration {
    Duration::from_millis(self.reconnect_interval_ms)
  }

  pub fn response_timeout(&self) -> Option<Duration> {
    self.response_timeout_ms.map(Duration::from_millis)
  }
}

/// Configuration for a [`Broker`](crate::server::Broker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
  /// Port used by [`Broker::listen_on_port`](crate::server::Broker::listen_on_port)
  pub port: u16,
  /// Length of generated client ids
  pub client_id_length: usize,
  /// Close every open client connection when the broker shuts down
  pub close_clients_on_shutdown: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      port: 3000,
      client_id_length: 16,
      close_clients_on_shutdown: false,
    }
  }
}

impl ServerConfig {
  /// Defaults overridden by `PORT` from the environment or a `.env` file.
  pub fn from_env() -> Self {
    dotenv::dotenv().ok();

    let mut config = Self::default();
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
      config.port = port;
    }
    config
  }
}
