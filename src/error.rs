use std::time::Duration;
use thiserror::Error;

/// Failure reported by a connection's underlying transport.
///
/// Delivered through the `error` lifecycle hook; it never closes the
/// connection on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
  pub message: String,
}

impl TransportError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

#[derive(Debug, Error)]
pub enum SocketError {
  #[error("Connection is not open")]
  NotOpen,

  #[error("Room {0} not found")]
  RoomNotFound(String),

  #[error("Client {0} not found")]
  ClientNotFound(String),

  #[error("Client id {0} is already registered")]
  DuplicateClient(String),

  #[error("Failed to connect: {0}")]
  Connect(String),

  #[error("No response to '{event}' within {after:?}")]
  ResponseTimeout { event: String, after: Duration },

  #[error("Connection went away before '{0}' was answered")]
  ResponseDropped(String),

  #[error("Transport error: {0}")]
  Transport(#[from] TransportError),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("WebSocket error: {0}")]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = SocketError> = std::result::Result<T, E>;
