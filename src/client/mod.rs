//! Client side: one logical connection to a broker that survives transport loss.
//!
//! [`SocketClient`] owns a single connection and drives it through an explicit
//! state machine:
//!
//! ```text
//! Closed -> Connecting -> Open -> Reconnecting -> Connecting -> ...
//!                           \-> Closing -> Closed
//! ```
//!
//! A background task runs the machine. It opens the transport through a
//! [`Connector`], pumps inbound frames into the event table, and after an
//! unexpected close waits a fixed interval before trying again, up to
//! `reconnect_attempts` consecutive times. [`SocketClient::close`] cancels the
//! task wherever it is, including during the backoff sleep.
//!
//! ## Example Usage
//! ```no_run
//! use roomcast::{ClientConfig, SocketClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> roomcast::Result<()> {
//!     let client = SocketClient::new(ClientConfig::new("localhost:3000"))?;
//!     client.on("chat", |message| println!("chat: {}", message));
//!     client.connect().await?;
//!
//!     client.emit("chat", json!({ "text": "hello" }))?;
//!     let answer = client.request("sum", json!([1, 2])).await?;
//!     println!("sum = {}", answer);
//!     Ok(())
//! }
//! ```

use crate::{
  config::ClientConfig,
  dispatcher::{EventDispatcher, HandlerId},
  error::{Result, SocketError},
  protocol::{
    random_token, response_event, websocket_url, Envelope, CONNECTED, CORRELATION_ID_LENGTH,
    DISCONNECTED, ERROR,
  },
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
  time::Duration,
};
use tokio::sync::{mpsc, oneshot};

mod websocket;

pub use websocket::WebSocketConnector;

/// Frame handed to a transport for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
  Text(String),
  Close,
}

/// Event reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
  Text(String),
  Error(String),
  Closed,
}

/// An open transport, as a pair of channels.
///
/// Dropping `outbound` or sending [`Outbound::Close`] shuts the transport
/// down; the transport reports its end with [`Inbound::Closed`] or by
/// dropping its sender.
pub struct Link {
  pub outbound: mpsc::UnboundedSender<Outbound>,
  pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens transports for a [`SocketClient`].
#[async_trait]
pub trait Connector: Send + Sync {
  async fn open(&self, url: &str, protocols: &[String]) -> Result<Link>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Connecting,
  Open,
  Reconnecting,
  Closing,
  Closed,
}

type Waiter = oneshot::Sender<std::result::Result<ConnectionState, String>>;

struct Core {
  state: ConnectionState,
  /// Consecutive reconnect attempts since the last successful open
  attempts: u32,
  /// Set by `close()`; no reconnect is scheduled while it holds
  closed: bool,
  /// Bumped for every background task so a stale task cannot touch a newer one's state
  generation: u64,
  outbound: Option<mpsc::UnboundedSender<Outbound>>,
  cancel: Option<oneshot::Sender<()>>,
  waiters: Vec<Waiter>,
}

/// A correlated emit still waiting for its answer.
struct PendingResponse {
  event: String,
  handler: HandlerId,
  fail: Box<dyn FnOnce(SocketError) + Send>,
}

struct Shared {
  config: ClientConfig,
  url: String,
  connector: Arc<dyn Connector>,
  core: Mutex<Core>,
  events: Mutex<EventDispatcher<Value>>,
  /// Keyed by the `event#id` name the answer arrives under
  pending: Mutex<HashMap<String, PendingResponse>>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
  Lost,
  Cancelled,
}

/// A reconnecting, named-event connection to a broker.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct SocketClient {
  shared: Arc<Shared>,
}

impl SocketClient {
  /// Create a client that connects over WebSocket.
  pub fn new(config: ClientConfig) -> Result<Self> {
    Self::with_connector(config, WebSocketConnector)
  }

  /// Create a client that opens its transport through `connector`.
  pub fn with_connector(config: ClientConfig, connector: impl Connector + 'static) -> Result<Self> {
    let url = websocket_url(&config.url)?;
    Ok(Self {
      shared: Arc::new(Shared {
        config,
        url,
        connector: Arc::new(connector),
        core: Mutex::new(Core {
          state: ConnectionState::Closed,
          attempts: 0,
          closed: false,
          generation: 0,
          outbound: None,
          cancel: None,
          waiters: Vec::new(),
        }),
        events: Mutex::new(EventDispatcher::new()),
        pending: Mutex::new(HashMap::new()),
      }),
    })
  }

  /// Normalised URL the client connects to.
  pub fn url(&self) -> &str {
    &self.shared.url
  }

  pub fn state(&self) -> ConnectionState {
    self.shared.lock_core().state
  }

  pub fn is_open(&self) -> bool {
    self.state() == ConnectionState::Open
  }

  /// Open the connection.
  ///
  /// Resolves with [`ConnectionState::Open`] once connected, or with
  /// [`ConnectionState::Closed`] if every reconnect attempt failed or
  /// [`close`](Self::close) was called first. With reconnection disabled a
  /// failed open is returned as [`SocketError::Connect`]. Calling this while
  /// already open returns immediately; calling it while a connection attempt
  /// is in flight waits for that attempt.
  pub async fn connect(&self) -> Result<ConnectionState> {
    let waiter = {
      let mut core = self.shared.lock_core();
      match core.state {
        ConnectionState::Open => return Ok(ConnectionState::Open),
        ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        ConnectionState::Closing | ConnectionState::Closed => {
          core.generation += 1;
          core.closed = false;
          core.attempts = 0;
          core.state = ConnectionState::Connecting;

          let (cancel_tx, cancel_rx) = oneshot::channel();
          core.cancel = Some(cancel_tx);
          tokio::spawn(self.shared.clone().run(core.generation, cancel_rx));
        }
      }
      let (tx, rx) = oneshot::channel();
      core.waiters.push(tx);
      rx
    };

    match waiter.await {
      Ok(Ok(state)) => Ok(state),
      Ok(Err(reason)) => Err(SocketError::Connect(reason)),
      Err(_) => Ok(ConnectionState::Closed),
    }
  }

  /// Close the connection and stop reconnecting.
  ///
  /// A pending [`connect`](Self::connect) resolves with
  /// [`ConnectionState::Closed`] and `disconnected` is dispatched once the
  /// background task has wound down.
  pub fn close(&self) {
    let mut core = self.shared.lock_core();
    core.closed = true;
    if core.state == ConnectionState::Closed {
      return;
    }
    core.state = ConnectionState::Closing;
    if let Some(outbound) = core.outbound.take() {
      let _ = outbound.send(Outbound::Close);
    }
    if let Some(cancel) = core.cancel.take() {
      let _ = cancel.send(());
    }
  }

  /// Subscribe to an event, including `connected`, `disconnected` and `error`.
  pub fn on<F>(&self, event: &str, callback: F) -> HandlerId
  where
    F: Fn(Value) + Send + Sync + 'static,
  {
    self.shared.lock_events().register(event, callback)
  }

  /// Remove a subscription made with [`on`](Self::on).
  pub fn off(&self, handler: &HandlerId) -> bool {
    self.shared.lock_events().unregister(handler)
  }

  /// Send an event. Fails with [`SocketError::NotOpen`] unless connected.
  pub fn emit<T: Serialize>(&self, event: &str, message: T) -> Result<()> {
    let envelope = Envelope::new(event, serde_json::to_value(message)?);
    self.shared.send(&envelope)
  }

  /// Send an event and have `callback` receive the peer's answer.
  ///
  /// The callback runs exactly once: with the answer, with
  /// [`SocketError::ResponseTimeout`] if a response timeout is configured
  /// and expires first, or with [`SocketError::ResponseDropped`] if the
  /// connection goes away before the answer arrives. If the send itself
  /// fails the error is returned and the callback is never called.
  pub fn emit_with_response<T, F>(&self, event: &str, message: T, callback: F) -> Result<()>
  where
    T: Serialize,
    F: FnOnce(Result<Value>) + Send + 'static,
  {
    let message = serde_json::to_value(message)?;
    let correlation_id = random_token(CORRELATION_ID_LENGTH);
    let answer_event = response_event(event, &correlation_id);
    let slot = Arc::new(Mutex::new(Some(callback)));

    let handler = {
      let slot = slot.clone();
      let shared = Arc::downgrade(&self.shared);
      let key = answer_event.clone();
      self
        .shared
        .lock_events()
        .register_once(&answer_event, move |answer| {
          if let Some(shared) = shared.upgrade() {
            shared.lock_pending().remove(&key);
          }
          if let Some(callback) = take_slot(&slot) {
            callback(Ok(answer));
          }
        })
    };

    let fail = {
      let slot = slot.clone();
      Box::new(move |error: SocketError| {
        if let Some(callback) = take_slot(&slot) {
          callback(Err(error));
        }
      })
    };
    let pending = PendingResponse {
      event: event.to_string(),
      handler: handler.clone(),
      fail,
    };

    let envelope = Envelope::new(event, message).with_response_id(correlation_id);
    if let Err(e) = self.shared.send_tracked(&envelope, answer_event, pending) {
      self.shared.lock_events().unregister(&handler);
      return Err(e);
    }

    if let Some(after) = self.shared.config.response_timeout() {
      self.expire_response(handler, event.to_string(), after, slot);
    }
    Ok(())
  }

  /// Send an event and wait for the peer's answer.
  pub async fn request<T: Serialize>(&self, event: &str, message: T) -> Result<Value> {
    let (tx, rx) = oneshot::channel();
    self.emit_with_response(event, message, move |answer| {
      let _ = tx.send(answer);
    })?;
    rx.await
      .unwrap_or_else(|_| Err(SocketError::ResponseDropped(event.to_string())))
  }

  fn expire_response<F>(
    &self,
    handler: HandlerId,
    event: String,
    after: Duration,
    slot: Arc<Mutex<Option<F>>>,
  ) where
    F: FnOnce(Result<Value>) + Send + 'static,
  {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      tracing::warn!("No runtime available, response to '{}' will not time out", event);
      return;
    };
    let shared = Arc::downgrade(&self.shared);
    runtime.spawn(async move {
      tokio::time::sleep(after).await;
      let Some(shared) = shared.upgrade() else {
        return;
      };
      // Already answered or dropped if the handler is gone.
      if !shared.lock_events().unregister(&handler) {
        return;
      }
      shared.lock_pending().remove(handler.event());
      if let Some(callback) = take_slot(&slot) {
        callback(Err(SocketError::ResponseTimeout { event, after }));
      }
    });
  }
}

fn take_slot<F>(slot: &Mutex<Option<F>>) -> Option<F> {
  slot.lock().expect("response slot lock poisoned").take()
}

impl Shared {
  fn lock_core(&self) -> MutexGuard<'_, Core> {
    self.core.lock().expect("SocketClient state lock poisoned")
  }

  fn lock_events(&self) -> MutexGuard<'_, EventDispatcher<Value>> {
    self.events.lock().expect("SocketClient event lock poisoned")
  }

  fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingResponse>> {
    self.pending.lock().expect("SocketClient pending lock poisoned")
  }

  /// Fail every outstanding correlated emit; the peer that would have
  /// answered it is gone.
  fn drop_pending(&self) {
    let pending: Vec<_> = self.lock_pending().drain().map(|(_, entry)| entry).collect();
    for entry in pending {
      self.lock_events().unregister(&entry.handler);
      tracing::debug!("Dropping unanswered '{}'", entry.event);
      (entry.fail)(SocketError::ResponseDropped(entry.event));
    }
  }

  fn send(&self, envelope: &Envelope) -> Result<()> {
    let text = envelope.encode()?;
    let core = self.lock_core();
    if core.state != ConnectionState::Open {
      return Err(SocketError::NotOpen);
    }
    let outbound = core.outbound.as_ref().ok_or(SocketError::NotOpen)?;
    outbound
      .send(Outbound::Text(text))
      .map_err(|_| SocketError::NotOpen)
  }

  /// Send a correlated emit and start tracking it, atomically with respect
  /// to the connection going away.
  fn send_tracked(&self, envelope: &Envelope, key: String, pending: PendingResponse) -> Result<()> {
    let text = envelope.encode()?;
    let core = self.lock_core();
    if core.state != ConnectionState::Open {
      return Err(SocketError::NotOpen);
    }
    let outbound = core.outbound.as_ref().ok_or(SocketError::NotOpen)?;
    outbound
      .send(Outbound::Text(text))
      .map_err(|_| SocketError::NotOpen)?;
    self.lock_pending().insert(key, pending);
    Ok(())
  }

  fn dispatch(&self, event: &str, payload: Value) {
    let callbacks = self.lock_events().take_callbacks(event);
    for callback in callbacks {
      callback(payload.clone());
    }
  }

  /// Background task driving one connection lifecycle.
  async fn run(self: Arc<Self>, generation: u64, mut cancel: oneshot::Receiver<()>) {
    loop {
      let opened = tokio::select! {
        result = self.connector.open(&self.url, &self.config.protocols) => result,
        _ = &mut cancel => return self.finish(generation, None),
      };

      let failure = match opened {
        Ok(link) => {
          if self.session(generation, link, &mut cancel).await == SessionEnd::Cancelled {
            return self.finish(generation, None);
          }
          tracing::warn!("Connection to {} lost", self.url);
          self.drop_pending();
          None
        }
        Err(e) => {
          tracing::warn!("Failed to connect to {}: {}", self.url, e);
          Some(e.to_string())
        }
      };

      let Some(delay) = self.schedule_retry(generation) else {
        // Only a caller that opted out of reconnecting sees the raw failure.
        let error = failure.filter(|_| !self.config.reconnect);
        return self.finish(generation, error);
      };

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = &mut cancel => return self.finish(generation, None),
      }

      if !self.begin_attempt(generation) {
        return self.finish(generation, None);
      }
    }
  }

  /// Pump one open transport until it closes or the task is cancelled.
  async fn session(
    &self,
    generation: u64,
    link: Link,
    cancel: &mut oneshot::Receiver<()>,
  ) -> SessionEnd {
    let Link {
      outbound,
      mut inbound,
    } = link;
    if !self.mark_open(generation, outbound) {
      return SessionEnd::Cancelled;
    }
    tracing::info!("Connected to {}", self.url);
    self.dispatch(CONNECTED, Value::Null);

    loop {
      tokio::select! {
        frame = inbound.recv() => match frame {
          Some(Inbound::Text(text)) => self.handle_text(&text),
          Some(Inbound::Error(message)) => {
            tracing::warn!("Transport error on {}: {}", self.url, message);
            self.dispatch(ERROR, Value::String(message));
          }
          Some(Inbound::Closed) | None => break,
        },
        _ = &mut *cancel => return SessionEnd::Cancelled,
      }
    }

    let mut core = self.lock_core();
    if core.generation != generation || core.closed {
      return SessionEnd::Cancelled;
    }
    core.outbound = None;
    SessionEnd::Lost
  }

  fn handle_text(&self, text: &str) {
    if !self.config.silent {
      tracing::debug!("Received from {}: {}", self.url, text);
    }
    match Envelope::decode(text) {
      Ok(envelope) => self.dispatch(&envelope.event, envelope.message),
      Err(e) => tracing::warn!("Dropping unparsable message from {}: {}", self.url, e),
    }
  }

  fn mark_open(&self, generation: u64, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
    let mut core = self.lock_core();
    if core.generation != generation || core.closed {
      let _ = outbound.send(Outbound::Close);
      return false;
    }
    core.state = ConnectionState::Open;
    core.attempts = 0;
    core.outbound = Some(outbound);
    for waiter in core.waiters.drain(..) {
      let _ = waiter.send(Ok(ConnectionState::Open));
    }
    true
  }

  /// Count a reconnect attempt and return the delay before it, or `None`
  /// if the connection should be given up.
  fn schedule_retry(&self, generation: u64) -> Option<Duration> {
    let mut core = self.lock_core();
    if core.generation != generation
      || core.closed
      || !self.config.reconnect
      || core.attempts >= self.config.reconnect_attempts
    {
      return None;
    }
    core.attempts += 1;
    core.state = ConnectionState::Reconnecting;
    tracing::info!(
      "Reconnecting to {} in {:?} (attempt {}/{})",
      self.url,
      self.config.reconnect_interval(),
      core.attempts,
      self.config.reconnect_attempts
    );
    Some(self.config.reconnect_interval())
  }

  fn begin_attempt(&self, generation: u64) -> bool {
    let mut core = self.lock_core();
    if core.generation != generation || core.closed {
      return false;
    }
    core.state = ConnectionState::Connecting;
    true
  }

  /// Settle the lifecycle: move to `Closed`, announce it, release waiters.
  fn finish(&self, generation: u64, error: Option<String>) {
    let waiters = {
      let mut core = self.lock_core();
      if core.generation != generation {
        return;
      }
      core.state = ConnectionState::Closed;
      core.cancel = None;
      if let Some(outbound) = core.outbound.take() {
        let _ = outbound.send(Outbound::Close);
      }
      std::mem::take(&mut core.waiters)
    };

    tracing::info!("Disconnected from {}", self.url);
    self.drop_pending();
    self.dispatch(DISCONNECTED, Value::Null);

    for waiter in waiters {
      let outcome = match &error {
        Some(reason) => Err(reason.clone()),
        None => Ok(ConnectionState::Closed),
      };
      let _ = waiter.send(outcome);
    }
  }
}
