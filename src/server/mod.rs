//! Server side: the broker owning every connected client and every room.
//!
//! [`Broker`] is a cheap-to-clone handle around one registry. Connections
//! arrive through the axum accept layer in [`transport`], which asks the
//! `guest` hook whether to upgrade, registers the client, and feeds its
//! frames back through [`Broker::handle_message`]. Other accept layers can
//! drive the same entry points ([`Broker::admit`], [`Broker::register`],
//! [`Broker::handle_message`], [`Broker::handle_error`],
//! [`Broker::handle_close`]) with their own [`ClientTransport`].
//!
//! ## Example Usage
//! ```no_run
//! use roomcast::Broker;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> roomcast::Result<()> {
//!     let broker = Broker::default();
//!
//!     broker.on_guest(|_id, protocols| async move { protocols.iter().any(|p| p == "chat") });
//!
//!     let rooms = broker.clone();
//!     broker.on_connected(move |client| {
//!         let _ = rooms.get_room("lobby").add_client(client.id());
//!         client.on("sum", |message| {
//!             let numbers: Vec<i64> = serde_json::from_value(message).ok()?;
//!             Some(Value::from(numbers.iter().sum::<i64>()))
//!         });
//!     });
//!
//!     broker.emit("announcement", json!({ "text": "hello" }))?;
//!     broker.listen("0.0.0.0:3000").await
//! }
//! ```

use crate::{
  config::ServerConfig,
  dispatcher::{EventDispatcher, HandlerId},
  error::{Result, SocketError, TransportError},
  protocol::{random_token, Envelope, CONNECTED, DISCONNECTED, ERROR},
  room::RoomRegistry,
};
use axum::Router;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::{
  future::Future,
  pin::Pin,
  sync::{Arc, Mutex, MutexGuard},
};
use tokio::{net::TcpListener, sync::watch};

mod handle;
pub mod transport;

pub use handle::{Room, ServerClient};
pub use transport::ClientTransport;

/// What a client subscription hands back for one inbound message.
pub(crate) enum Answer {
  Now(Option<Value>),
  Later(BoxFuture<'static, Option<Value>>),
}

pub(crate) type ClientEvents = Arc<Mutex<EventDispatcher<Value, Answer>>>;

/// Broker-side data kept for every registered client.
#[derive(Clone)]
pub(crate) struct ClientSlot {
  pub(crate) transport: Arc<dyn ClientTransport>,
  pub(crate) events: ClientEvents,
}

type GuestHook =
  Arc<dyn Fn(String, Vec<String>) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

struct Hooks {
  guest: Option<GuestHook>,
  clients: EventDispatcher<ServerClient>,
  errors: EventDispatcher<(ServerClient, TransportError)>,
}

pub(crate) struct BrokerShared {
  config: ServerConfig,
  registry: Mutex<RoomRegistry<ClientSlot>>,
  hooks: Mutex<Hooks>,
  /// Flipped to `true` once by `close()`; every serve loop watches it
  shutdown: watch::Sender<bool>,
}

impl BrokerShared {
  pub(crate) fn lock_registry(&self) -> MutexGuard<'_, RoomRegistry<ClientSlot>> {
    self.registry.lock().expect("Broker registry lock poisoned")
  }

  fn lock_hooks(&self) -> MutexGuard<'_, Hooks> {
    self.hooks.lock().expect("Broker hook lock poisoned")
  }
}

/// Frame text for a server-originated event. A null message goes out as `{}`.
pub(crate) fn outbound_text<T: Serialize>(event: &str, message: T) -> Result<String> {
  let mut message = serde_json::to_value(message)?;
  if message.is_null() {
    message = Value::Object(serde_json::Map::new());
  }
  Envelope::new(event, message).encode()
}

/// Registry of connected clients and rooms, plus lifecycle hooks.
#[derive(Clone)]
pub struct Broker {
  shared: Arc<BrokerShared>,
}

impl Broker {
  pub fn new(config: ServerConfig) -> Self {
    let (shutdown, _) = watch::channel(false);
    Self {
      shared: Arc::new(BrokerShared {
        config,
        registry: Mutex::new(RoomRegistry::new()),
        hooks: Mutex::new(Hooks {
          guest: None,
          clients: EventDispatcher::new(),
          errors: EventDispatcher::new(),
        }),
        shutdown,
      }),
    }
  }

  pub fn config(&self) -> &ServerConfig {
    &self.shared.config
  }

  /// Decide whether a connection attempt may be upgraded.
  ///
  /// The hook receives the id the client will get and the offered
  /// subprotocols. Only one guest hook is kept; setting it again replaces it.
  pub fn on_guest<F, Fut>(&self, hook: F)
  where
    F: Fn(String, Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
  {
    let hook: GuestHook = Arc::new(move |id: String, protocols: Vec<String>| {
      Box::pin(hook(id, protocols)) as Pin<Box<dyn Future<Output = bool> + Send>>
    });
    self.shared.lock_hooks().guest = Some(hook);
  }

  /// Called with every newly registered client.
  pub fn on_connected<F>(&self, callback: F) -> HandlerId
  where
    F: Fn(ServerClient) + Send + Sync + 'static,
  {
    self.shared.lock_hooks().clients.register(CONNECTED, callback)
  }

  /// Called when a client's transport closes, before its rooms are cleaned up.
  pub fn on_disconnected<F>(&self, callback: F) -> HandlerId
  where
    F: Fn(ServerClient) + Send + Sync + 'static,
  {
    self.shared.lock_hooks().clients.register(DISCONNECTED, callback)
  }

  /// Called when a client's transport reports an error.
  pub fn on_error<F>(&self, callback: F) -> HandlerId
  where
    F: Fn(ServerClient, TransportError) + Send + Sync + 'static,
  {
    self
      .shared
      .lock_hooks()
      .errors
      .register(ERROR, move |(client, error)| callback(client, error))
  }

  /// Remove a lifecycle hook.
  pub fn off(&self, handler: &HandlerId) -> bool {
    let mut hooks = self.shared.lock_hooks();
    hooks.clients.unregister(handler) || hooks.errors.unregister(handler)
  }

  /// Send an event to every registered client whose transport is open.
  pub fn emit<T: Serialize>(&self, event: &str, message: T) -> Result<()> {
    let text = outbound_text(event, message)?;
    let transports: Vec<_> = self
      .shared
      .lock_registry()
      .clients()
      .map(|(_, record)| record.data.transport.clone())
      .collect();

    for transport in transports.iter().filter(|t| t.is_open()) {
      transport.send(text.clone());
    }
    Ok(())
  }

  pub fn get_client(&self, id: &str) -> Option<ServerClient> {
    let registry = self.shared.lock_registry();
    let record = registry.client(id)?;
    Some(ServerClient::new(id.to_string(), &record.data, self.shared.clone()))
  }

  pub fn clients(&self) -> Vec<ServerClient> {
    self
      .shared
      .lock_registry()
      .clients()
      .map(|(id, record)| ServerClient::new(id.clone(), &record.data, self.shared.clone()))
      .collect()
  }

  pub fn client_count(&self) -> usize {
    self.shared.lock_registry().client_count()
  }

  /// The room called `name`, created empty if it does not exist.
  pub fn get_room(&self, name: &str) -> Room {
    if self.shared.lock_registry().ensure_room(name) {
      tracing::debug!("Created room {}", name);
    }
    Room::new(name.to_string(), self.shared.clone())
  }

  pub fn room_names(&self) -> Vec<String> {
    self.shared.lock_registry().room_names()
  }

  /// Delete a room, removing it from every member's room list.
  ///
  /// Unknown names are ignored.
  pub fn remove_room(&self, name: &str) {
    match self.shared.lock_registry().remove_room(name) {
      Some(members) => tracing::debug!("Removed room {} ({} members)", name, members.len()),
      None => tracing::debug!("Room {} does not exist, nothing to remove", name),
    }
  }

  /// Stop accepting connections.
  ///
  /// Stops every running serve loop, and any started later returns at once.
  /// Open client connections stay up unless
  /// [`ServerConfig::close_clients_on_shutdown`] is set.
  pub fn close(&self) {
    if !self.shared.shutdown.send_replace(true) {
      tracing::info!("Broker shutting down");
    }
    if self.shared.config.close_clients_on_shutdown {
      for client in self.clients() {
        client.close(Some(1001), Some("server shutting down"));
      }
    }
  }

  /// Mint an id for a connection attempt and ask the guest hook about it.
  ///
  /// Returns the id if the connection may proceed.
  pub async fn admit(&self, protocols: &[String]) -> Option<String> {
    let id = self.fresh_client_id();
    let guest = self.shared.lock_hooks().guest.clone();
    if let Some(guest) = guest {
      if !guest(id.clone(), protocols.to_vec()).await {
        tracing::warn!("Refused guest {} (protocols {:?})", id, protocols);
        return None;
      }
    }
    Some(id)
  }

  fn fresh_client_id(&self) -> String {
    let registry = self.shared.lock_registry();
    loop {
      let id = random_token(self.shared.config.client_id_length);
      if !registry.contains_client(&id) {
        return id;
      }
    }
  }

  /// Register an accepted connection and announce it to `connected` hooks.
  pub fn register(&self, id: String, transport: Arc<dyn ClientTransport>) -> Result<ServerClient> {
    let slot = ClientSlot {
      transport,
      events: Arc::new(Mutex::new(EventDispatcher::new())),
    };
    let client = ServerClient::new(id.clone(), &slot, self.shared.clone());
    self.shared.lock_registry().insert_client(&id, slot)?;

    tracing::info!("Client {} connected", id);
    self.dispatch_client_hook(CONNECTED, &client);
    Ok(client)
  }

  /// Route one inbound frame to the client's subscriptions.
  ///
  /// If the frame carries a correlation id, the first answer in subscription
  /// order is sent back to the same client. Answers from async subscriptions
  /// are awaited on a spawned task, so a slow one never blocks the reader.
  pub fn handle_message(&self, client_id: &str, text: &str) -> Result<()> {
    let client = self
      .get_client(client_id)
      .ok_or_else(|| SocketError::ClientNotFound(client_id.to_string()))?;
    let envelope = Envelope::decode(text)?;
    tracing::debug!("Client {} sent '{}'", client_id, envelope.event);

    let answers: Vec<Answer> = client
      .take_callbacks(&envelope.event)
      .into_iter()
      .map(|callback| callback(envelope.message.clone()))
      .collect();

    let mut answered = false;
    let mut pending = Vec::new();
    let mut answers = answers.into_iter();
    while let Some(answer) = answers.next() {
      match answer {
        Answer::Now(value) => {
          if !answered {
            answered = reply_with(&client, &envelope, value)?;
          }
        }
        Answer::Later(future) => {
          pending.push(Answer::Later(future));
          pending.extend(answers.by_ref());
        }
      }
    }

    if !pending.is_empty() {
      settle_later(client, envelope, answered, pending);
    }
    Ok(())
  }

  /// Report a transport failure to `error` hooks. The client stays registered.
  pub fn handle_error(&self, client_id: &str, error: TransportError) {
    tracing::warn!("Transport error on client {}: {}", client_id, error);
    let Some(client) = self.get_client(client_id) else {
      return;
    };
    let callbacks = self.shared.lock_hooks().errors.take_callbacks(ERROR);
    for callback in callbacks {
      callback((client.clone(), error.clone()));
    }
  }

  /// Forget a closed connection: announce it, then drop it from every room.
  pub fn handle_close(&self, client_id: &str) {
    let Some(client) = self.get_client(client_id) else {
      return;
    };
    self.dispatch_client_hook(DISCONNECTED, &client);

    if let Some(record) = self.shared.lock_registry().remove_client(client_id) {
      tracing::info!(
        "Client {} disconnected (left {} rooms)",
        client_id,
        record.rooms().len()
      );
    }
  }

  fn dispatch_client_hook(&self, event: &str, client: &ServerClient) {
    let callbacks = self.shared.lock_hooks().clients.take_callbacks(event);
    for callback in callbacks {
      callback(client.clone());
    }
  }

  /// Router upgrading WebSocket requests; everything else gets 501.
  pub fn router(&self) -> Router {
    self.router_with_fallback(Router::new().fallback(transport::not_implemented))
  }

  /// Router upgrading WebSocket requests; everything else goes to `next`.
  pub fn router_with_fallback(&self, next: Router) -> Router {
    transport::router(self.clone(), next)
  }

  /// Serve on an already bound listener until [`close`](Self::close) is called.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    self.serve_router(listener, self.router()).await
  }

  /// Like [`serve`](Self::serve), delegating non-upgrade requests to `next`.
  pub async fn serve_with_fallback(&self, listener: TcpListener, next: Router) -> Result<()> {
    self.serve_router(listener, self.router_with_fallback(next)).await
  }

  /// Bind `addr` and serve until [`close`](Self::close) is called.
  pub async fn listen(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve(listener).await
  }

  /// Bind `0.0.0.0` on the configured port and serve.
  pub async fn listen_on_port(&self) -> Result<()> {
    self.listen(&format!("0.0.0.0:{}", self.shared.config.port)).await
  }

  async fn serve_router(&self, listener: TcpListener, router: Router) -> Result<()> {
    let mut shutdown = self.shared.shutdown.subscribe();
    let closed = *shutdown.borrow_and_update();
    if closed {
      tracing::info!("Broker already closed, not serving");
      return Ok(());
    }

    tracing::info!("WebSocket server listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
      .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|closed| *closed).await;
      })
      .await?;
    tracing::info!("WebSocket server stopped");
    Ok(())
  }
}

/// Send `value` as the answer to `envelope` if it asked for one.
fn reply_with(client: &ServerClient, envelope: &Envelope, value: Option<Value>) -> Result<bool> {
  match value.and_then(|value| envelope.reply(value)) {
    Some(reply) => {
      client.send_envelope(&reply)?;
      Ok(true)
    }
    None => Ok(false),
  }
}

/// Drive the answers that were not ready inline, in subscription order.
fn settle_later(client: ServerClient, envelope: Envelope, mut answered: bool, pending: Vec<Answer>) {
  let Ok(runtime) = tokio::runtime::Handle::try_current() else {
    tracing::warn!(
      "No runtime available, async answers to '{}' from {} are dropped",
      envelope.event,
      client.id()
    );
    return;
  };
  runtime.spawn(async move {
    for answer in pending {
      let value = match answer {
        Answer::Now(value) => value,
        Answer::Later(future) => future.await,
      };
      if answered {
        continue;
      }
      match reply_with(&client, &envelope, value) {
        Ok(sent) => answered = sent,
        Err(e) => {
          tracing::warn!("Failed to answer '{}' for {}: {}", envelope.event, client.id(), e);
          answered = true;
        }
      }
    }
  });
}

impl Default for Broker {
  fn default() -> Self {
    Self::new(ServerConfig::default())
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use serde_json::json;
  use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
  };

  /// In-memory transport recording everything the broker sends.
  #[derive(Default)]
  pub(crate) struct RecordingTransport {
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
    close_frame: Mutex<Option<(Option<u16>, Option<String>)>>,
  }

  impl RecordingTransport {
    pub(crate) fn sent(&self) -> Vec<Value> {
      self
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|text| serde_json::from_str(text).unwrap())
        .collect()
    }

    pub(crate) fn shut(&self) {
      self.closed.store(true, Ordering::SeqCst);
    }
  }

  impl ClientTransport for RecordingTransport {
    fn is_open(&self) -> bool {
      !self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) {
      self.sent.lock().unwrap().push(text);
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) {
      self.shut();
      *self.close_frame.lock().unwrap() = Some((code, reason));
    }
  }

  pub(crate) fn connect(broker: &Broker, id: &str) -> (ServerClient, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let client = broker.register(id.to_string(), transport.clone()).unwrap();
    (client, transport)
  }

  #[tokio::test]
  async fn refused_guest_never_becomes_a_client() {
    let broker = Broker::default();
    let connected = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));

    {
      let seen = seen.clone();
      broker.on_guest(move |id, protocols| {
        *seen.lock().unwrap() = Some((id, protocols));
        async { false }
      });
    }
    {
      let connected = connected.clone();
      broker.on_connected(move |_| {
        connected.fetch_add(1, Ordering::SeqCst);
      });
    }

    assert!(broker.admit(&["chat".to_string()]).await.is_none());
    assert_eq!(broker.client_count(), 0);
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    let (id, protocols) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(id.len(), 16);
    assert_eq!(protocols, vec!["chat".to_string()]);
  }

  #[tokio::test]
  async fn admit_without_guest_hook_accepts() {
    let broker = Broker::new(ServerConfig {
      client_id_length: 8,
      ..ServerConfig::default()
    });
    let id = broker.admit(&[]).await.unwrap();
    assert_eq!(id.len(), 8);
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
  }

  #[test]
  fn register_announces_and_refuses_duplicates() {
    let broker = Broker::default();
    let announced = Arc::new(Mutex::new(Vec::new()));
    {
      let announced = announced.clone();
      broker.on_connected(move |client| announced.lock().unwrap().push(client.id().to_string()));
    }

    connect(&broker, "a");
    let duplicate = broker.register("a".into(), Arc::new(RecordingTransport::default()));
    assert!(matches!(duplicate, Err(SocketError::DuplicateClient(_))));
    assert_eq!(*announced.lock().unwrap(), vec!["a".to_string()]);
    assert!(broker.get_client("a").is_some());
  }

  #[test]
  fn broadcast_skips_closed_transports() {
    let broker = Broker::default();
    let (_, a) = connect(&broker, "a");
    let (_, b) = connect(&broker, "b");
    let (_, c) = connect(&broker, "c");
    b.shut();

    broker.emit("news", json!({ "headline": "hi" })).unwrap();
    broker.emit("ping", Value::Null).unwrap();

    let expected = vec![
      json!({ "event": "news", "message": { "headline": "hi" } }),
      json!({ "event": "ping", "message": {} }),
    ];
    assert_eq!(a.sent(), expected);
    assert_eq!(c.sent(), expected);
    assert!(b.sent().is_empty());
  }

  #[test]
  fn correlated_message_gets_exactly_one_reply() {
    let broker = Broker::default();
    let (client, transport) = connect(&broker, "a");
    client.on("sum", |message| {
      let numbers: Vec<i64> = serde_json::from_value(message).ok()?;
      Some(json!(numbers.iter().sum::<i64>()))
    });
    client.on("sum", |_| Some(json!("second answer")));

    broker
      .handle_message("a", r#"{"event":"sum","message":[1,2],"responseEventId":"r1"}"#)
      .unwrap();
    assert_eq!(transport.sent(), vec![json!({ "event": "sum#r1", "message": 3 })]);
  }

  async fn next_sent(transport: &RecordingTransport) -> Vec<Value> {
    tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        let sent = transport.sent();
        if !sent.is_empty() {
          return sent;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn async_subscription_answers_after_awaiting() {
    let broker = Broker::default();
    let (client, transport) = connect(&broker, "a");
    client.on_async("lookup", |message| async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Some(json!({ "found": message }))
    });

    broker
      .handle_message("a", r#"{"event":"lookup","message":"key","responseEventId":"r9"}"#)
      .unwrap();
    assert!(transport.sent().is_empty());
    assert_eq!(
      next_sent(&transport).await,
      vec![json!({ "event": "lookup#r9", "message": { "found": "key" } })]
    );
  }

  #[tokio::test]
  async fn earlier_async_answer_wins_over_later_sync_one() {
    let broker = Broker::default();
    let (client, transport) = connect(&broker, "a");
    client.on_async("pick", |_| async { Some(json!("async")) });
    client.on("pick", |_| Some(json!("sync")));

    broker
      .handle_message("a", r#"{"event":"pick","responseEventId":"r1"}"#)
      .unwrap();
    let sent = next_sent(&transport).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sent, vec![json!({ "event": "pick#r1", "message": "async" })]);
    assert_eq!(transport.sent().len(), 1);
  }

  #[tokio::test]
  async fn sync_answer_goes_out_at_once_and_async_work_still_runs() {
    let broker = Broker::default();
    let (client, transport) = connect(&broker, "a");
    let ran = Arc::new(AtomicUsize::new(0));
    client.on("pick", |_| Some(json!("sync")));
    {
      let ran = ran.clone();
      client.on_async("pick", move |_| {
        let ran = ran.clone();
        async move {
          ran.fetch_add(1, Ordering::SeqCst);
          Some(json!("ignored"))
        }
      });
    }

    broker
      .handle_message("a", r#"{"event":"pick","responseEventId":"r1"}"#)
      .unwrap();
    assert_eq!(transport.sent(), vec![json!({ "event": "pick#r1", "message": "sync" })]);

    tokio::time::timeout(Duration::from_secs(5), async {
      while ran.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent().len(), 1);
  }

  #[test]
  fn uncorrelated_message_is_not_answered() {
    let broker = Broker::default();
    let (client, transport) = connect(&broker, "a");
    let calls = Arc::new(AtomicUsize::new(0));
    {
      let calls = calls.clone();
      client.on("sum", move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Some(json!(0))
      });
    }

    broker.handle_message("a", r#"{"event":"sum","message":[1]}"#).unwrap();
    broker.handle_message("a", r#"{"event":"unknown"}"#).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(transport.sent().is_empty());
  }

  #[test]
  fn removed_handler_is_not_called() {
    let broker = Broker::default();
    let (client, transport) = connect(&broker, "a");
    let handler = client.on("sum", |_| Some(json!(1)));
    assert!(client.remove(&handler));

    broker
      .handle_message("a", r#"{"event":"sum","message":[],"responseEventId":"r"}"#)
      .unwrap();
    assert!(transport.sent().is_empty());
  }

  #[test]
  fn bad_frames_and_unknown_clients_are_errors() {
    let broker = Broker::default();
    connect(&broker, "a");
    assert!(matches!(
      broker.handle_message("ghost", r#"{"event":"x"}"#),
      Err(SocketError::ClientNotFound(_))
    ));
    assert!(matches!(
      broker.handle_message("a", "not json"),
      Err(SocketError::Serialization(_))
    ));
  }

  #[test]
  fn close_cleans_up_rooms_after_announcing() {
    let broker = Broker::default();
    let (client, _) = connect(&broker, "a");
    connect(&broker, "b");
    broker.get_room("x").add_client("a").unwrap();
    broker.get_room("x").add_client("b").unwrap();
    broker.get_room("y").add_client("a").unwrap();

    let rooms_at_disconnect = Arc::new(Mutex::new(Vec::new()));
    {
      let rooms_at_disconnect = rooms_at_disconnect.clone();
      broker.on_disconnected(move |client| {
        *rooms_at_disconnect.lock().unwrap() = client.rooms();
      });
    }

    broker.handle_close("a");
    assert_eq!(*rooms_at_disconnect.lock().unwrap(), vec!["x", "y"]);
    assert!(broker.get_client("a").is_none());
    assert!(client.rooms().is_empty());
    assert_eq!(broker.get_room("x").clients(), vec!["b"]);
    assert!(broker.get_room("y").clients().is_empty());
    broker.shared.lock_registry().assert_mirrored();

    // Closing twice is harmless.
    broker.handle_close("a");
  }

  #[test]
  fn transport_errors_reach_hooks_without_closing() {
    let broker = Broker::default();
    connect(&broker, "a");
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
      let errors = errors.clone();
      broker.on_error(move |client, error| {
        errors.lock().unwrap().push((client.id().to_string(), error.message));
      });
    }

    broker.handle_error("a", TransportError::new("reset"));
    assert_eq!(*errors.lock().unwrap(), vec![("a".to_string(), "reset".to_string())]);
    assert!(broker.get_client("a").is_some());
  }

  #[test]
  fn off_removes_lifecycle_hooks() {
    let broker = Broker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
      let calls = calls.clone();
      broker.on_connected(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
      })
    };
    assert!(broker.off(&handler));
    assert!(!broker.off(&handler));

    connect(&broker, "a");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn remove_room_strips_members_and_allows_fresh_room() {
    let broker = Broker::default();
    let (a, _) = connect(&broker, "a");
    let (b, _) = connect(&broker, "b");
    a.add_room("lobby").unwrap_err();
    broker.get_room("x");
    a.add_room("x").unwrap();
    b.add_room("x").unwrap();

    broker.remove_room("x");
    assert!(a.rooms().is_empty());
    assert!(b.rooms().is_empty());
    assert!(!broker.room_names().contains(&"x".to_string()));

    let fresh = broker.get_room("x");
    assert!(fresh.clients().is_empty());

    broker.remove_room("never-created");
  }

  #[tokio::test]
  async fn serve_after_close_returns_immediately() {
    let broker = Broker::default();
    broker.close();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let served = tokio::time::timeout(Duration::from_secs(1), broker.serve(listener)).await;
    assert!(matches!(served, Ok(Ok(()))));
  }

  #[tokio::test]
  async fn close_stops_every_serve_loop() {
    let broker = Broker::default();
    let mut servers = Vec::new();
    for _ in 0..2 {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let broker = broker.clone();
      servers.push(tokio::spawn(async move { broker.serve(listener).await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.close();
    broker.close();
    for server in servers {
      let stopped = tokio::time::timeout(Duration::from_secs(5), server).await;
      assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }
  }

  #[test]
  fn close_leaves_clients_open_by_default() {
    let broker = Broker::default();
    let (_, transport) = connect(&broker, "a");
    broker.close();
    assert!(transport.is_open());
  }

  #[test]
  fn close_can_close_every_client() {
    let broker = Broker::new(ServerConfig {
      close_clients_on_shutdown: true,
      ..ServerConfig::default()
    });
    let (_, transport) = connect(&broker, "a");
    broker.close();
    assert!(!transport.is_open());
    assert_eq!(
      *transport.close_frame.lock().unwrap(),
      Some((Some(1001), Some("server shutting down".to_string())))
    );
  }
}
