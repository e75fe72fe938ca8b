//! Handles the broker hands out for clients and rooms.

use super::{outbound_text, Answer, BrokerShared, ClientSlot};
use crate::{
  dispatcher::{Callback, EventDispatcher, HandlerId},
  error::{Result, SocketError},
  protocol::Envelope,
  room::Membership,
};
use serde::Serialize;
use serde_json::Value;
use std::{
  fmt,
  future::Future,
  sync::{Arc, MutexGuard},
};

/// One connected client.
///
/// The handle stays valid after the client disconnects; sends become no-ops
/// and membership calls fail with [`SocketError::ClientNotFound`].
#[derive(Clone)]
pub struct ServerClient {
  id: String,
  slot: ClientSlot,
  shared: Arc<BrokerShared>,
}

impl ServerClient {
  pub(crate) fn new(id: String, slot: &ClientSlot, shared: Arc<BrokerShared>) -> Self {
    Self {
      id,
      slot: slot.clone(),
      shared,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn is_open(&self) -> bool {
    self.slot.transport.is_open()
  }

  /// Send an event to this client. Skipped silently if its transport is not open.
  pub fn emit<T: Serialize>(&self, event: &str, message: T) -> Result<()> {
    let text = outbound_text(event, message)?;
    if self.is_open() {
      self.slot.transport.send(text);
    }
    Ok(())
  }

  pub(crate) fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
    let text = envelope.encode()?;
    if self.is_open() {
      self.slot.transport.send(text);
    }
    Ok(())
  }

  /// Subscribe to an event sent by this client.
  ///
  /// If the client asked for an answer, the first `Some` returned by any
  /// subscriber is sent back to it.
  pub fn on<F>(&self, event: &str, callback: F) -> HandlerId
  where
    F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
  {
    self
      .lock_events()
      .register(event, move |message| Answer::Now(callback(message)))
  }

  /// Like [`on`](Self::on), for subscriptions that need to await before answering.
  pub fn on_async<F, Fut>(&self, event: &str, callback: F) -> HandlerId
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Value>> + Send + 'static,
  {
    self
      .lock_events()
      .register(event, move |message| Answer::Later(Box::pin(callback(message))))
  }

  /// Remove a subscription made with [`on`](Self::on) or [`on_async`](Self::on_async).
  pub fn remove(&self, handler: &HandlerId) -> bool {
    self.lock_events().unregister(handler)
  }

  pub(crate) fn take_callbacks(&self, event: &str) -> Vec<Callback<Value, Answer>> {
    self.lock_events().take_callbacks(event)
  }

  fn lock_events(&self) -> MutexGuard<'_, EventDispatcher<Value, Answer>> {
    self
      .slot
      .events
      .lock()
      .expect("ServerClient event lock poisoned")
  }

  /// Names of the rooms this client is in, in join order.
  pub fn rooms(&self) -> Vec<String> {
    self
      .shared
      .lock_registry()
      .client(&self.id)
      .map(|record| record.rooms().to_vec())
      .unwrap_or_default()
  }

  pub fn get_rooms(&self) -> Vec<Room> {
    self
      .rooms()
      .into_iter()
      .map(|name| Room::new(name, self.shared.clone()))
      .collect()
  }

  /// Join an existing room.
  pub fn add_room(&self, name: &str) -> Result<()> {
    let membership = self.shared.lock_registry().join(&self.id, name)?;
    if membership == Membership::Unchanged {
      tracing::warn!("Client {} is already in room {}", self.id, name);
    }
    Ok(())
  }

  /// Leave a room.
  pub fn remove_room(&self, name: &str) -> Result<()> {
    let membership = self.shared.lock_registry().leave(&self.id, name)?;
    if membership == Membership::Unchanged {
      tracing::debug!("Client {} was not in room {}", self.id, name);
    }
    Ok(())
  }

  /// Close this client's connection.
  pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
    self.slot.transport.close(code, reason.map(String::from));
  }
}

impl fmt::Debug for ServerClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServerClient")
      .field("id", &self.id)
      .field("open", &self.is_open())
      .finish()
  }
}

/// A named group of clients.
#[derive(Clone)]
pub struct Room {
  name: String,
  shared: Arc<BrokerShared>,
}

impl Room {
  pub(crate) fn new(name: String, shared: Arc<BrokerShared>) -> Self {
    Self { name, shared }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Member ids in join order. Empty once the room has been removed.
  pub fn clients(&self) -> Vec<String> {
    self
      .shared
      .lock_registry()
      .members(&self.name)
      .map(<[String]>::to_vec)
      .unwrap_or_default()
  }

  pub fn get_clients(&self) -> Vec<ServerClient> {
    let registry = self.shared.lock_registry();
    let Some(members) = registry.members(&self.name) else {
      return Vec::new();
    };
    members
      .iter()
      .filter_map(|id| {
        let record = registry.client(id)?;
        Some(ServerClient::new(id.clone(), &record.data, self.shared.clone()))
      })
      .collect()
  }

  pub fn len(&self) -> usize {
    self
      .shared
      .lock_registry()
      .members(&self.name)
      .map_or(0, <[String]>::len)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Send an event to every member whose transport is open.
  pub fn emit<T: Serialize>(&self, event: &str, message: T) -> Result<()> {
    let text = outbound_text(event, message)?;
    let transports: Vec<_> = {
      let registry = self.shared.lock_registry();
      let members = registry
        .members(&self.name)
        .ok_or_else(|| SocketError::RoomNotFound(self.name.clone()))?;
      members
        .iter()
        .filter_map(|id| registry.client(id))
        .map(|record| record.data.transport.clone())
        .collect()
    };

    for transport in transports.iter().filter(|t| t.is_open()) {
      transport.send(text.clone());
    }
    Ok(())
  }

  /// Add a registered client to this room.
  pub fn add_client(&self, client_id: &str) -> Result<()> {
    let membership = self.shared.lock_registry().join(client_id, &self.name)?;
    if membership == Membership::Unchanged {
      tracing::warn!("Client {} is already in room {}", client_id, self.name);
    }
    Ok(())
  }

  /// Remove a registered client from this room.
  pub fn remove_client(&self, client_id: &str) -> Result<()> {
    let membership = self.shared.lock_registry().leave(client_id, &self.name)?;
    if membership == Membership::Unchanged {
      tracing::debug!("Client {} was not in room {}", client_id, self.name);
    }
    Ok(())
  }
}

impl fmt::Debug for Room {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Room").field("name", &self.name).finish()
  }
}
