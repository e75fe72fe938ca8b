//! Registry of connected clients and the rooms they belong to.
//!
//! Membership is stored on both sides: each client keeps the names of its
//! rooms, each room keeps the ids of its members. Every mutation goes through
//! this type so the two views never drift apart. The registry itself is not
//! synchronised; the broker keeps it behind a single lock.

use crate::error::{Result, SocketError};
use std::collections::HashMap;

/// A registered client: broker-specific data plus its room memberships.
pub struct ClientRecord<C> {
  pub data: C,
  rooms: Vec<String>,
}

impl<C> ClientRecord<C> {
  /// Room names in join order.
  pub fn rooms(&self) -> &[String] {
    &self.rooms
  }
}

/// Whether a membership call actually changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
  Changed,
  Unchanged,
}

/// Client and room bookkeeping.
pub struct RoomRegistry<C> {
  clients: HashMap<String, ClientRecord<C>>,
  rooms: HashMap<String, Vec<String>>,
}

impl<C> RoomRegistry<C> {
  pub fn new() -> Self {
    Self {
      clients: HashMap::new(),
      rooms: HashMap::new(),
    }
  }

  /// Register a client. Refuses to replace a live client with the same id.
  pub fn insert_client(&mut self, id: &str, data: C) -> Result<()> {
    if self.clients.contains_key(id) {
      return Err(SocketError::DuplicateClient(id.to_string()));
    }
    self.clients.insert(
      id.to_string(),
      ClientRecord {
        data,
        rooms: Vec::new(),
      },
    );
    Ok(())
  }

  /// Drop a client and strip it from every room it was in.
  pub fn remove_client(&mut self, id: &str) -> Option<ClientRecord<C>> {
    let record = self.clients.remove(id)?;
    for name in &record.rooms {
      if let Some(members) = self.rooms.get_mut(name) {
        members.retain(|member| member != id);
      }
    }
    Some(record)
  }

  pub fn client(&self, id: &str) -> Option<&ClientRecord<C>> {
    self.clients.get(id)
  }

  pub fn contains_client(&self, id: &str) -> bool {
    self.clients.contains_key(id)
  }

  pub fn client_ids(&self) -> Vec<String> {
    self.clients.keys().cloned().collect()
  }

  pub fn clients(&self) -> impl Iterator<Item = (&String, &ClientRecord<C>)> {
    self.clients.iter()
  }

  pub fn client_count(&self) -> usize {
    self.clients.len()
  }

  /// Create the room if it does not exist yet. Returns `true` if it was created.
  pub fn ensure_room(&mut self, name: &str) -> bool {
    if self.rooms.contains_key(name) {
      return false;
    }
    self.rooms.insert(name.to_string(), Vec::new());
    true
  }

  pub fn contains_room(&self, name: &str) -> bool {
    self.rooms.contains_key(name)
  }

  /// Member ids in join order, or `None` if the room does not exist.
  pub fn members(&self, name: &str) -> Option<&[String]> {
    self.rooms.get(name).map(Vec::as_slice)
  }

  /// Room names in sorted order.
  pub fn room_names(&self) -> Vec<String> {
    let mut names: Vec<_> = self.rooms.keys().cloned().collect();
    names.sort();
    names
  }

  /// Put a client into a room, updating both sides.
  ///
  /// Fails without touching anything if either side is missing. Joining a
  /// room the client is already in is a no-op.
  pub fn join(&mut self, client_id: &str, room: &str) -> Result<Membership> {
    let members = self
      .rooms
      .get_mut(room)
      .ok_or_else(|| SocketError::RoomNotFound(room.to_string()))?;
    let record = self
      .clients
      .get_mut(client_id)
      .ok_or_else(|| SocketError::ClientNotFound(client_id.to_string()))?;

    let in_room = members.iter().any(|member| member == client_id);
    let has_room = record.rooms.iter().any(|name| name == room);
    if in_room && has_room {
      return Ok(Membership::Unchanged);
    }
    if !in_room {
      members.push(client_id.to_string());
    }
    if !has_room {
      record.rooms.push(room.to_string());
    }
    Ok(Membership::Changed)
  }

  /// Take a client out of a room, updating both sides.
  ///
  /// Fails without touching anything if either side is missing. Leaving a
  /// room the client is not in is a no-op.
  pub fn leave(&mut self, client_id: &str, room: &str) -> Result<Membership> {
    let members = self
      .rooms
      .get_mut(room)
      .ok_or_else(|| SocketError::RoomNotFound(room.to_string()))?;
    let record = self
      .clients
      .get_mut(client_id)
      .ok_or_else(|| SocketError::ClientNotFound(client_id.to_string()))?;

    let before = (members.len(), record.rooms.len());
    members.retain(|member| member != client_id);
    record.rooms.retain(|name| name != room);
    if before == (members.len(), record.rooms.len()) {
      Ok(Membership::Unchanged)
    } else {
      Ok(Membership::Changed)
    }
  }

  /// Delete a room after removing it from every member's room list.
  ///
  /// Returns the former members, or `None` if the room never existed.
  pub fn remove_room(&mut self, name: &str) -> Option<Vec<String>> {
    let members = self.rooms.remove(name)?;
    for id in &members {
      if let Some(record) = self.clients.get_mut(id) {
        record.rooms.retain(|room| room != name);
      }
    }
    Some(members)
  }

  /// Check that both membership views agree.
  #[cfg(test)]
  pub(crate) fn assert_mirrored(&self) {
    for (id, record) in &self.clients {
      for room in &record.rooms {
        let members = self.rooms.get(room).expect("client lists a missing room");
        assert!(members.contains(id), "{} lists {} but is not a member", id, room);
      }
    }
    for (room, members) in &self.rooms {
      for id in members {
        let record = self.clients.get(id).expect("room lists a missing client");
        assert!(record.rooms.contains(room), "{} has {} but the client disagrees", room, id);
      }
    }
  }
}

impl<C> Default for RoomRegistry<C> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;

  fn registry_with(clients: &[&str], rooms: &[&str]) -> RoomRegistry<()> {
    let mut registry = RoomRegistry::new();
    for id in clients {
      registry.insert_client(id, ()).unwrap();
    }
    for room in rooms {
      registry.ensure_room(room);
    }
    registry
  }

  fn members(registry: &RoomRegistry<()>, room: &str) -> BTreeSet<String> {
    registry.members(room).unwrap().iter().cloned().collect()
  }

  #[test]
  fn duplicate_client_ids_are_refused() {
    let mut registry = registry_with(&["a"], &[]);
    assert!(matches!(
      registry.insert_client("a", ()),
      Err(SocketError::DuplicateClient(id)) if id == "a"
    ));
  }

  #[test]
  fn join_and_leave_are_idempotent() {
    let mut registry = registry_with(&["a", "b", "c"], &["lobby"]);

    let ops: &[(&str, bool)] = &[
      ("a", true),
      ("b", true),
      ("a", true),
      ("c", false),
      ("b", false),
      ("b", false),
      ("c", true),
      ("b", true),
      ("a", false),
    ];
    let mut expected = BTreeSet::new();
    for (id, add) in ops {
      if *add {
        registry.join(id, "lobby").unwrap();
        expected.insert(id.to_string());
      } else {
        registry.leave(id, "lobby").unwrap();
        expected.remove(*id);
      }
      registry.assert_mirrored();
      assert_eq!(members(&registry, "lobby"), expected);
    }
  }

  #[test]
  fn join_reports_unchanged_for_existing_member() {
    let mut registry = registry_with(&["a"], &["lobby"]);
    assert_eq!(registry.join("a", "lobby").unwrap(), Membership::Changed);
    assert_eq!(registry.join("a", "lobby").unwrap(), Membership::Unchanged);
    assert_eq!(registry.leave("a", "lobby").unwrap(), Membership::Changed);
    assert_eq!(registry.leave("a", "lobby").unwrap(), Membership::Unchanged);
  }

  #[test]
  fn invalid_references_leave_registry_untouched() {
    let mut registry = registry_with(&["a"], &["lobby"]);

    assert!(matches!(registry.join("a", "nowhere"), Err(SocketError::RoomNotFound(_))));
    assert!(matches!(registry.join("ghost", "lobby"), Err(SocketError::ClientNotFound(_))));
    assert!(matches!(registry.leave("ghost", "lobby"), Err(SocketError::ClientNotFound(_))));
    assert!(matches!(registry.leave("a", "nowhere"), Err(SocketError::RoomNotFound(_))));

    assert!(registry.client("a").unwrap().rooms().is_empty());
    assert!(registry.members("lobby").unwrap().is_empty());
    assert!(!registry.contains_room("nowhere"));
  }

  #[test]
  fn removing_a_client_cascades_to_rooms() {
    let mut registry = registry_with(&["a", "b"], &["x", "y"]);
    registry.join("a", "x").unwrap();
    registry.join("a", "y").unwrap();
    registry.join("b", "x").unwrap();

    let record = registry.remove_client("a").unwrap();
    assert_eq!(record.rooms(), ["x".to_string(), "y".to_string()]);
    assert_eq!(registry.members("x").unwrap(), ["b".to_string()]);
    assert!(registry.members("y").unwrap().is_empty());
    assert!(registry.remove_client("a").is_none());
    registry.assert_mirrored();
  }

  #[test]
  fn empty_rooms_persist_until_removed() {
    let mut registry = registry_with(&["a"], &["x"]);
    registry.join("a", "x").unwrap();
    registry.remove_client("a");
    assert!(registry.contains_room("x"));
  }

  #[test]
  fn remove_room_strips_every_member() {
    let mut registry = registry_with(&["a", "b"], &["x", "y"]);
    registry.join("a", "x").unwrap();
    registry.join("b", "x").unwrap();
    registry.join("b", "y").unwrap();

    let former = registry.remove_room("x").unwrap();
    assert_eq!(former.len(), 2);
    assert!(registry.client("a").unwrap().rooms().is_empty());
    assert_eq!(registry.client("b").unwrap().rooms(), ["y".to_string()]);
    registry.assert_mirrored();

    assert!(registry.remove_room("x").is_none());
    assert!(registry.ensure_room("x"));
    assert!(registry.members("x").unwrap().is_empty());
  }
}
