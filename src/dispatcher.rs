//! Named-event dispatch table shared by the broker and the client.
//!
//! Callbacks are stored per event name in registration order. Every
//! registration gets a [`HandlerId`] carrying a monotonically increasing
//! sequence number, so removing one handler never changes which callback
//! another handle refers to.
//!
//! One-shot handlers (used for correlated responses) are taken out of the
//! table the moment they are selected for a dispatch, which makes them
//! impossible to fire twice.

use std::{collections::HashMap, sync::Arc};

/// Shared callback invoked with a clone of the dispatched payload.
pub type Callback<T, R = ()> = Arc<dyn Fn(T) -> R + Send + Sync>;

/// Handle returned by [`EventDispatcher::register`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId {
  event: String,
  seq: u64,
}

impl HandlerId {
  /// Event name this handler was registered under.
  pub fn event(&self) -> &str {
    &self.event
  }
}

struct Slot<T, R> {
  seq: u64,
  once: bool,
  callback: Callback<T, R>,
}

/// Maps event names to ordered callback lists.
pub struct EventDispatcher<T, R = ()> {
  events: HashMap<String, Vec<Slot<T, R>>>,
  next_seq: u64,
}

impl<T, R> EventDispatcher<T, R> {
  pub fn new() -> Self {
    Self {
      events: HashMap::new(),
      next_seq: 0,
    }
  }

  /// Register a callback that fires on every dispatch of `event`.
  pub fn register<F>(&mut self, event: &str, callback: F) -> HandlerId
  where
    F: Fn(T) -> R + Send + Sync + 'static,
  {
    self.insert(event, Arc::new(callback), false)
  }

  /// Register a callback that fires at most once, then removes itself.
  pub fn register_once<F>(&mut self, event: &str, callback: F) -> HandlerId
  where
    F: Fn(T) -> R + Send + Sync + 'static,
  {
    self.insert(event, Arc::new(callback), true)
  }

  fn insert(&mut self, event: &str, callback: Callback<T, R>, once: bool) -> HandlerId {
    let seq = self.next_seq;
    self.next_seq += 1;
    self
      .events
      .entry(event.to_string())
      .or_default()
      .push(Slot {
        seq,
        once,
        callback,
      });
    HandlerId {
      event: event.to_string(),
      seq,
    }
  }

  /// Remove a handler. Returns `false` if it was already gone.
  pub fn unregister(&mut self, id: &HandlerId) -> bool {
    let Some(slots) = self.events.get_mut(&id.event) else {
      return false;
    };
    let before = slots.len();
    slots.retain(|slot| slot.seq != id.seq);
    let removed = slots.len() != before;
    if slots.is_empty() {
      self.events.remove(&id.event);
    }
    removed
  }

  /// Snapshot the live callbacks for `event`, in registration order.
  ///
  /// One-shot callbacks are removed from the table as part of the snapshot.
  /// Callers that share the dispatcher behind a lock take the snapshot under
  /// the lock and invoke it after releasing it, so callbacks may freely
  /// register or unregister handlers.
  pub fn take_callbacks(&mut self, event: &str) -> Vec<Callback<T, R>> {
    let Some(slots) = self.events.get_mut(event) else {
      return Vec::new();
    };
    let callbacks = slots.iter().map(|slot| slot.callback.clone()).collect();
    slots.retain(|slot| !slot.once);
    if slots.is_empty() {
      self.events.remove(event);
    }
    callbacks
  }

  /// Invoke every live callback for `event` and collect their results.
  ///
  /// Unknown events are a no-op. A panicking callback aborts the rest of
  /// this dispatch.
  pub fn dispatch(&mut self, event: &str, payload: T) -> Vec<R>
  where
    T: Clone,
  {
    self
      .take_callbacks(event)
      .into_iter()
      .map(|callback| callback(payload.clone()))
      .collect()
  }

  pub fn contains(&self, id: &HandlerId) -> bool {
    self
      .events
      .get(&id.event)
      .is_some_and(|slots| slots.iter().any(|slot| slot.seq == id.seq))
  }

  /// Number of live handlers registered for `event`.
  pub fn handler_count(&self, event: &str) -> usize {
    self.events.get(event).map_or(0, Vec::len)
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }
}

impl<T, R> Default for EventDispatcher<T, R> {
  fn default() -> Self {
    Self::new()
  }
}
