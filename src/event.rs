//! Recorder events and their listeners
//!
//! Listeners are called synchronously, in registration order, on the task
//! that observed the traffic. A listener returning an error or panicking is
//! logged and skipped; the others still see the event.
use crate::errors::{Error, Result};
use crate::record::{CapturedRequest, CapturedResponse, TagMarker};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Something the recorder observed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RecorderEvent {
  /// A request was fully read, before it is forwarded
  RequestCaptured(CapturedRequest),
  /// A response was relayed to the browser
  ResponseCaptured(CapturedResponse),
  /// A tag was inserted
  TagInserted(TagMarker),
}

/// Receives recorder events.
pub trait EventListener: Send + Sync {
  /// Called once per event.
  fn on_event(&self, event: &RecorderEvent) -> Result<()>;
}

impl<F> EventListener for F
where
  F: Fn(&RecorderEvent) -> Result<()> + Send + Sync,
{
  fn on_event(&self, event: &RecorderEvent) -> Result<()> {
    self(event)
  }
}

/// Identifies a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listeners = Vec<(ListenerId, Arc<dyn EventListener>)>;

/// Fans events out to the subscribed listeners.
#[derive(Clone, Default)]
pub struct EventPublisher {
  listeners: Arc<RwLock<Listeners>>,
  next_listener: Arc<AtomicU64>,
  next_request: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventPublisher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventPublisher")
      .field("listeners", &self.listener_count())
      .finish()
  }
}

impl EventPublisher {
  /// publisher without listeners
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds `listener` after the existing ones.
  pub fn subscribe<L: EventListener + 'static>(&self, listener: L) -> ListenerId {
    let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
    self
      .listeners
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push((id, Arc::new(listener)));
    id
  }

  /// Removes a listener. Returns `false` if it was not subscribed.
  pub fn unsubscribe(&self, id: ListenerId) -> bool {
    let mut listeners = self
      .listeners
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = listeners.len();
    listeners.retain(|(listener, _)| *listener != id);
    listeners.len() != before
  }

  /// number of listeners
  pub fn listener_count(&self) -> usize {
    self
      .listeners
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .len()
  }

  /// Delivers `event` to every listener.
  pub fn publish(&self, event: &RecorderEvent) {
    let snapshot: Vec<_> = self
      .listeners
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .iter()
      .map(|(id, listener)| (*id, listener.clone()))
      .collect();
    for (id, listener) in snapshot {
      match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("[recorder] listener {:?} failed: {}", id, e),
        Err(_) => tracing::error!("[recorder] listener {:?} panicked", id),
      }
    }
  }

  /// Allocates the id of the next captured request.
  pub fn next_request_id(&self) -> u64 {
    self.next_request.fetch_add(1, Ordering::Relaxed) + 1
  }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
  sender: mpsc::UnboundedSender<RecorderEvent>,
}

impl ChannelListener {
  /// listener and the receiving end of its channel
  pub fn new() -> (Self, mpsc::UnboundedReceiver<RecorderEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

impl EventListener for ChannelListener {
  fn on_event(&self, event: &RecorderEvent) -> Result<()> {
    self
      .sender
      .send(event.clone())
      .map_err(|_| Error::Listener("event receiver dropped".to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[test]
  fn listeners_run_in_registration_order() {
    let publisher = EventPublisher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
      let seen = seen.clone();
      publisher.subscribe(move |_: &RecorderEvent| -> Result<()> {
        seen.lock().unwrap().push(name);
        Ok(())
      });
    }
    publisher.publish(&RecorderEvent::TagInserted(TagMarker::new("login")));
    assert_eq!(*seen.lock().unwrap(), ["first", "second", "third"]);
  }

  #[test]
  fn failing_listeners_are_isolated() {
    let publisher = EventPublisher::new();
    let delivered = Arc::new(AtomicU64::new(0));
    publisher.subscribe(|_: &RecorderEvent| -> Result<()> { Err(Error::Other("boom".to_string())) });
    publisher.subscribe(|_: &RecorderEvent| -> Result<()> { panic!("listener bug") });
    let counter = delivered.clone();
    publisher.subscribe(move |_: &RecorderEvent| -> Result<()> {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
    publisher.publish(&RecorderEvent::TagInserted(TagMarker::new("a")));
    publisher.publish(&RecorderEvent::TagInserted(TagMarker::new("b")));
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn unsubscribed_listener_is_not_called() {
    let publisher = EventPublisher::new();
    let delivered = Arc::new(AtomicU64::new(0));
    let counter = delivered.clone();
    let id = publisher.subscribe(move |_: &RecorderEvent| -> Result<()> {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
    assert!(publisher.unsubscribe(id));
    assert!(!publisher.unsubscribe(id));
    publisher.publish(&RecorderEvent::TagInserted(TagMarker::new("gone")));
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn channel_listener_forwards_events() {
    let publisher = EventPublisher::new();
    let (listener, mut events) = ChannelListener::new();
    publisher.subscribe(listener);
    publisher.publish(&RecorderEvent::TagInserted(TagMarker::new("checkout")));
    match events.recv().await {
      Some(RecorderEvent::TagInserted(tag)) => assert_eq!(tag.label, "checkout"),
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[test]
  fn request_ids_are_unique() {
    let publisher = EventPublisher::new();
    let clone = publisher.clone();
    assert_eq!(publisher.next_request_id(), 1);
    assert_eq!(clone.next_request_id(), 2);
  }
}
