//! Browser sessions and the connection registry
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// How the browser talks to the proxy on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TransportMode {
  /// Absolute-form requests in clear text
  Plaintext,
  /// CONNECT followed by TLS
  TlsTunnel,
}

/// Where a session is in the CONNECT handshake. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TunnelState {
  /// no CONNECT acknowledged yet, or plain HTTP
  Unsecured,
  /// CONNECT acknowledged, waiting for the TLS handshake
  AwaitingTunnelAck,
  /// TLS established with the browser
  Secured,
}

/// One accepted browser connection.
#[derive(Debug, Clone)]
pub struct Session {
  /// unique per server
  pub id: u64,
  /// browser address
  pub peer: SocketAddr,
  /// transport mode
  pub mode: TransportMode,
  /// accept time
  pub created_at: SystemTime,
  /// CONNECT handshake progress
  pub state: TunnelState,
}

/// Live sessions and outbound connections of one server.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
  sessions: DashMap<u64, Session>,
  next_id: AtomicU64,
  outbound: Arc<AtomicUsize>,
}

impl ConnectionRegistry {
  /// empty registry
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a new plaintext session for `peer`, returning its id.
  pub fn register(&self, peer: SocketAddr) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    self.sessions.insert(
      id,
      Session {
        id,
        peer,
        mode: TransportMode::Plaintext,
        created_at: SystemTime::now(),
        state: TunnelState::Unsecured,
      },
    );
    id
  }

  /// Records a tunnel transition. Returns `false` and leaves the session
  /// untouched when `state` would move backwards.
  pub fn set_state(&self, id: u64, state: TunnelState) -> bool {
    match self.sessions.get_mut(&id) {
      Some(mut session) if session.state <= state => {
        session.state = state;
        if state != TunnelState::Unsecured {
          session.mode = TransportMode::TlsTunnel;
        }
        true
      }
      Some(session) => {
        tracing::warn!(
          "[recorder] session {} refused to move from {:?} to {:?}",
          id,
          session.state,
          state
        );
        false
      }
      None => false,
    }
  }

  /// snapshot of a session
  pub fn get(&self, id: u64) -> Option<Session> {
    self.sessions.get(&id).map(|session| session.clone())
  }

  /// Forgets a session.
  pub fn remove(&self, id: u64) -> Option<Session> {
    self.sessions.remove(&id).map(|(_, session)| session)
  }

  /// Number of live browser sessions.
  pub fn connection_count(&self) -> usize {
    self.sessions.len()
  }

  /// Number of live outbound connections.
  pub fn outbound_count(&self) -> usize {
    self.outbound.load(Ordering::Acquire)
  }

  /// Counts an outbound connection until the guard is dropped.
  pub fn track_outbound(&self) -> OutboundGuard {
    self.outbound.fetch_add(1, Ordering::AcqRel);
    OutboundGuard {
      counter: self.outbound.clone(),
    }
  }

  /// Drops every session entry.
  pub fn clear(&self) {
    self.sessions.clear();
  }
}

/// Decrements the outbound counter on drop.
#[derive(Debug)]
pub struct OutboundGuard {
  counter: Arc<AtomicUsize>,
}

impl Drop for OutboundGuard {
  fn drop(&mut self) {
    self.counter.fetch_sub(1, Ordering::AcqRel);
  }
}
