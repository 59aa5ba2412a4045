// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Lifecycle bookkeeping for one proxied flow
use std::sync::Mutex;

use crate::common::protocol::{envelope::ProxyKind, id::ConnectionId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
  Created,
  AwaitingLegs,
  Establishing,
  Open,
  HalfClosed,
  Closed,
}

/// A proxied TCP flow and the legs carrying it
///
/// State only moves forward; the transition into `Closed` is reported exactly once so
/// the caller releases the flow's resources a single time.
#[derive(Debug)]
pub struct LogicalConnection {
  pub id: ConnectionId,
  pub addr: String,
  pub kind: ProxyKind,
  pub sorted: Vec<ConnectionId>,
  state: Mutex<ConnectionState>,
}

impl LogicalConnection {
  pub fn new(id: ConnectionId, addr: String, kind: ProxyKind, sorted: Vec<ConnectionId>) -> Self {
    Self {
      id,
      addr,
      kind,
      sorted,
      state: Mutex::new(ConnectionState::Created),
    }
  }

  pub fn state(&self) -> ConnectionState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  /// Moves to `next` if it lies ahead; returns whether the state changed
  pub fn advance(&self, next: ConnectionState) -> bool {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    if next > *state {
      tracing::trace!(id = %self.id, from = ?*state, to = ?next, "connection state");
      *state = next;
      true
    } else {
      false
    }
  }

  /// True for exactly one caller
  pub fn close(&self) -> bool {
    self.advance(ConnectionState::Closed)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::{ConnectionState, LogicalConnection};
  use crate::common::protocol::{envelope::ProxyKind, id::ConnectionId};

  #[test]
  fn states_only_move_forward() {
    let id = ConnectionId::generate();
    let conn = LogicalConnection::new(id, "example.com:443".into(), ProxyKind::Https, vec![id]);
    assert!(conn.advance(ConnectionState::AwaitingLegs));
    assert!(conn.advance(ConnectionState::Open));
    assert!(!conn.advance(ConnectionState::Establishing));
    assert_eq!(conn.state(), ConnectionState::Open);
    assert!(conn.advance(ConnectionState::HalfClosed));
    assert!(!conn.advance(ConnectionState::HalfClosed));
  }

  #[test]
  fn close_reports_once_across_threads() {
    let id = ConnectionId::generate();
    let conn = Arc::new(LogicalConnection::new(id, "a:1".into(), ProxyKind::Socks5, vec![id]));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let conn = conn.clone();
        std::thread::spawn(move || conn.close())
      })
      .collect();
    let winners = handles
      .into_iter()
      .map(|h| h.join().unwrap())
      .filter(|won| *won)
      .count();
    assert_eq!(winners, 1);
    assert_eq!(conn.state(), ConnectionState::Closed);
  }
}
