// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-WebSocket tables of established proxy endpoints
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::common::{
  fan::FanError,
  protocol::{envelope::DataPayload, id::ConnectionId},
};

pub mod collection;

pub use collection::{Hub, HubCollection, StatusSnapshot};

#[derive(thiserror::Error, Debug, Clone)]
pub enum EndpointError {
  #[error("The carrying WebSocket connection failed")]
  TransportLost,
  #[error("Establishing the outward connection failed: {0}")]
  Establish(String),
  #[error("Striping failed")]
  Fan(#[from] FanError),
}

/// How an endpoint's lifetime ended
#[derive(Clone, Debug)]
pub enum Outcome {
  Closed { by_peer: bool },
  /// Establishing failed and the peer was already answered with an error
  Rejected(EndpointError),
  Failed(EndpointError),
}

impl Outcome {
  /// Whether the peer still needs to be told the connection is gone
  pub fn tell_peer(&self) -> bool {
    match self {
      Outcome::Closed { by_peer } => !by_peer,
      Outcome::Rejected(_) => false,
      Outcome::Failed(EndpointError::TransportLost) => false,
      Outcome::Failed(_) => true,
    }
  }
}

/// First-signal-wins completion flag shared between a dispatcher and a connection task
#[derive(Debug)]
pub struct Completion {
  tx: watch::Sender<Option<Outcome>>,
}

impl Default for Completion {
  fn default() -> Self {
    Self::new()
  }
}

impl Completion {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(None);
    Self { tx }
  }

  /// Records `outcome` unless one was already recorded; returns whether it was recorded
  pub fn signal(&self, outcome: Outcome) -> bool {
    self.tx.send_if_modified(|current| {
      if current.is_some() {
        false
      } else {
        *current = Some(outcome);
        true
      }
    })
  }

  pub fn outcome(&self) -> Option<Outcome> {
    self.tx.borrow().clone()
  }

  pub async fn wait(&self) -> Outcome {
    let mut rx = self.tx.subscribe();
    let result = match rx.wait_for(Option::is_some).await {
      Ok(outcome) => outcome.clone(),
      Err(_) => None,
    };
    result.unwrap_or(Outcome::Closed { by_peer: false })
  }
}

/// One established (or establishing) logical connection, as seen by the frame router
///
/// Callbacks run on the read loop and must not block.
pub trait ProxyEndpoint: Send + Sync {
  /// A control sub-tag addressed to this connection's master id
  fn on_data(&self, payload: DataPayload);

  /// The connection ended; `tell` is false when the peer asked for the close
  fn on_closed(&self, tell: bool);

  fn on_error(&self, error: EndpointError);
}

/// Maps logical connection ids to their endpoints
#[derive(Default)]
pub struct Registry {
  endpoints: DashMap<ConnectionId, Arc<dyn ProxyEndpoint>>,
}

impl Registry {
  pub fn new() -> Self {
    Default::default()
  }

  /// Returns false without replacing if `id` is already present
  pub fn add(&self, id: ConnectionId, endpoint: Arc<dyn ProxyEndpoint>) -> bool {
    match self.endpoints.entry(id) {
      dashmap::mapref::entry::Entry::Occupied(_) => false,
      dashmap::mapref::entry::Entry::Vacant(slot) => {
        slot.insert(endpoint);
        true
      }
    }
  }

  pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn ProxyEndpoint>> {
    self.endpoints.get(id).map(|e| Arc::clone(e.value()))
  }

  pub fn remove(&self, id: &ConnectionId) -> Option<Arc<dyn ProxyEndpoint>> {
    self.endpoints.remove(id).map(|(_, e)| e)
  }

  pub fn contains(&self, id: &ConnectionId) -> bool {
    self.endpoints.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.endpoints.len()
  }

  pub fn is_empty(&self) -> bool {
    self.endpoints.is_empty()
  }

  /// Removes every endpoint and reports the transport loss to each of them
  pub fn close_all(&self) -> usize {
    let ids: Vec<ConnectionId> = self.endpoints.iter().map(|e| *e.key()).collect();
    let mut closed = 0;
    for id in ids {
      // Removal before notification keeps callbacks free to touch the registry
      if let Some((_, endpoint)) = self.endpoints.remove(&id) {
        endpoint.on_error(EndpointError::TransportLost);
        closed += 1;
      }
    }
    closed
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::Mutex;

  use super::{Completion, EndpointError, Outcome, ProxyEndpoint};
  use crate::common::protocol::envelope::DataPayload;

  #[derive(Default)]
  pub struct RecordingEndpoint {
    pub completion: Completion,
    pub data: Mutex<Vec<DataPayload>>,
  }

  impl ProxyEndpoint for RecordingEndpoint {
    fn on_data(&self, payload: DataPayload) {
      if let Ok(mut data) = self.data.lock() {
        data.push(payload);
      }
    }

    fn on_closed(&self, tell: bool) {
      self.completion.signal(Outcome::Closed { by_peer: !tell });
    }

    fn on_error(&self, error: EndpointError) {
      self.completion.signal(Outcome::Failed(error));
    }
  }
}
