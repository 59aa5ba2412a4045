// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Registry;
use crate::common::protocol::{
  envelope::Envelope,
  id::ConnectionId,
  transport::{Link, TransportError},
};

/// State of one accepted WebSocket connection on the relay
pub struct Hub {
  id: u64,
  link: Arc<dyn Link>,
  registry: Registry,
  /// Legs announced on this connection, keyed to their master
  legs: DashMap<ConnectionId, ConnectionId>,
}

impl Hub {
  fn new(id: u64, link: Arc<dyn Link>) -> Self {
    Self {
      id,
      link,
      registry: Registry::new(),
      legs: DashMap::new(),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn link(&self) -> &Arc<dyn Link> {
    &self.link
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  pub fn track_leg(&self, leg: ConnectionId, master: ConnectionId) {
    self.legs.insert(leg, master);
  }

  pub fn untrack_master(&self, master: &ConnectionId) {
    self.legs.retain(|_, m| m != master);
  }

  /// Forgets legs whose master no longer satisfies `live`
  pub fn retain_legs(&self, live: impl Fn(&ConnectionId) -> bool) {
    self.legs.retain(|_, master| live(master));
  }

  /// Masters with at least one leg carried by this connection
  pub fn masters(&self) -> Vec<ConnectionId> {
    let mut masters: Vec<ConnectionId> = self.legs.iter().map(|e| *e.value()).collect();
    masters.sort();
    masters.dedup();
    masters
  }

  /// Tells the client the connection `master` is gone
  pub async fn tell_closed(&self, master: ConnectionId) -> Result<(), TransportError> {
    self.link.send(Envelope::close(master)).await
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
  pub clients: usize,
  pub active_proxies: usize,
  pub up_time_seconds: u64,
}

/// Every live [Hub] of a relay, kept for statistics
pub struct HubCollection {
  hubs: DashMap<u64, Arc<Hub>>,
  next_id: AtomicU64,
  started: Instant,
}

impl Default for HubCollection {
  fn default() -> Self {
    Self::new()
  }
}

impl HubCollection {
  pub fn new() -> Self {
    Self {
      hubs: DashMap::new(),
      next_id: AtomicU64::new(1),
      started: Instant::now(),
    }
  }

  pub fn new_hub(&self, link: Arc<dyn Link>) -> Arc<Hub> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let hub = Arc::new(Hub::new(id, link));
    self.hubs.insert(id, Arc::clone(&hub));
    hub
  }

  pub fn remove(&self, hub: &Hub) -> Option<Arc<Hub>> {
    self.hubs.remove(&hub.id()).map(|(_, hub)| hub)
  }

  pub fn retain_legs(&self, live: impl Fn(&ConnectionId) -> bool) {
    for hub in self.hubs.iter() {
      hub.retain_legs(&live);
    }
  }

  pub fn clients(&self) -> usize {
    self.hubs.len()
  }

  pub fn active_proxies(&self) -> usize {
    self.hubs.iter().map(|hub| hub.registry().len()).sum()
  }

  pub fn snapshot(&self) -> StatusSnapshot {
    StatusSnapshot {
      clients: self.clients(),
      active_proxies: self.active_proxies(),
      up_time_seconds: self.started.elapsed().as_secs(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use super::HubCollection;
  use crate::common::{
    hub::testing::RecordingEndpoint,
    protocol::{envelope::Message, id::ConnectionId, transport::testing::MemoryLink},
  };

  #[tokio::test(start_paused = true)]
  async fn snapshot_counts_hubs_and_endpoints() {
    let hubs = HubCollection::new();
    let first = hubs.new_hub(Arc::new(MemoryLink::default()));
    let second = hubs.new_hub(Arc::new(MemoryLink::default()));
    first
      .registry()
      .add(ConnectionId::generate(), Arc::new(RecordingEndpoint::default()));
    second
      .registry()
      .add(ConnectionId::generate(), Arc::new(RecordingEndpoint::default()));
    second
      .registry()
      .add(ConnectionId::generate(), Arc::new(RecordingEndpoint::default()));
    tokio::time::advance(Duration::from_secs(90)).await;
    let snapshot = hubs.snapshot();
    assert_eq!(snapshot.clients, 2);
    assert_eq!(snapshot.active_proxies, 3);
    assert_eq!(snapshot.up_time_seconds, 90);
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["active_proxies"], 3);

    hubs.remove(&first);
    assert_eq!(hubs.clients(), 1);
  }

  #[tokio::test]
  async fn hub_tracks_masters_and_tells_closed() {
    let link = Arc::new(MemoryLink::default());
    let hubs = HubCollection::new();
    let hub = hubs.new_hub(link.clone());
    let master = ConnectionId::generate();
    hub.track_leg(master, master);
    hub.track_leg(ConnectionId::generate(), master);
    assert_eq!(hub.masters(), vec![master]);
    hub.tell_closed(master).await.unwrap();
    hub.untrack_master(&master);
    assert!(hub.masters().is_empty());
    let sent = link.sent.lock().await;
    assert_eq!(sent[0].id, master);
    assert_eq!(sent[0].message, Message::Close);
  }
}
