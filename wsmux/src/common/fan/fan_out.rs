// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tokio::{
  sync::{mpsc, watch, RwLock},
  time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{check_order, finish, wait_done, Chunk, FanConfig, FanError, LegWriter, Phase};
use crate::common::protocol::id::ConnectionId;

struct FanGroup {
  legs: HashMap<ConnectionId, Arc<dyn LegWriter>>,
  sorted: Option<Vec<ConnectionId>>,
  queue: mpsc::Sender<Chunk>,
  /// Present until the sender task takes it
  pending: Option<mpsc::Receiver<Chunk>>,
  phase: Arc<watch::Sender<Phase>>,
  cancel: CancellationToken,
  created: Instant,
}

impl FanGroup {
  fn new(capacity: usize) -> Self {
    let (queue, pending) = mpsc::channel(capacity.max(1));
    let (phase, _) = watch::channel(Phase::Waiting);
    Self {
      legs: HashMap::new(),
      sorted: None,
      queue,
      pending: Some(pending),
      phase: Arc::new(phase),
      cancel: CancellationToken::new(),
      created: Instant::now(),
    }
  }

  fn is_ready(&self) -> bool {
    match &self.sorted {
      Some(sorted) => {
        self.pending.is_some()
          && self.legs.len() == sorted.len()
          && sorted.iter().all(|leg| self.legs.contains_key(leg))
      }
      None => false,
    }
  }
}

#[derive(Default)]
struct Tables {
  groups: HashMap<ConnectionId, FanGroup>,
  leg_masters: HashMap<ConnectionId, ConnectionId>,
}

impl Tables {
  fn remove(&mut self, master: &ConnectionId) -> Option<FanGroup> {
    let group = self.groups.remove(master)?;
    for leg in group.legs.keys() {
      self.leg_masters.remove(leg);
    }
    Some(group)
  }
}

/// Splits each logical connection's outgoing writes across its legs in rotation
pub struct FanOut {
  config: FanConfig,
  tables: RwLock<Tables>,
}

impl FanOut {
  pub fn new(config: FanConfig) -> Self {
    Self {
      config,
      tables: RwLock::new(Tables::default()),
    }
  }

  /// Adds `writer` as the transport for `leg` under `master`; repeat registrations are ignored
  pub async fn register(
    &self,
    master: ConnectionId,
    leg: ConnectionId,
    writer: Arc<dyn LegWriter>,
  ) -> Result<(), FanError> {
    let mut tables = self.tables.write().await;
    if let Some(owner) = tables.leg_masters.get(&leg) {
      if *owner != master {
        return Err(FanError::LegConflict { leg, master: *owner });
      }
    }
    let capacity = self.config.queue_capacity;
    let group = tables
      .groups
      .entry(master)
      .or_insert_with(|| FanGroup::new(capacity));
    if let Some(sorted) = &group.sorted {
      if !sorted.contains(&leg) {
        return Err(FanError::UnknownLeg(leg));
      }
    }
    group.legs.entry(leg).or_insert(writer);
    tables.leg_masters.insert(leg, master);
    self.start_if_ready(master, &mut tables);
    Ok(())
  }

  /// Fixes the rotation order; a repeated identical order is accepted
  pub async fn set_order(
    &self,
    master: ConnectionId,
    sorted: Vec<ConnectionId>,
  ) -> Result<(), FanError> {
    let mut tables = self.tables.write().await;
    let capacity = self.config.queue_capacity;
    let group = tables
      .groups
      .entry(master)
      .or_insert_with(|| FanGroup::new(capacity));
    if check_order(master, group.sorted.as_ref(), &sorted, group.legs.keys())? {
      group.sorted = Some(sorted);
    }
    self.start_if_ready(master, &mut tables);
    Ok(())
  }

  /// Starts the sender if every leg in the order is registered
  ///
  /// Returns whether this call started it; the sender starts at most once per group.
  pub async fn try_send(&self, master: ConnectionId) -> bool {
    let mut tables = self.tables.write().await;
    self.start_if_ready(master, &mut tables)
  }

  fn start_if_ready(&self, master: ConnectionId, tables: &mut Tables) -> bool {
    let group = match tables.groups.get_mut(&master) {
      Some(group) if group.is_ready() => group,
      _ => return false,
    };
    let pending = match group.pending.take() {
      Some(pending) => pending,
      None => return false,
    };
    let order: Vec<(ConnectionId, Arc<dyn LegWriter>)> = group
      .sorted
      .iter()
      .flatten()
      .filter_map(|leg| group.legs.get(leg).map(|w| (*leg, Arc::clone(w))))
      .collect();
    let phase = Arc::clone(&group.phase);
    let cancel = group.cancel.clone();
    let pop_timeout = self.config.out_pop_timeout;
    phase.send_replace(Phase::Sending);
    tracing::trace!(%master, legs = order.len(), "fan-out sender starting");
    tokio::task::spawn(
      async move {
        let result = deal(master, order, pending, pop_timeout, &cancel).await;
        if let Err(error) = &result {
          tracing::debug!(%master, ?error, "fan-out sender stopped");
        }
        cancel.cancel();
        finish(&phase, result);
      }
      .instrument(tracing::trace_span!("fan_out", %master)),
    );
    true
  }

  /// Queues one chunk for the next leg in rotation
  pub async fn write(&self, master: ConnectionId, data: Bytes) -> Result<usize, FanError> {
    if data.is_empty() {
      return Ok(0);
    }
    let len = data.len();
    self.push(master, Chunk::Data(data)).await?;
    Ok(len)
  }

  /// Queues end-of-stream; the sender forwards it to the leg whose turn it is and stops
  pub async fn write_eof(&self, master: ConnectionId) -> Result<(), FanError> {
    self.push(master, Chunk::Eof).await
  }

  async fn push(&self, master: ConnectionId, chunk: Chunk) -> Result<(), FanError> {
    let (queue, cancel) = {
      let tables = self.tables.read().await;
      let group = tables.groups.get(&master).ok_or(FanError::Closed(master))?;
      (group.queue.clone(), group.cancel.clone())
    };
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(FanError::Closed(master)),
      sent = tokio::time::timeout(self.config.push_timeout, queue.send(chunk)) => match sent {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(FanError::Closed(master)),
        Err(_) => Err(FanError::Timeout { master, during: "queueing upload" }),
      },
    }
  }

  /// Stops the sender and drops the group; closing twice is harmless
  pub async fn close(&self, master: ConnectionId) {
    let removed = self.tables.write().await.remove(&master);
    if let Some(group) = removed {
      group.cancel.cancel();
      finish(&group.phase, Err(FanError::Closed(master)));
      tracing::trace!(%master, "fan-out group closed");
    }
  }

  /// Resolves once the group's sender has finished
  pub async fn wait(&self, master: ConnectionId) -> Result<(), FanError> {
    let phase = {
      let tables = self.tables.read().await;
      match tables.groups.get(&master) {
        Some(group) => group.phase.subscribe(),
        None => return Err(FanError::Closed(master)),
      }
    };
    wait_done(phase).await
  }

  pub async fn phase(&self, master: ConnectionId) -> Option<Phase> {
    let tables = self.tables.read().await;
    tables
      .groups
      .get(&master)
      .map(|group| group.phase.borrow().clone())
  }

  pub async fn contains(&self, master: ConnectionId) -> bool {
    self.tables.read().await.groups.contains_key(&master)
  }

  pub async fn len(&self) -> usize {
    self.tables.read().await.groups.len()
  }

  /// Closes up to one sweep batch of expired groups
  ///
  /// A group expires after the expiry window, or after the shorter pending window if its
  /// sender never started.
  pub async fn evict_idle(&self) -> usize {
    let now = Instant::now();
    let expired: Vec<(ConnectionId, FanGroup)> = {
      let mut tables = self.tables.write().await;
      let stale: Vec<ConnectionId> = tables
        .groups
        .iter()
        .filter(|(_, group)| {
          let age = now.saturating_duration_since(group.created);
          age >= self.config.expiry
            || (group.pending.is_some() && age >= self.config.pending_expiry)
        })
        .map(|(master, _)| *master)
        .take(self.config.sweep_batch)
        .collect();
      stale
        .iter()
        .filter_map(|master| tables.remove(master).map(|group| (*master, group)))
        .collect()
    };
    for (master, group) in expired.iter() {
      group.cancel.cancel();
      finish(&group.phase, Err(FanError::Closed(*master)));
    }
    if !expired.is_empty() {
      tracing::debug!(evicted = expired.len(), "swept idle fan-out groups");
    }
    expired.len()
  }
}

async fn deal(
  master: ConnectionId,
  order: Vec<(ConnectionId, Arc<dyn LegWriter>)>,
  mut pending: mpsc::Receiver<Chunk>,
  pop_timeout: std::time::Duration,
  cancel: &CancellationToken,
) -> Result<(), FanError> {
  if order.is_empty() {
    return Err(FanError::EmptyOrder(master));
  }
  let mut turn = 0usize;
  loop {
    let chunk = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(FanError::Closed(master)),
      popped = tokio::time::timeout(pop_timeout, pending.recv()) => match popped {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return Err(FanError::Closed(master)),
        Err(_) => return Err(FanError::Timeout { master, during: "awaiting upload data" }),
      },
    };
    let (leg, writer) = &order[turn % order.len()];
    match chunk {
      Chunk::Data(data) => {
        tracing::trace!(%leg, len = data.len(), "dealing chunk");
        tokio::select! {
          biased;
          _ = cancel.cancelled() => return Err(FanError::Closed(master)),
          res = writer.write(data) => res?,
        }
        turn = turn.wrapping_add(1);
      }
      Chunk::Eof => {
        tracing::trace!(%leg, "dealing end of stream");
        writer.write_eof().await?;
        return Ok(());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use bytes::Bytes;

  use super::FanOut;
  use crate::common::{
    fan::{testing::RecordingLeg, FanConfig, FanError, Phase},
    protocol::id::ConnectionId,
  };

  fn ids(n: usize) -> Vec<ConnectionId> {
    (0..n).map(|_| ConnectionId::generate()).collect()
  }

  #[tokio::test]
  async fn sender_waits_for_every_leg_in_any_order() {
    // Every registration order of three legs, with the order fixed at each possible point
    let perms: [[usize; 3]; 6] = [
      [0, 1, 2],
      [0, 2, 1],
      [1, 0, 2],
      [1, 2, 0],
      [2, 0, 1],
      [2, 1, 0],
    ];
    for perm in perms.iter() {
      for order_at in 0..=3 {
        let fan = FanOut::new(FanConfig::default());
        let legs = ids(3);
        let master = legs[0];
        for (step, idx) in perm.iter().enumerate() {
          if step == order_at {
            fan.set_order(master, legs.clone()).await.unwrap();
          }
          assert!(!matches!(fan.phase(master).await, Some(Phase::Sending)));
          fan
            .register(master, legs[*idx], Arc::new(RecordingLeg::default()))
            .await
            .unwrap();
        }
        if order_at == 3 {
          assert!(matches!(fan.phase(master).await, Some(Phase::Waiting)));
          fan.set_order(master, legs.clone()).await.unwrap();
        }
        assert!(matches!(fan.phase(master).await, Some(Phase::Sending)));
        assert!(!fan.try_send(master).await, "sender must only start once");
        fan.close(master).await;
      }
    }
  }

  #[tokio::test]
  async fn deals_whole_chunks_round_robin_then_eof() {
    let fan = FanOut::new(FanConfig::default());
    let legs = ids(3);
    let master = legs[0];
    let writers: Vec<Arc<RecordingLeg>> = legs.iter().map(|_| Arc::default()).collect();
    fan.set_order(master, legs.clone()).await.unwrap();
    for (leg, writer) in legs.iter().zip(writers.iter()) {
      fan.register(master, *leg, writer.clone()).await.unwrap();
    }
    for chunk in ["AAAA", "BBBB", "CCCC", "DDDD"] {
      assert_eq!(fan.write(master, Bytes::from(chunk)).await.unwrap(), 4);
    }
    assert_eq!(fan.write(master, Bytes::new()).await.unwrap(), 0);
    fan.write_eof(master).await.unwrap();
    fan.wait(master).await.unwrap();

    assert_eq!(
      *writers[0].chunks.lock().await,
      vec![Some(Bytes::from("AAAA")), Some(Bytes::from("DDDD"))]
    );
    assert_eq!(*writers[1].chunks.lock().await, vec![Some(Bytes::from("BBBB")), None]);
    assert_eq!(*writers[2].chunks.lock().await, vec![Some(Bytes::from("CCCC"))]);
  }

  #[tokio::test]
  async fn order_is_immutable_and_legs_are_exclusive() {
    let fan = FanOut::new(FanConfig::default());
    let legs = ids(2);
    fan.set_order(legs[0], legs.clone()).await.unwrap();
    fan.set_order(legs[0], legs.clone()).await.unwrap();
    assert!(matches!(
      fan.set_order(legs[0], vec![legs[1], legs[0]]).await,
      Err(FanError::OrderAlreadySet(_))
    ));
    assert!(matches!(
      fan.register(legs[0], ConnectionId::generate(), Arc::new(RecordingLeg::default())).await,
      Err(FanError::UnknownLeg(_))
    ));
    fan
      .register(legs[0], legs[1], Arc::new(RecordingLeg::default()))
      .await
      .unwrap();
    let other = ConnectionId::generate();
    assert!(matches!(
      fan.register(other, legs[1], Arc::new(RecordingLeg::default())).await,
      Err(FanError::LegConflict { .. })
    ));
  }

  #[tokio::test]
  async fn order_with_repeated_legs_is_refused() {
    let fan = FanOut::new(FanConfig::default());
    let legs = ids(2);
    let master = legs[0];
    assert!(matches!(
      fan.set_order(master, vec![master, master]).await,
      Err(FanError::DuplicateLeg { .. })
    ));
    assert!(matches!(
      fan.set_order(master, vec![master, legs[1], master]).await,
      Err(FanError::DuplicateLeg { .. })
    ));
    // A refused order leaves the group free to take a valid one
    fan.set_order(master, legs.clone()).await.unwrap();
    for leg in legs.iter() {
      fan
        .register(master, *leg, Arc::new(RecordingLeg::default()))
        .await
        .unwrap();
    }
    assert!(matches!(fan.phase(master).await, Some(Phase::Sending)));
  }

  #[tokio::test]
  async fn close_is_idempotent_and_fails_writers() {
    let fan = Arc::new(FanOut::new(FanConfig::default()));
    let legs = ids(2);
    let master = legs[0];
    fan.set_order(master, legs.clone()).await.unwrap();
    for leg in legs.iter() {
      fan
        .register(master, *leg, Arc::new(RecordingLeg::default()))
        .await
        .unwrap();
    }
    let waiter = {
      let fan = fan.clone();
      tokio::spawn(async move { fan.wait(master).await })
    };
    fan.write(master, Bytes::from_static(b"x")).await.unwrap();
    tokio::join!(fan.close(master), fan.close(master));
    fan.close(master).await;
    assert!(matches!(waiter.await.unwrap(), Err(FanError::Closed(_))));
    assert!(matches!(
      fan.write(master, Bytes::from_static(b"y")).await,
      Err(FanError::Closed(_))
    ));
    assert!(!fan.contains(master).await);
  }

  #[tokio::test(start_paused = true)]
  async fn full_queue_times_out_instead_of_blocking() {
    let config = FanConfig {
      queue_capacity: 1,
      push_timeout: Duration::from_secs(3),
      ..FanConfig::default()
    };
    let fan = FanOut::new(config);
    let legs = ids(2);
    // Only one of two legs registered, so nothing drains the queue
    fan.set_order(legs[0], legs.clone()).await.unwrap();
    fan.write(legs[0], Bytes::from_static(b"1")).await.unwrap();
    assert!(matches!(
      fan.write(legs[0], Bytes::from_static(b"2")).await,
      Err(FanError::Timeout { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn sweep_removes_at_most_one_batch() {
    let fan = FanOut::new(FanConfig::default());
    for _ in 0..1000 {
      fan
        .set_order(ConnectionId::generate(), vec![ConnectionId::generate()])
        .await
        .unwrap();
    }
    assert_eq!(fan.evict_idle().await, 0);
    tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
    assert_eq!(fan.evict_idle().await, 100);
    assert_eq!(fan.len().await, 900);
    for _ in 0..9 {
      assert_eq!(fan.evict_idle().await, 100);
    }
    assert_eq!(fan.evict_idle().await, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn groups_that_never_start_expire_early() {
    let fan = FanOut::new(FanConfig::default());
    let stalled = ids(2);
    fan
      .register(stalled[0], stalled[1], Arc::new(RecordingLeg::default()))
      .await
      .unwrap();
    let running = ConnectionId::generate();
    fan
      .register(running, running, Arc::new(RecordingLeg::default()))
      .await
      .unwrap();
    fan.set_order(running, vec![running]).await.unwrap();
    assert!(matches!(fan.phase(running).await, Some(Phase::Sending)));

    tokio::time::advance(Duration::from_secs(3 * 60)).await;
    assert_eq!(fan.evict_idle().await, 1);
    assert!(!fan.contains(stalled[0]).await);
    assert!(fan.contains(running).await);
  }
}
