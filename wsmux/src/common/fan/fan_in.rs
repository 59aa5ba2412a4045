// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
  time::Duration,
};

use bytes::Bytes;
use tokio::{
  io::AsyncWriteExt,
  sync::{mpsc, watch, RwLock},
  time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{check_order, finish, wait_done, Chunk, FanConfig, FanError, OutwardConn, Phase};
use crate::common::protocol::id::ConnectionId;

struct LegQueue {
  queue: mpsc::Sender<Chunk>,
  pending: Option<mpsc::Receiver<Chunk>>,
}

struct JoinGroup {
  legs: HashMap<ConnectionId, LegQueue>,
  sorted: Option<Vec<ConnectionId>>,
  conn: Option<OutwardConn>,
  started: bool,
  phase: Arc<watch::Sender<Phase>>,
  cancel: CancellationToken,
  created: Instant,
}

impl JoinGroup {
  fn new() -> Self {
    let (phase, _) = watch::channel(Phase::Waiting);
    Self {
      legs: HashMap::new(),
      sorted: None,
      conn: None,
      started: false,
      phase: Arc::new(phase),
      cancel: CancellationToken::new(),
      created: Instant::now(),
    }
  }

  fn is_ready(&self) -> bool {
    match &self.sorted {
      Some(sorted) => {
        !self.started
          && self.conn.is_some()
          && self.legs.len() == sorted.len()
          && sorted.iter().all(|leg| self.legs.contains_key(leg))
      }
      None => false,
    }
  }
}

#[derive(Default)]
struct Tables {
  groups: HashMap<ConnectionId, JoinGroup>,
  leg_masters: HashMap<ConnectionId, ConnectionId>,
}

impl Tables {
  fn remove(&mut self, master: &ConnectionId) -> Option<JoinGroup> {
    let group = self.groups.remove(master)?;
    for leg in group.legs.keys() {
      self.leg_masters.remove(leg);
    }
    Some(group)
  }
}

/// Reassembles chunks arriving on a connection's legs into one ordered stream
pub struct FanIn {
  config: FanConfig,
  tables: RwLock<Tables>,
}

impl FanIn {
  pub fn new(config: FanConfig) -> Self {
    Self {
      config,
      tables: RwLock::new(Tables::default()),
    }
  }

  /// Gives `leg` its own queue under `master`; repeat registrations are ignored
  pub async fn register(&self, leg: ConnectionId, master: ConnectionId) -> Result<(), FanError> {
    let mut tables = self.tables.write().await;
    if let Some(owner) = tables.leg_masters.get(&leg) {
      if *owner != master {
        return Err(FanError::LegConflict { leg, master: *owner });
      }
    }
    let capacity = self.config.queue_capacity.max(1);
    let group = tables.groups.entry(master).or_insert_with(JoinGroup::new);
    if let Some(sorted) = &group.sorted {
      if !sorted.contains(&leg) {
        return Err(FanError::UnknownLeg(leg));
      }
    }
    group.legs.entry(leg).or_insert_with(|| {
      let (queue, pending) = mpsc::channel(capacity);
      LegQueue {
        queue,
        pending: Some(pending),
      }
    });
    tables.leg_masters.insert(leg, master);
    self.start_if_ready(master, &mut tables);
    Ok(())
  }

  pub async fn set_order(
    &self,
    master: ConnectionId,
    sorted: Vec<ConnectionId>,
  ) -> Result<(), FanError> {
    let mut tables = self.tables.write().await;
    let group = tables.groups.entry(master).or_insert_with(JoinGroup::new);
    if check_order(master, group.sorted.as_ref(), &sorted, group.legs.keys())? {
      group.sorted = Some(sorted);
    }
    self.start_if_ready(master, &mut tables);
    Ok(())
  }

  /// Drops `leg` from a group that has not started replaying
  ///
  /// A group left with no legs, order, or connection is removed with it.
  pub async fn deregister(&self, leg: ConnectionId) {
    let mut tables = self.tables.write().await;
    let master = match tables.leg_masters.get(&leg) {
      Some(master) => *master,
      None => return,
    };
    let emptied = match tables.groups.get_mut(&master) {
      Some(group) if !group.started => {
        group.legs.remove(&leg);
        group.legs.is_empty() && group.sorted.is_none() && group.conn.is_none()
      }
      _ => return,
    };
    tables.leg_masters.remove(&leg);
    if emptied {
      tables.groups.remove(&master);
    }
  }

  /// Attaches the outward connection that replayed bytes are written to
  ///
  /// The group must already exist; a rejected `conn` is dropped.
  pub async fn set_conn(&self, master: ConnectionId, conn: OutwardConn) -> Result<(), FanError> {
    let mut tables = self.tables.write().await;
    let group = tables
      .groups
      .get_mut(&master)
      .ok_or(FanError::Closed(master))?;
    if group.conn.is_some() || group.started {
      return Err(FanError::ConnAttached(master));
    }
    group.conn = Some(conn);
    self.start_if_ready(master, &mut tables);
    Ok(())
  }

  /// Starts the sender once the connection and every leg in the order are present
  pub async fn try_send(&self, master: ConnectionId) -> bool {
    let mut tables = self.tables.write().await;
    self.start_if_ready(master, &mut tables)
  }

  fn start_if_ready(&self, master: ConnectionId, tables: &mut Tables) -> bool {
    let group = match tables.groups.get_mut(&master) {
      Some(group) if group.is_ready() => group,
      _ => return false,
    };
    let conn = match group.conn.take() {
      Some(conn) => conn,
      None => return false,
    };
    group.started = true;
    let mut order = Vec::new();
    for leg in group.sorted.iter().flatten() {
      if let Some(pending) = group.legs.get_mut(leg).and_then(|q| q.pending.take()) {
        order.push((*leg, pending));
      }
    }
    let phase = Arc::clone(&group.phase);
    let cancel = group.cancel.clone();
    let pop_timeout = self.config.in_pop_timeout;
    phase.send_replace(Phase::Sending);
    tracing::trace!(%master, legs = order.len(), "fan-in sender starting");
    tokio::task::spawn(
      async move {
        let result = replay(master, order, conn, pop_timeout, &cancel).await;
        if let Err(error) = &result {
          tracing::debug!(%master, ?error, "fan-in sender stopped");
        }
        cancel.cancel();
        finish(&phase, result);
      }
      .instrument(tracing::trace_span!("fan_in", %master)),
    );
    true
  }

  /// Queues a chunk that arrived on `leg`
  pub async fn write(&self, leg: ConnectionId, data: Bytes) -> Result<usize, FanError> {
    if data.is_empty() {
      return Ok(0);
    }
    let len = data.len();
    self.push(leg, Chunk::Data(data)).await?;
    Ok(len)
  }

  pub async fn write_eof(&self, leg: ConnectionId) -> Result<(), FanError> {
    self.push(leg, Chunk::Eof).await
  }

  async fn push(&self, leg: ConnectionId, chunk: Chunk) -> Result<(), FanError> {
    let (master, queue, cancel) = {
      let tables = self.tables.read().await;
      let master = *tables
        .leg_masters
        .get(&leg)
        .ok_or(FanError::UnknownLeg(leg))?;
      let group = tables.groups.get(&master).ok_or(FanError::Closed(master))?;
      let queue = group
        .legs
        .get(&leg)
        .map(|q| q.queue.clone())
        .ok_or(FanError::UnknownLeg(leg))?;
      (master, queue, group.cancel.clone())
    };
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(FanError::Closed(master)),
      sent = tokio::time::timeout(self.config.push_timeout, queue.send(chunk)) => match sent {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(FanError::Closed(master)),
        Err(_) => Err(FanError::Timeout { master, during: "queueing download" }),
      },
    }
  }

  /// Tears the group down, closing every leg queue and the outward connection
  ///
  /// The connection is released exactly once whether or not the sender holds it.
  pub async fn remove_all(&self, master: ConnectionId) {
    let removed = self.tables.write().await.remove(&master);
    if let Some(group) = removed {
      group.cancel.cancel();
      finish(&group.phase, Err(FanError::Closed(master)));
      if let Some(mut conn) = group.conn {
        let _ = conn.shutdown().await;
      }
      tracing::trace!(%master, "fan-in group removed");
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

  pub async fn master_of(&self, leg: ConnectionId) -> Option<ConnectionId> {
    self.tables.read().await.leg_masters.get(&leg).copied()
  }

  pub async fn masters(&self) -> HashSet<ConnectionId> {
    self.tables.read().await.groups.keys().copied().collect()
  }

  pub async fn contains(&self, master: ConnectionId) -> bool {
    self.tables.read().await.groups.contains_key(&master)
  }

  pub async fn len(&self) -> usize {
    self.tables.read().await.groups.len()
  }

  /// Removes up to one sweep batch of expired groups, as [FanOut::evict_idle] does
  ///
  /// [FanOut::evict_idle]: super::FanOut::evict_idle
  pub async fn evict_idle(&self) -> usize {
    let now = Instant::now();
    let expired: Vec<(ConnectionId, JoinGroup)> = {
      let mut tables = self.tables.write().await;
      let stale: Vec<ConnectionId> = tables
        .groups
        .iter()
        .filter(|(_, group)| {
          let age = now.saturating_duration_since(group.created);
          age >= self.config.expiry || (!group.started && age >= self.config.pending_expiry)
        })
        .map(|(master, _)| *master)
        .take(self.config.sweep_batch)
        .collect();
      stale
        .iter()
        .filter_map(|master| tables.remove(master).map(|group| (*master, group)))
        .collect()
    };
    let evicted = expired.len();
    for (master, group) in expired {
      group.cancel.cancel();
      finish(&group.phase, Err(FanError::Closed(master)));
    }
    if evicted > 0 {
      tracing::debug!(evicted, "swept idle fan-in groups");
    }
    evicted
  }
}

async fn replay(
  master: ConnectionId,
  mut order: Vec<(ConnectionId, mpsc::Receiver<Chunk>)>,
  mut conn: OutwardConn,
  pop_timeout: Duration,
  cancel: &CancellationToken,
) -> Result<(), FanError> {
  if order.is_empty() {
    return Err(FanError::EmptyOrder(master));
  }
  let legs = order.len();
  let mut turn = 0usize;
  loop {
    let (leg, pending) = &mut order[turn % legs];
    let chunk = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(FanError::Closed(master)),
      popped = tokio::time::timeout(pop_timeout, pending.recv()) => match popped {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return Err(FanError::Closed(master)),
        Err(_) => return Err(FanError::Timeout { master, during: "awaiting a leg" }),
      },
    };
    match chunk {
      Chunk::Data(data) => {
        tracing::trace!(%leg, len = data.len(), "replaying chunk");
        tokio::select! {
          biased;
          _ = cancel.cancelled() => return Err(FanError::Closed(master)),
          res = conn.write_all(&data) => res?,
        }
        turn = turn.wrapping_add(1);
      }
      Chunk::Eof => {
        tracing::trace!(%leg, "end of stream");
        conn.flush().await?;
        conn.shutdown().await?;
        return Ok(());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use bytes::Bytes;
  use tokio::io::AsyncReadExt;

  use super::FanIn;
  use crate::common::{
    fan::{testing::DelayedForwarder, FanConfig, FanError, FanOut, Phase},
    protocol::id::ConnectionId,
  };

  fn ids(n: usize) -> Vec<ConnectionId> {
    (0..n).map(|_| ConnectionId::generate()).collect()
  }

  #[tokio::test]
  async fn replays_in_leg_order_regardless_of_arrival() {
    let fan_in = FanIn::new(FanConfig::default());
    let legs = ids(3);
    let master = legs[0];
    for leg in legs.iter() {
      fan_in.register(*leg, master).await.unwrap();
    }
    fan_in.set_order(master, legs.clone()).await.unwrap();
    let (conn, mut outward) = tokio::io::duplex(1024);
    // Deliver out of order before the connection exists
    fan_in.write(legs[2], Bytes::from("CCCC")).await.unwrap();
    fan_in.write(legs[1], Bytes::from("BBBB")).await.unwrap();
    assert!(matches!(fan_in.phase(master).await, Some(Phase::Waiting)));
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();
    fan_in.write(legs[0], Bytes::from("AAAA")).await.unwrap();
    fan_in.write_eof(legs[0]).await.unwrap();
    fan_in.wait(master).await.unwrap();

    let mut out = Vec::new();
    outward.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"AAAABBBBCCCC".to_vec());
  }

  #[tokio::test]
  async fn needs_conn_and_every_leg() {
    let fan_in = FanIn::new(FanConfig::default());
    let legs = ids(2);
    let master = legs[0];
    fan_in.register(legs[0], master).await.unwrap();
    fan_in.set_order(master, legs.clone()).await.unwrap();
    let (conn, _outward) = tokio::io::duplex(64);
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();
    assert!(!fan_in.try_send(master).await);
    assert!(matches!(fan_in.phase(master).await, Some(Phase::Waiting)));
    fan_in.register(legs[1], master).await.unwrap();
    assert!(matches!(fan_in.phase(master).await, Some(Phase::Sending)));
    assert!(!fan_in.try_send(master).await);
    let (again, _) = tokio::io::duplex(64);
    assert!(matches!(
      fan_in.set_conn(master, Box::new(again)).await,
      Err(FanError::ConnAttached(_))
    ));
    assert_eq!(fan_in.master_of(legs[1]).await, Some(master));
  }

  #[tokio::test]
  async fn replay_waits_for_conn_and_every_leg_in_any_order() {
    // Steps 0..3 register legs in `perm` order; the order and the conn land at any step
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
        for conn_at in 0..=3 {
          let fan_in = FanIn::new(FanConfig::default());
          let legs = ids(3);
          let master = legs[0];
          let (conn, _outward) = tokio::io::duplex(64);
          let mut conn = Some(conn);
          for step in 0..=3 {
            if step == order_at {
              fan_in.set_order(master, legs.clone()).await.unwrap();
            }
            if step == conn_at {
              if let Some(conn) = conn.take() {
                if fan_in.contains(master).await {
                  fan_in.set_conn(master, Box::new(conn)).await.unwrap();
                } else {
                  // The group does not exist yet; attach once it does
                  fan_in.register(legs[perm[0]], master).await.unwrap();
                  fan_in.set_conn(master, Box::new(conn)).await.unwrap();
                }
              }
            }
            if step == 3 {
              break;
            }
            assert!(
              !matches!(fan_in.phase(master).await, Some(Phase::Sending)),
              "perm={:?} order_at={} conn_at={} step={}",
              perm,
              order_at,
              conn_at,
              step
            );
            fan_in.register(legs[perm[step]], master).await.unwrap();
          }
          assert!(matches!(fan_in.phase(master).await, Some(Phase::Sending)));
          assert!(!fan_in.try_send(master).await, "sender must only start once");
          fan_in.remove_all(master).await;
        }
      }
    }
  }

  #[tokio::test]
  async fn order_with_repeated_legs_is_refused() {
    let fan_in = FanIn::new(FanConfig::default());
    let legs = ids(2);
    let master = legs[0];
    fan_in.register(master, master).await.unwrap();
    assert!(matches!(
      fan_in.set_order(master, vec![master, master]).await,
      Err(FanError::DuplicateLeg { .. })
    ));
    let (conn, _outward) = tokio::io::duplex(64);
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();
    assert!(matches!(fan_in.phase(master).await, Some(Phase::Waiting)));
    fan_in.set_order(master, legs.clone()).await.unwrap();
    fan_in.register(legs[1], master).await.unwrap();
    assert!(matches!(fan_in.phase(master).await, Some(Phase::Sending)));
  }

  #[tokio::test]
  async fn deregister_drops_an_unstarted_leg() {
    let fan_in = FanIn::new(FanConfig::default());
    let legs = ids(2);
    let master = legs[0];
    fan_in.register(legs[1], master).await.unwrap();
    fan_in.deregister(legs[1]).await;
    assert!(!fan_in.contains(master).await);
    assert_eq!(fan_in.master_of(legs[1]).await, None);

    // Groups that already have an order survive losing a leg
    fan_in.set_order(master, legs.clone()).await.unwrap();
    fan_in.register(legs[1], master).await.unwrap();
    fan_in.deregister(legs[1]).await;
    assert!(fan_in.contains(master).await);
    fan_in.deregister(legs[1]).await;
  }

  #[tokio::test]
  async fn remove_all_closes_conn_once_and_is_idempotent() {
    let fan_in = FanIn::new(FanConfig::default());
    let legs = ids(2);
    let master = legs[0];
    fan_in.set_order(master, legs.clone()).await.unwrap();
    fan_in.register(legs[0], master).await.unwrap();
    let (conn, mut outward) = tokio::io::duplex(64);
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();
    tokio::join!(fan_in.remove_all(master), fan_in.remove_all(master));
    fan_in.remove_all(master).await;
    let mut out = Vec::new();
    assert_eq!(outward.read_to_end(&mut out).await.unwrap(), 0);
    assert!(matches!(
      fan_in.write(legs[0], Bytes::from_static(b"late")).await,
      Err(FanError::UnknownLeg(_))
    ));
    assert!(matches!(fan_in.wait(master).await, Err(FanError::Closed(_))));
  }

  #[tokio::test]
  async fn remove_all_during_replay_stops_sender() {
    let fan_in = Arc::new(FanIn::new(FanConfig::default()));
    let legs = ids(2);
    let master = legs[0];
    fan_in.set_order(master, legs.clone()).await.unwrap();
    for leg in legs.iter() {
      fan_in.register(*leg, master).await.unwrap();
    }
    let (conn, mut outward) = tokio::io::duplex(64);
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();
    fan_in.write(legs[0], Bytes::from_static(b"first")).await.unwrap();
    let waiter = {
      let fan_in = fan_in.clone();
      tokio::spawn(async move { fan_in.wait(master).await })
    };
    let mut head = [0u8; 5];
    outward.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, b"first");
    fan_in.remove_all(master).await;
    assert!(matches!(waiter.await.unwrap(), Err(FanError::Closed(_))));
    let mut rest = Vec::new();
    assert_eq!(outward.read_to_end(&mut rest).await.unwrap(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn silent_leg_times_out() {
    let config = FanConfig {
      in_pop_timeout: Duration::from_secs(30),
      ..FanConfig::default()
    };
    let fan_in = FanIn::new(config);
    let legs = ids(1);
    let master = legs[0];
    fan_in.register(master, master).await.unwrap();
    fan_in.set_order(master, legs).await.unwrap();
    let (conn, _outward) = tokio::io::duplex(64);
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();
    assert!(matches!(
      fan_in.wait(master).await,
      Err(FanError::Timeout { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn sweep_is_capped_per_call() {
    let fan_in = FanIn::new(FanConfig::default());
    for _ in 0..1000 {
      let leg = ConnectionId::generate();
      fan_in.register(leg, leg).await.unwrap();
    }
    tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
    assert_eq!(fan_in.evict_idle().await, 100);
    assert_eq!(fan_in.len().await, 900);
  }

  #[tokio::test(start_paused = true)]
  async fn groups_without_a_conn_expire_early() {
    let fan_in = FanIn::new(FanConfig::default());
    let orphan = ids(2);
    fan_in.register(orphan[1], orphan[0]).await.unwrap();
    let live = ConnectionId::generate();
    fan_in.register(live, live).await.unwrap();
    fan_in.set_order(live, vec![live]).await.unwrap();
    let (conn, _outward) = tokio::io::duplex(64);
    fan_in.set_conn(live, Box::new(conn)).await.unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(fan_in.evict_idle().await, 0);
    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    assert_eq!(fan_in.evict_idle().await, 1);
    assert!(!fan_in.contains(orphan[0]).await);
    assert!(fan_in.contains(live).await);
  }

  async fn round_trip(legs: usize, delays: &[u64], chunks: &[Bytes]) -> Vec<u8> {
    let config = FanConfig::default();
    let fan_out = FanOut::new(config.clone());
    let fan_in = Arc::new(FanIn::new(config));
    let legs = ids(legs);
    let master = legs[0];
    for (n, leg) in legs.iter().enumerate() {
      let delay = Duration::from_millis(delays[n % delays.len()]);
      let forwarder = DelayedForwarder::spawn(*leg, delay, fan_in.clone());
      fan_out.register(master, *leg, Arc::new(forwarder)).await.unwrap();
      fan_in.register(*leg, master).await.unwrap();
    }
    fan_out.set_order(master, legs.clone()).await.unwrap();
    fan_in.set_order(master, legs.clone()).await.unwrap();
    let (conn, mut outward) = tokio::io::duplex(1 << 16);
    fan_in.set_conn(master, Box::new(conn)).await.unwrap();

    let reader = tokio::spawn(async move {
      let mut out = Vec::new();
      outward.read_to_end(&mut out).await.map(|_| out)
    });
    for chunk in chunks {
      fan_out.write(master, chunk.clone()).await.unwrap();
    }
    fan_out.write_eof(master).await.unwrap();
    fan_out.wait(master).await.unwrap();
    fan_in.wait(master).await.unwrap();
    reader.await.unwrap().unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn round_trip_preserves_order_for_one_to_eight_legs() {
    let delay_profiles: [&[u64]; 4] = [&[0], &[40, 1, 17], &[1, 90], &[5, 0, 33, 2, 71, 9, 13, 50]];
    let chunks: Vec<Bytes> = (0u32..57)
      .map(|n| {
        let len = 1 + (n as usize * 7) % 23;
        Bytes::from(vec![(n % 251) as u8; len])
      })
      .collect();
    let expected: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    for legs in 1..=8 {
      for delays in delay_profiles.iter() {
        assert_eq!(
          round_trip(legs, delays, &chunks).await,
          expected,
          "legs={} delays={:?}",
          legs,
          delays
        );
      }
    }
  }

  #[tokio::test(start_paused = true)]
  async fn three_chunks_over_three_legs_replay_in_write_order() {
    // The first leg is the slowest, so its chunk arrives last
    let out = round_trip(
      3,
      &[300, 20, 1],
      &[Bytes::from("AAAA"), Bytes::from("BBBB"), Bytes::from("CCCC")],
    )
    .await;
    assert_eq!(out, b"AAAABBBBCCCC".to_vec());
  }
}
