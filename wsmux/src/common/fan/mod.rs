// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Striping of one logical connection across several WebSocket legs
//!
//! [FanOut] deals consecutive writes to legs in a fixed order; [FanIn] replays per-leg
//! queues in that same order, which restores the original write sequence regardless of
//! which leg delivers first.
use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::{io::AsyncWrite, sync::watch};

use crate::common::protocol::id::ConnectionId;

pub mod fan_in;
pub mod fan_out;

pub use fan_in::FanIn;
pub use fan_out::FanOut;

#[derive(Clone, Debug)]
pub struct FanConfig {
  /// Chunks buffered per queue before producers wait
  pub queue_capacity: usize,
  pub push_timeout: Duration,
  /// How long the fan-out sender waits for the next local chunk
  pub out_pop_timeout: Duration,
  /// How long the fan-in sender waits on the next leg in order
  pub in_pop_timeout: Duration,
  /// Age after which a group is swept regardless of activity
  pub expiry: Duration,
  /// Age after which a group whose sender never started is swept
  pub pending_expiry: Duration,
  /// Upper bound on groups removed by one sweep
  pub sweep_batch: usize,
}

impl Default for FanConfig {
  fn default() -> Self {
    Self {
      queue_capacity: 10,
      push_timeout: Duration::from_secs(5 * 60),
      out_pop_timeout: Duration::from_secs(5 * 60),
      in_pop_timeout: Duration::from_secs(10 * 60),
      expiry: Duration::from_secs(60 * 60),
      pending_expiry: Duration::from_secs(2 * 60),
      sweep_batch: 100,
    }
  }
}

impl FanConfig {
  pub fn low_latency() -> Self {
    Self {
      queue_capacity: 1,
      push_timeout: Duration::from_secs(10),
      out_pop_timeout: Duration::from_secs(10),
      in_pop_timeout: Duration::from_secs(10),
      ..Default::default()
    }
  }
}

#[derive(Clone, Debug)]
pub(crate) enum Chunk {
  Data(Bytes),
  Eof,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum FanError {
  #[error("Group {0} is closed")]
  Closed(ConnectionId),
  #[error("Group {master} timed out while {during}")]
  Timeout {
    master: ConnectionId,
    during: &'static str,
  },
  #[error("Leg {leg} already belongs to group {master}")]
  LegConflict {
    leg: ConnectionId,
    master: ConnectionId,
  },
  #[error("Leg order for group {0} is already fixed")]
  OrderAlreadySet(ConnectionId),
  #[error("Leg order for group {0} is empty")]
  EmptyOrder(ConnectionId),
  #[error("Leg {leg} appears more than once in the order for group {master}")]
  DuplicateLeg {
    leg: ConnectionId,
    master: ConnectionId,
  },
  #[error("Leg {0} is not part of any group's order")]
  UnknownLeg(ConnectionId),
  #[error("Group {0} already has a connection attached")]
  ConnAttached(ConnectionId),
  #[error("Stream I/O failed")]
  Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for FanError {
  fn from(e: io::Error) -> Self {
    FanError::Io(Arc::new(e))
  }
}

/// Progress of a group's sender task
#[derive(Clone, Debug)]
pub enum Phase {
  Waiting,
  Sending,
  Done(Result<(), FanError>),
}

impl Phase {
  pub fn is_done(&self) -> bool {
    matches!(self, Phase::Done(_))
  }
}

/// Records `result` unless the group already finished
pub(crate) fn finish(phase: &watch::Sender<Phase>, result: Result<(), FanError>) {
  phase.send_if_modified(|p| {
    if p.is_done() {
      false
    } else {
      *p = Phase::Done(result);
      true
    }
  });
}

pub(crate) async fn wait_done(mut phase: watch::Receiver<Phase>) -> Result<(), FanError> {
  match phase.wait_for(Phase::is_done).await {
    Ok(p) => match &*p {
      Phase::Done(result) => result.clone(),
      _ => Ok(()),
    },
    // Sender dropped without finishing; the group was torn down
    Err(_) => Ok(()),
  }
}

/// Destination for the chunks a fan-out sender deals to one leg
pub trait LegWriter: Send + Sync {
  fn write(&self, data: Bytes) -> BoxFuture<'_, io::Result<()>>;
  fn write_eof(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// The single ordered destination of a fan-in group
pub type OutwardConn = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Validates a proposed leg order against the legs already present
pub(crate) fn check_order<'a>(
  master: ConnectionId,
  current: Option<&Vec<ConnectionId>>,
  proposed: &[ConnectionId],
  registered: impl Iterator<Item = &'a ConnectionId>,
) -> Result<bool, FanError> {
  if proposed.is_empty() {
    return Err(FanError::EmptyOrder(master));
  }
  // Readiness compares distinct registrations against the order's length
  for (at, leg) in proposed.iter().enumerate() {
    if proposed[..at].contains(leg) {
      return Err(FanError::DuplicateLeg { leg: *leg, master });
    }
  }
  if let Some(current) = current {
    return if current.as_slice() == proposed {
      Ok(false)
    } else {
      Err(FanError::OrderAlreadySet(master))
    };
  }
  for leg in registered {
    if !proposed.contains(leg) {
      return Err(FanError::UnknownLeg(*leg));
    }
  }
  Ok(true)
}
