// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a logical connection or one of its legs
///
/// Ids are time-ordered, so sorting them approximates creation order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
  pub fn new(inner: Uuid) -> ConnectionId {
    Self(inner)
  }

  pub fn generate() -> ConnectionId {
    Self(Uuid::now_v7())
  }

  /// The id carried by heartbeat frames, which address no connection
  pub const fn nil() -> ConnectionId {
    Self(Uuid::nil())
  }

  pub fn is_nil(&self) -> bool {
    self.0.is_nil()
  }

  pub fn inner(&self) -> Uuid {
    self.0
  }
}

impl From<Uuid> for ConnectionId {
  fn from(inner: Uuid) -> Self {
    Self::new(inner)
  }
}

impl From<ConnectionId> for Uuid {
  fn from(id: ConnectionId) -> Self {
    id.inner()
  }
}

impl FromStr for ConnectionId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s).map(Self)
  }
}

impl fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0.hyphenated(), f)
  }
}

impl fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("ConnectionId").field(&self.0.hyphenated().to_string()).finish()
  }
}
