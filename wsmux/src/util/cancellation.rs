// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Shutdown signal handed to accept loops and sessions
///
/// Only the owner of the underlying [CancellationToken] can trigger it; holders may only wait.
#[derive(Debug, Clone, Default)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio_util::sync::CancellationToken;

  use super::CancellationListener;

  #[tokio::test]
  async fn listeners_wake_when_owner_cancels() {
    let owner = CancellationToken::new();
    let listener = CancellationListener::from(owner.clone());
    let waiter = {
      let listener = listener.clone();
      tokio::spawn(async move { listener.cancelled().await })
    };
    assert!(tokio::time::timeout(Duration::from_millis(20), listener.cancelled())
      .await
      .is_err());
    owner.cancel();
    waiter.await.unwrap();
    listener.cancelled().await;
  }
}
