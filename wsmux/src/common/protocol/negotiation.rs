// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Version exchange performed once per WebSocket connection, before any routing
//!
//! The client announces its version; the server answers with its own version, the
//! oldest client it supports, and whether it serves a status page. The client then
//! decides whether the pairing is usable.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{tungstenite, tungstenite::Message as WsMessage, WebSocketStream};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_CODE: u32 = 0x004;
pub const COMPATIBLE_VERSION_CODE: u32 = 0x003;
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionNeg {
  pub version: String,
  pub version_code: u32,
  pub compatible_version_code: u32,
  #[serde(default)]
  pub status_page_enabled: bool,
}

impl VersionNeg {
  pub fn local(status_page_enabled: bool) -> Self {
    Self {
      version: VERSION.to_string(),
      version_code: VERSION_CODE,
      compatible_version_code: COMPATIBLE_VERSION_CODE,
      status_page_enabled,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum NegotiationError {
  #[error("WebSocket failure during version exchange")]
  WebSocket(#[from] tungstenite::Error),
  #[error("Peer sent an unreadable version message")]
  ProtocolViolation(#[source] Option<serde_json::Error>),
  #[error("Peer closed the connection during version exchange")]
  Closed,
  #[error("Version exchange timed out")]
  Timeout,
  #[error(
    "Client version code {client} is outside the server's supported range {compatible}..={current}"
  )]
  Incompatible {
    client: u32,
    compatible: u32,
    current: u32,
  },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compatibility {
  Exact,
  /// Codes are compatible but the release strings differ
  VersionMismatch { local: String, remote: String },
}

/// Checks a client's version code against the range a server advertises
pub fn check_compatibility(
  client_version: &str,
  client_code: u32,
  server: &VersionNeg,
) -> Result<Compatibility, NegotiationError> {
  if client_code < server.compatible_version_code || client_code > server.version_code {
    return Err(NegotiationError::Incompatible {
      client: client_code,
      compatible: server.compatible_version_code,
      current: server.version_code,
    });
  }
  if client_version != server.version {
    Ok(Compatibility::VersionMismatch {
      local: client_version.to_string(),
      remote: server.version.clone(),
    })
  } else {
    Ok(Compatibility::Exact)
  }
}

async fn send_version<S>(
  ws: &mut WebSocketStream<S>,
  version: &VersionNeg,
) -> Result<(), NegotiationError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let text = serde_json::to_string(version).map_err(|e| NegotiationError::ProtocolViolation(Some(e)))?;
  ws.send(WsMessage::Text(text)).await?;
  Ok(())
}

async fn receive_version<S>(ws: &mut WebSocketStream<S>) -> Result<VersionNeg, NegotiationError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let raw = match ws.next().await {
      None => return Err(NegotiationError::Closed),
      Some(message) => message?,
    };
    let parsed = match raw {
      WsMessage::Text(text) => serde_json::from_str(&text),
      WsMessage::Binary(raw) => serde_json::from_slice(&raw),
      WsMessage::Close(_) => return Err(NegotiationError::Closed),
      WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
    };
    return parsed.map_err(|e| NegotiationError::ProtocolViolation(Some(e)));
  }
}

pub struct NegotiationClient {
  local: VersionNeg,
}

impl NegotiationClient {
  pub fn new() -> Self {
    Self {
      local: VersionNeg::local(false),
    }
  }

  pub fn with_version(local: VersionNeg) -> Self {
    Self { local }
  }

  /// Runs the client half of the exchange, failing fast on an incompatible server
  pub async fn handle<S>(&self, ws: &mut WebSocketStream<S>) -> Result<VersionNeg, NegotiationError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let exchange = async {
      send_version(ws, &self.local).await?;
      receive_version(ws).await
    };
    let remote = tokio::time::timeout(NEGOTIATION_TIMEOUT, exchange)
      .await
      .map_err(|_| NegotiationError::Timeout)??;
    match check_compatibility(&self.local.version, self.local.version_code, &remote)? {
      Compatibility::Exact => {}
      Compatibility::VersionMismatch { local, remote } => {
        tracing::warn!(%local, %remote, "Server runs a different release; continuing");
      }
    }
    Ok(remote)
  }
}

impl Default for NegotiationClient {
  fn default() -> Self {
    Self::new()
  }
}

pub struct NegotiationService {
  local: VersionNeg,
}

impl NegotiationService {
  pub fn new(status_page_enabled: bool) -> Self {
    Self {
      local: VersionNeg::local(status_page_enabled),
    }
  }

  pub fn with_version(local: VersionNeg) -> Self {
    Self { local }
  }

  /// Reads the client's announcement and answers with the server's version
  pub async fn handle<S>(&self, ws: &mut WebSocketStream<S>) -> Result<VersionNeg, NegotiationError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let exchange = async {
      let remote = receive_version(ws).await?;
      send_version(ws, &self.local).await?;
      Ok::<_, NegotiationError>(remote)
    };
    let remote = tokio::time::timeout(NEGOTIATION_TIMEOUT, exchange)
      .await
      .map_err(|_| NegotiationError::Timeout)??;
    if check_compatibility(&remote.version, remote.version_code, &self.local).is_err() {
      tracing::info!(
        client_code = remote.version_code,
        "Client is outside the supported version range"
      );
    }
    Ok(remote)
  }
}
