// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;

use tokio_tungstenite::tungstenite;

pub mod connection;
pub mod fan;
pub mod hub;
pub mod protocol;

use protocol::{negotiation::NegotiationError, transport::TransportError};

/// Failures that end a whole WebSocket session rather than one logical connection
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Version negotiation failed")]
  Negotiation(#[from] NegotiationError),
  #[error("Transport failed")]
  Transport(#[from] TransportError),
  #[error("WebSocket handshake or read failed")]
  WebSocket(#[from] tungstenite::Error),
  #[error("Socket I/O failed")]
  Io(#[from] io::Error),
  #[error("Connection key is not a valid header value")]
  InvalidKey,
  #[error("No WebSocket legs are available")]
  NoLegs,
  #[error("Session is shut down")]
  Shutdown,
}
