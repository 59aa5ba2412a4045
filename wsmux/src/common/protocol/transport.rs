// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Serialized frame writing over one WebSocket connection
use std::{
  io,
  sync::{Arc, OnceLock},
  time::Duration,
};

use bytes::Bytes;
use futures::{
  future::{BoxFuture, FutureExt},
  stream::SplitSink,
  SinkExt,
};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::Mutex,
};
use tokio_tungstenite::{tungstenite, tungstenite::Message as WsMessage, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
  envelope::{DataPayload, DataTag, Envelope, EnvelopeError, ProxyKind},
  id::ConnectionId,
};
use crate::common::fan::LegWriter;

/// Upgrade request header carrying the shared connection key
pub const KEY_HEADER: &str = "Key";
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("WebSocket failure")]
  WebSocket(#[from] tungstenite::Error),
  #[error("Frame could not be encoded")]
  Envelope(#[from] EnvelopeError),
  #[error("Frame write timed out")]
  WriteTimeout,
  #[error("Link is closed")]
  Closed,
}

impl From<TransportError> for io::Error {
  fn from(e: TransportError) -> Self {
    let kind = match &e {
      TransportError::WriteTimeout => io::ErrorKind::TimedOut,
      TransportError::Closed => io::ErrorKind::BrokenPipe,
      _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
  }
}

/// Outbound half of one WebSocket connection
///
/// Implementations must serialize frame writes; at most one frame is in flight at a time.
pub trait Link: Send + Sync {
  fn send(&self, envelope: Envelope) -> BoxFuture<'_, Result<(), TransportError>>;

  fn close(&self) -> BoxFuture<'_, ()>;
}

pub struct WsLink<S> {
  sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
  write_timeout: Duration,
}

impl<S> WsLink<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  pub fn new(sink: SplitSink<WebSocketStream<S>, WsMessage>, write_timeout: Duration) -> Self {
    Self {
      sink: Mutex::new(sink),
      write_timeout,
    }
  }

  async fn send_text(&self, text: String) -> Result<(), TransportError> {
    let mut sink = self.sink.lock().await;
    match tokio::time::timeout(self.write_timeout, sink.send(WsMessage::Text(text))).await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
        Err(TransportError::Closed)
      }
      Ok(Err(e)) => Err(e.into()),
      Err(_) => Err(TransportError::WriteTimeout),
    }
  }
}

impl<S> Link for WsLink<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  fn send(&self, envelope: Envelope) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      // Encode outside the framing lock
      let text = envelope.encode()?;
      tracing::trace!(id = %envelope.id, kind = envelope.message.type_name(), "sending frame");
      self.send_text(text).await
    }
    .boxed()
  }

  fn close(&self) -> BoxFuture<'_, ()> {
    async move {
      let mut sink = self.sink.lock().await;
      let _ = tokio::time::timeout(self.write_timeout, sink.close()).await;
    }
    .boxed()
  }
}

/// What one inbound WebSocket message means to the dispatcher
#[derive(Debug)]
pub enum Inbound {
  Frame(Result<Envelope, EnvelopeError>),
  /// Ping, pong, or raw frames; nothing to route
  Control,
  Closed,
}

impl From<WsMessage> for Inbound {
  fn from(message: WsMessage) -> Self {
    match message {
      WsMessage::Text(text) => Inbound::Frame(Envelope::decode(text.as_bytes())),
      WsMessage::Binary(raw) => Inbound::Frame(Envelope::decode(&raw)),
      WsMessage::Close(_) => Inbound::Closed,
      WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Inbound::Control,
    }
  }
}

/// Proxy kind of a connection, shared by its legs and filled in by its establish request
pub type SharedKind = Arc<OnceLock<ProxyKind>>;

/// Writes one leg's share of a striped stream as `data` frames addressed to the leg
pub struct LegSink {
  link: Arc<dyn Link>,
  leg: ConnectionId,
  kind: SharedKind,
}

impl LegSink {
  pub fn new(link: Arc<dyn Link>, leg: ConnectionId, kind: ProxyKind) -> Self {
    Self::deferred(link, leg, Arc::new(OnceLock::from(kind)))
  }

  /// A sink for a leg announced before its connection's kind is known
  pub fn deferred(link: Arc<dyn Link>, leg: ConnectionId, kind: SharedKind) -> Self {
    Self { link, leg, kind }
  }

  fn kind(&self) -> ProxyKind {
    // Dealing starts only after the master leg enrolls, which sets the kind
    self.kind.get().copied().unwrap_or(ProxyKind::Socks5)
  }
}

impl LegWriter for LegSink {
  fn write(&self, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
    let envelope = Envelope::data(self.leg, DataPayload::new(DataTag::Data, self.kind(), data));
    async move { self.link.send(envelope).await.map_err(io::Error::from) }.boxed()
  }

  fn write_eof(&self) -> BoxFuture<'_, io::Result<()>> {
    let envelope = Envelope::data(self.leg, DataPayload::signal(DataTag::Eof, self.kind()));
    async move { self.link.send(envelope).await.map_err(io::Error::from) }.boxed()
  }
}

/// Sends a heartbeat every `interval` until cancelled or the link fails
pub async fn heartbeat(
  link: Arc<dyn Link>,
  interval: Duration,
  cancel: CancellationToken,
) -> Result<(), TransportError> {
  let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => return Ok(()),
      _ = ticker.tick() => link.send(Envelope::heartbeat()).await?,
    }
  }
}
