// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outward connections opened by the relay on behalf of a client
use std::{io, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::future::TryFutureExt;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpStream,
};

use super::Relay;
use crate::{
  common::{
    connection::{ConnectionState, LogicalConnection},
    fan::{FanError, FanOut, OutwardConn},
    hub::{Completion, EndpointError, Hub, Outcome, ProxyEndpoint},
    protocol::{
      envelope::{DataPayload, DataTag, Envelope, EstablishPayload, ProxyKind},
      id::ConnectionId,
    },
  },
  util::pipe::{BytePipe, PipeWriter},
};

const READ_BUFFER: usize = 32 * 1024;

/// A raw TCP tunnel to the target, used for SOCKS5 and HTTPS `CONNECT`
pub struct SocketEndpoint {
  master: ConnectionId,
  completion: Completion,
}

impl SocketEndpoint {
  pub fn new(master: ConnectionId) -> Self {
    Self {
      master,
      completion: Completion::new(),
    }
  }
}

impl ProxyEndpoint for SocketEndpoint {
  fn on_data(&self, payload: DataPayload) {
    tracing::trace!(master = %self.master, tag = ?payload.tag, "ignoring control data");
  }

  fn on_closed(&self, tell: bool) {
    self.completion.signal(Outcome::Closed { by_peer: !tell });
  }

  fn on_error(&self, error: EndpointError) {
    self.completion.signal(Outcome::Failed(error));
  }
}

/// A plain HTTP transaction; the request body is buffered in a [BytePipe] on its way out
pub struct HttpEndpoint {
  master: ConnectionId,
  completion: Completion,
  body: Arc<BytePipe>,
}

impl HttpEndpoint {
  pub fn new(master: ConnectionId) -> Self {
    Self {
      master,
      completion: Completion::new(),
      body: BytePipe::new(),
    }
  }
}

impl ProxyEndpoint for HttpEndpoint {
  fn on_data(&self, payload: DataPayload) {
    tracing::trace!(master = %self.master, tag = ?payload.tag, "ignoring control data");
  }

  fn on_closed(&self, tell: bool) {
    self.body.close();
    self.completion.signal(Outcome::Closed { by_peer: !tell });
  }

  fn on_error(&self, error: EndpointError) {
    self.body.close();
    self.completion.signal(Outcome::Failed(error));
  }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, EndpointError> {
  match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
    Ok(Ok(stream)) => {
      let _ = stream.set_nodelay(true);
      Ok(stream)
    }
    Ok(Err(e)) => Err(EndpointError::Establish(e.to_string())),
    Err(_) => Err(EndpointError::Establish(format!(
      "dial timed out after {:?}",
      timeout
    ))),
  }
}

async fn reply(hub: &Hub, master: ConnectionId, kind: ProxyKind, tag: DataTag, detail: &str) {
  let payload = DataPayload::new(tag, kind, Bytes::copy_from_slice(detail.as_bytes()));
  if let Err(error) = hub.link().send(Envelope::data(master, payload)).await {
    tracing::debug!(%master, ?error, "could not send establish reply");
  }
}

/// Copies the target's response into the fan-out group, then ends the stream
async fn download<R>(mut target: R, fan_out: &FanOut, master: ConnectionId) -> Result<(), EndpointError>
where
  R: AsyncRead + Unpin,
{
  let mut buffer = BytesMut::with_capacity(READ_BUFFER);
  loop {
    buffer.reserve(READ_BUFFER);
    let read = target
      .read_buf(&mut buffer)
      .await
      .map_err(FanError::from)?;
    if read == 0 {
      break;
    }
    fan_out.write(master, buffer.split().freeze()).await?;
  }
  fan_out.write_eof(master).await?;
  fan_out.wait(master).await?;
  Ok(())
}

/// Drives the connection until it drains or is told to stop
async fn converge<R>(
  relay: &Relay,
  conn: &LogicalConnection,
  completion: &Completion,
  target_read: R,
) -> Outcome
where
  R: AsyncRead + Unpin,
{
  let master = conn.id;
  let upload = relay.fan_in().wait(master).map_err(EndpointError::from).map_ok(|()| {
    conn.advance(ConnectionState::HalfClosed);
  });
  let drained = futures::future::try_join(upload, download(target_read, relay.fan_out(), master));
  tokio::select! {
    outcome = completion.wait() => outcome,
    drained = drained => match drained {
      Ok(_) => Outcome::Closed { by_peer: false },
      Err(error) => Outcome::Failed(error),
    },
  }
}

async fn teardown(relay: &Relay, hub: &Hub, conn: &LogicalConnection, outcome: &Outcome) {
  let master = conn.id;
  if !conn.close() {
    return;
  }
  hub.registry().remove(&master);
  relay.retire(master).await;
  hub.untrack_master(&master);
  if outcome.tell_peer() {
    if let Err(error) = hub.tell_closed(master).await {
      tracing::debug!(%master, ?error, "could not send close");
    }
  }
  match outcome {
    Outcome::Closed { by_peer } => tracing::debug!(%master, by_peer, "connection closed"),
    Outcome::Rejected(error) => tracing::warn!(%master, %error, "establish failed"),
    Outcome::Failed(error) => tracing::warn!(%master, ?error, "connection failed"),
  }
}

async fn attach(relay: &Relay, master: ConnectionId, conn: OutwardConn) -> Result<(), EndpointError> {
  relay.fan_in().set_conn(master, conn).await?;
  Ok(())
}

/// Opens a raw tunnel: the preamble goes straight to the target, then bytes flow both ways
pub(crate) async fn run_socket(
  relay: Arc<Relay>,
  hub: Arc<Hub>,
  conn: Arc<LogicalConnection>,
  payload: EstablishPayload,
  endpoint: Arc<SocketEndpoint>,
) {
  let master = conn.id;
  let kind = conn.kind;
  conn.advance(ConnectionState::Establishing);
  let opened = async {
    let target = dial(&conn.addr, relay.config().dial_timeout).await?;
    let (target_read, mut target_write) = target.into_split();
    if let Some(preamble) = payload.preamble() {
      target_write
        .write_all(preamble)
        .await
        .map_err(|e| EndpointError::Establish(e.to_string()))?;
    }
    attach(&relay, master, Box::new(target_write)).await?;
    Ok::<_, EndpointError>(target_read)
  };
  let target_read = match opened.await {
    Ok(target_read) => target_read,
    Err(error) => {
      let detail = error.to_string();
      teardown(&relay, &hub, &conn, &Outcome::Rejected(error)).await;
      return reply(&hub, master, kind, DataTag::EstablishError, &detail).await;
    }
  };
  reply(&hub, master, kind, DataTag::EstablishOk, "").await;
  conn.advance(ConnectionState::Open);
  tracing::debug!(addr = %conn.addr, "connection open");
  let outcome = converge(&relay, &conn, &endpoint.completion, target_read).await;
  teardown(&relay, &hub, &conn, &outcome).await;
}

/// Feeds the buffered request through to the target after its header
async fn forward_body<W>(mut target: W, header: Bytes, body: Arc<BytePipe>) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  target.write_all(&header).await?;
  while let Some(chunk) = body.read(READ_BUFFER).await {
    target.write_all(&chunk).await?;
  }
  target.shutdown().await
}

/// Performs an HTTP transaction whose request body arrives through the fan-in group
pub(crate) async fn run_http(
  relay: Arc<Relay>,
  hub: Arc<Hub>,
  conn: Arc<LogicalConnection>,
  payload: EstablishPayload,
  endpoint: Arc<HttpEndpoint>,
) {
  let master = conn.id;
  let kind = conn.kind;
  conn.advance(ConnectionState::Establishing);
  let opened = async {
    let header = payload
      .preamble()
      .cloned()
      .ok_or_else(|| EndpointError::Establish("http header empty".to_string()))?;
    let target = dial(&conn.addr, relay.config().dial_timeout).await?;
    let (target_read, target_write) = target.into_split();
    attach(&relay, master, Box::new(PipeWriter::new(Arc::clone(&endpoint.body)))).await?;
    Ok::<_, EndpointError>((target_read, target_write, header))
  };
  let (target_read, target_write, header) = match opened.await {
    Ok(opened) => opened,
    Err(error) => {
      let detail = error.to_string();
      endpoint.body.close();
      teardown(&relay, &hub, &conn, &Outcome::Rejected(error)).await;
      return reply(&hub, master, kind, DataTag::EstablishError, &detail).await;
    }
  };
  reply(&hub, master, kind, DataTag::EstablishOk, "").await;
  conn.advance(ConnectionState::Open);
  tracing::debug!(addr = %conn.addr, "http transaction open");

  let body = Arc::clone(&endpoint.body);
  let forwarding = tokio::spawn(async move {
    if let Err(error) = forward_body(target_write, header, body).await {
      tracing::debug!(?error, "request body forwarding stopped");
    }
  });
  let outcome = converge(&relay, &conn, &endpoint.completion, target_read).await;
  endpoint.body.close();
  forwarding.abort();
  teardown(&relay, &hub, &conn, &outcome).await;
}
