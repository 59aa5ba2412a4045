// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client side: local proxy requests multiplexed and striped over WebSocket legs
use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

use anyhow::Context as AnyhowContext;
use bytes::BytesMut;
use futures::{stream::SplitStream, StreamExt};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::{TcpListener, TcpStream},
  sync::watch,
};
use tokio_tungstenite::{
  tungstenite::{client::IntoClientRequest, http::header::HeaderName, http::HeaderValue},
  MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    connection::{ConnectionState, LogicalConnection},
    fan::{FanConfig, FanError, FanIn, FanOut},
    hub::{Completion, EndpointError, Outcome, ProxyEndpoint, Registry},
    protocol::{
      envelope::{DataPayload, DataTag, Envelope, EstablishPayload, Message},
      id::ConnectionId,
      negotiation::NegotiationClient,
      transport::{
        heartbeat, Inbound, LegSink, Link, TransportError, WsLink, DEFAULT_HEARTBEAT_INTERVAL,
        DEFAULT_WRITE_TIMEOUT, KEY_HEADER,
      },
    },
    SessionError,
  },
  util::cancellation::CancellationListener,
};

pub mod handshake;

use handshake::{failure_reply, success_reply, ProxyRequest};

const READ_BUFFER: usize = 32 * 1024;
pub const MAX_LEGS: usize = 8;

#[derive(Clone, Debug)]
pub struct ClientConfig {
  /// WebSocket connections opened to the relay; each logical connection is striped over all of them
  pub legs: usize,
  pub connection_key: Option<String>,
  pub heartbeat_interval: Duration,
  pub write_timeout: Duration,
  /// Accept HTTP proxy requests locally in addition to SOCKS5
  pub enable_http: bool,
  pub establish_timeout: Duration,
  pub fan: FanConfig,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      legs: 1,
      connection_key: None,
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      write_timeout: DEFAULT_WRITE_TIMEOUT,
      enable_http: false,
      establish_timeout: Duration::from_secs(30),
      fan: FanConfig::default(),
    }
  }
}

/// Waits on the relay's answer to one `Establish`
struct ClientEndpoint {
  master: ConnectionId,
  established: watch::Sender<bool>,
  completion: Completion,
}

impl ClientEndpoint {
  fn new(master: ConnectionId) -> Self {
    let (established, _) = watch::channel(false);
    Self {
      master,
      established,
      completion: Completion::new(),
    }
  }

  async fn established(&self, timeout: Duration) -> Result<(), Outcome> {
    let mut rx = self.established.subscribe();
    let ready = async move { rx.wait_for(|ok| *ok).await.map(|_| ()) };
    tokio::select! {
      biased;
      outcome = self.completion.wait() => Err(outcome),
      ready = tokio::time::timeout(timeout, ready) => match ready {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(Outcome::Failed(EndpointError::TransportLost)),
        Err(_) => Err(Outcome::Failed(EndpointError::Establish(format!(
          "no answer from relay within {:?}",
          timeout
        )))),
      },
    }
  }
}

impl ProxyEndpoint for ClientEndpoint {
  fn on_data(&self, payload: DataPayload) {
    match payload.tag {
      DataTag::EstablishOk => {
        self.established.send_replace(true);
      }
      DataTag::EstablishError => {
        let reason = String::from_utf8_lossy(&payload.data).into_owned();
        self
          .completion
          .signal(Outcome::Rejected(EndpointError::Establish(reason)));
      }
      tag => tracing::trace!(master = %self.master, ?tag, "ignoring control data"),
    }
  }

  fn on_closed(&self, tell: bool) {
    self.completion.signal(Outcome::Closed { by_peer: !tell });
  }

  fn on_error(&self, error: EndpointError) {
    self.completion.signal(Outcome::Failed(error));
  }
}

/// A set of negotiated WebSocket legs to one relay, shared by every local connection
///
/// Losing any leg ends the session, since every logical connection is striped over all legs.
pub struct ClientSession {
  config: ClientConfig,
  links: Vec<Arc<dyn Link>>,
  rotation: AtomicUsize,
  registry: Registry,
  fan_out: FanOut,
  fan_in: FanIn,
  cancel: CancellationToken,
}

impl ClientSession {
  /// Dials `config.legs` WebSocket connections to `remote` and negotiates each of them
  pub async fn connect(remote: &str, config: ClientConfig) -> Result<Arc<Self>, SessionError> {
    let legs = config.legs.clamp(1, MAX_LEGS);
    let mut streams: Vec<WebSocketStream<MaybeTlsStream<TcpStream>>> = Vec::with_capacity(legs);
    for index in 0..legs {
      let mut request = remote.into_client_request()?;
      if let Some(key) = &config.connection_key {
        let name =
          HeaderName::from_bytes(KEY_HEADER.as_bytes()).map_err(|_| SessionError::InvalidKey)?;
        let value = HeaderValue::from_str(key).map_err(|_| SessionError::InvalidKey)?;
        request.headers_mut().insert(name, value);
      }
      let (ws, response) = tokio_tungstenite::connect_async(request).await?;
      tracing::debug!(index, status = %response.status(), "leg connected");
      streams.push(ws);
    }
    Self::from_legs(streams, config).await
  }

  /// Negotiates already-upgraded WebSocket connections and starts their read loops
  pub async fn from_legs<S>(
    legs: Vec<WebSocketStream<S>>,
    config: ClientConfig,
  ) -> Result<Arc<Self>, SessionError>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    if legs.is_empty() {
      return Err(SessionError::NoLegs);
    }
    let negotiation = NegotiationClient::new();
    let mut links: Vec<Arc<dyn Link>> = Vec::with_capacity(legs.len());
    let mut streams = Vec::with_capacity(legs.len());
    for mut ws in legs {
      let server = negotiation.handle(&mut ws).await?;
      tracing::debug!(
        version = %server.version,
        status_page = server.status_page_enabled,
        "relay accepted leg"
      );
      let (sink, stream) = ws.split();
      links.push(Arc::new(WsLink::new(sink, config.write_timeout)));
      streams.push(stream);
    }

    let session = Arc::new(Self {
      links,
      rotation: AtomicUsize::new(0),
      registry: Registry::new(),
      fan_out: FanOut::new(config.fan.clone()),
      fan_in: FanIn::new(config.fan.clone()),
      cancel: CancellationToken::new(),
      config,
    });
    for (index, stream) in streams.into_iter().enumerate() {
      let reader = Arc::clone(&session);
      tokio::spawn(
        async move {
          if let Err(error) = Arc::clone(&reader).read_loop(stream).await {
            tracing::error!(?error, "leg failed; ending session");
          }
          reader.shutdown().await;
        }
        .instrument(tracing::info_span!("leg", index)),
      );

      let link = Arc::clone(&session.links[index]);
      let beater = Arc::clone(&session);
      let interval = session.config.heartbeat_interval;
      tokio::spawn(
        async move {
          if let Err(error) = heartbeat(link, interval, beater.cancel.child_token()).await {
            tracing::warn!(?error, "heartbeat failed; ending session");
            beater.shutdown().await;
          }
        }
        .instrument(tracing::debug_span!("heartbeat", index)),
      );
    }
    tracing::info!(legs = session.links.len(), "session established");
    Ok(session)
  }

  pub fn legs(&self) -> usize {
    self.links.len()
  }

  /// Logical connections currently registered
  pub fn active(&self) -> usize {
    self.registry.len()
  }

  pub fn is_closed(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Fails every open logical connection and closes all legs; idempotent
  pub async fn shutdown(&self) {
    if self.cancel.is_cancelled() {
      return;
    }
    self.cancel.cancel();
    let failed = self.registry.close_all();
    for link in self.links.iter() {
      link.close().await;
    }
    tracing::info!(failed, "session closed");
  }

  async fn read_loop<S>(
    self: Arc<Self>,
    mut stream: SplitStream<WebSocketStream<S>>,
  ) -> Result<(), SessionError>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    loop {
      let next = tokio::select! {
        _ = self.cancel.cancelled() => return Ok(()),
        next = stream.next() => next,
      };
      let message = match next {
        None => return Err(TransportError::Closed.into()),
        Some(Err(e)) => return Err(SessionError::WebSocket(e)),
        Some(Ok(message)) => message,
      };
      match Inbound::from(message) {
        Inbound::Frame(Ok(envelope)) => self.dispatch(envelope).await,
        Inbound::Frame(Err(error)) => tracing::debug!(?error, "dropping malformed frame"),
        Inbound::Control => {}
        Inbound::Closed => return Err(TransportError::Closed.into()),
      }
    }
  }

  async fn dispatch(&self, envelope: Envelope) {
    let Envelope { id, message } = envelope;
    let kind = message.type_name();
    match message {
      Message::Heartbeat => tracing::trace!("heartbeat"),
      Message::Data(payload) if payload.tag.is_stream() => self.on_stream_data(id, payload).await,
      Message::Data(payload) => match self.registry.get(&id) {
        Some(endpoint) => endpoint.on_data(payload),
        None => tracing::debug!(%id, tag = ?payload.tag, "control data for unknown connection"),
      },
      Message::Close => match self.registry.get(&id) {
        Some(endpoint) => endpoint.on_closed(false),
        None => tracing::trace!(%id, "close for unknown connection"),
      },
      Message::Hi(_) | Message::Establish(_) => {
        tracing::debug!(%id, kind, "unexpected frame from relay")
      }
    }
  }

  async fn on_stream_data(&self, leg: ConnectionId, payload: DataPayload) {
    let result = match payload.tag {
      DataTag::Data => self.fan_in.write(leg, payload.data).await.map(|_| ()),
      _ => self.fan_in.write_eof(leg).await,
    };
    match result {
      Ok(()) => {}
      Err(FanError::UnknownLeg(_)) => tracing::debug!(%leg, "data for unknown leg"),
      Err(error) => {
        tracing::warn!(%leg, ?error, "leg write failed; failing its connection");
        let endpoint = match self.fan_in.master_of(leg).await {
          Some(master) => self.registry.get(&master),
          None => None,
        };
        if let Some(endpoint) = endpoint {
          endpoint.on_error(EndpointError::Fan(error));
        }
      }
    }
  }

  /// Registers every leg of a new connection in both engines, then announces it to the relay
  async fn enroll(
    &self,
    conn: &LogicalConnection,
    legs: &[(ConnectionId, Arc<dyn Link>)],
    preamble: Option<bytes::Bytes>,
  ) -> Result<(), EndpointError> {
    let master = conn.id;
    for (leg, link) in legs {
      self.fan_in.register(*leg, master).await?;
      let writer = Arc::new(LegSink::new(Arc::clone(link), *leg, conn.kind));
      self.fan_out.register(master, *leg, writer).await?;
    }
    self.fan_in.set_order(master, conn.sorted.clone()).await?;
    self.fan_out.set_order(master, conn.sorted.clone()).await?;

    for (leg, link) in legs.iter().skip(1) {
      link
        .send(Envelope::hi(*leg, master))
        .await
        .map_err(|_| EndpointError::TransportLost)?;
    }
    let payload = EstablishPayload::new(conn.kind, conn.addr.clone(), preamble, conn.sorted.clone());
    legs[0]
      .1
      .send(Envelope::new(master, Message::Establish(payload)))
      .await
      .map_err(|_| EndpointError::TransportLost)
  }

  /// Relays one accepted local connection until either side finishes
  ///
  /// The master leg rotates across transports from one connection to the next.
  pub async fn open<L>(
    self: &Arc<Self>,
    request: ProxyRequest,
    mut local: L,
  ) -> Result<Outcome, SessionError>
  where
    L: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
  {
    if self.cancel.is_cancelled() {
      return Err(SessionError::Shutdown);
    }
    let count = self.links.len();
    if count == 0 {
      return Err(SessionError::NoLegs);
    }
    let master = ConnectionId::generate();
    let first = self.rotation.fetch_add(1, Ordering::Relaxed) % count;
    let legs: Vec<(ConnectionId, Arc<dyn Link>)> = (0..count)
      .map(|i| {
        let leg = if i == 0 { master } else { ConnectionId::generate() };
        (leg, Arc::clone(&self.links[(first + i) % count]))
      })
      .collect();
    let sorted = legs.iter().map(|(leg, _)| *leg).collect();
    let kind = request.kind;
    let conn = LogicalConnection::new(master, request.addr, kind, sorted);
    let master_link = Arc::clone(&legs[0].1);
    conn.advance(ConnectionState::AwaitingLegs);

    let endpoint = Arc::new(ClientEndpoint::new(master));
    self
      .registry
      .add(master, Arc::clone(&endpoint) as Arc<dyn ProxyEndpoint>);

    let established = match self.enroll(&conn, &legs, request.preamble).await {
      Ok(()) => {
        conn.advance(ConnectionState::Establishing);
        endpoint.established(self.config.establish_timeout).await
      }
      Err(error) => Err(Outcome::Failed(error)),
    };
    if let Err(outcome) = established {
      let _ = local.write_all(failure_reply(kind)).await;
      let _ = local.shutdown().await;
      self.teardown(&conn, &master_link, &outcome).await;
      return Ok(outcome);
    }

    if let Err(error) = local.write_all(success_reply(kind)).await {
      let outcome = Outcome::Failed(EndpointError::Fan(error.into()));
      self.teardown(&conn, &master_link, &outcome).await;
      return Ok(outcome);
    }
    let (local_read, local_write) = tokio::io::split(local);
    if let Err(error) = self.fan_in.set_conn(master, Box::new(local_write)).await {
      let outcome = Outcome::Failed(error.into());
      self.teardown(&conn, &master_link, &outcome).await;
      return Ok(outcome);
    }
    conn.advance(ConnectionState::Open);
    tracing::debug!(%master, addr = %conn.addr, ?kind, "connection open");

    let uploading = {
      let session = Arc::clone(self);
      let endpoint = Arc::clone(&endpoint);
      tokio::spawn(async move {
        match session.upload(master, local_read).await {
          Ok(()) => tracing::trace!(%master, "upload finished"),
          Err(error) => endpoint.on_error(error.into()),
        }
      })
    };
    let outcome = tokio::select! {
      outcome = endpoint.completion.wait() => outcome,
      done = self.fan_in.wait(master) => match done {
        Ok(()) => Outcome::Closed { by_peer: false },
        Err(error) => Outcome::Failed(error.into()),
      },
    };
    uploading.abort();
    self.teardown(&conn, &master_link, &outcome).await;
    Ok(outcome)
  }

  /// Copies the local socket into the fan-out group, ending with EOF
  async fn upload<R>(&self, master: ConnectionId, mut local: R) -> Result<(), FanError>
  where
    R: AsyncRead + Unpin,
  {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER);
    loop {
      buffer.reserve(READ_BUFFER);
      if local.read_buf(&mut buffer).await? == 0 {
        break;
      }
      self.fan_out.write(master, buffer.split().freeze()).await?;
    }
    self.fan_out.write_eof(master).await
  }

  async fn teardown(&self, conn: &LogicalConnection, master_link: &Arc<dyn Link>, outcome: &Outcome) {
    let master = conn.id;
    if !conn.close() {
      return;
    }
    self.registry.remove(&master);
    self.fan_out.close(master).await;
    self.fan_in.remove_all(master).await;
    if outcome.tell_peer() {
      if let Err(error) = master_link.send(Envelope::close(master)).await {
        tracing::debug!(%master, ?error, "could not send close");
      }
    }
    match outcome {
      Outcome::Closed { by_peer } => tracing::debug!(%master, by_peer, "connection closed"),
      Outcome::Rejected(error) => tracing::info!(%master, %error, "relay refused connection"),
      Outcome::Failed(error) => tracing::warn!(%master, ?error, "connection failed"),
    }
  }

  async fn handle_local(self: Arc<Self>, mut stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let request = match handshake::accept(&mut stream, self.config.enable_http).await {
      Ok(request) => request,
      Err(error) => {
        tracing::debug!(?error, "local handshake failed");
        return;
      }
    };
    let span = tracing::debug_span!("proxy", addr = %request.addr, kind = ?request.kind);
    if let Err(error) = self.open(request, stream).instrument(span).await {
      tracing::debug!(?error, "could not open connection");
    }
  }

  /// Accepts local proxy clients on `listener` until `shutdown` fires or the session fails
  pub async fn serve_local(
    self: Arc<Self>,
    listener: TcpListener,
    shutdown: CancellationListener,
  ) -> anyhow::Result<()> {
    let local = listener.local_addr().context("Listener has no local address")?;
    tracing::info!(%local, "local proxy listening");
    let result = loop {
      let (stream, peer) = tokio::select! {
        _ = shutdown.cancelled() => break Ok(()),
        _ = self.cancel.cancelled() => break Err(anyhow::anyhow!("WebSocket session ended")),
        accepted = listener.accept() => accepted.context("Accept failed")?,
      };
      tokio::spawn(
        Arc::clone(&self)
          .handle_local(stream)
          .instrument(tracing::info_span!("local", %peer)),
      );
    };
    self.shutdown().await;
    result
  }
}

/// Connects to `remote`, then serves local proxy requests on `addr` until `shutdown` fires
pub async fn run(
  addr: SocketAddr,
  remote: &str,
  config: ClientConfig,
  shutdown: CancellationListener,
) -> anyhow::Result<()> {
  let session = ClientSession::connect(remote, config)
    .await
    .with_context(|| format!("Failed to connect to relay at {}", remote))?;
  let listener = TcpListener::bind(addr)
    .await
    .with_context(|| format!("Failed to bind {}", addr))?;
  session.serve_local(listener, shutdown).await
}
