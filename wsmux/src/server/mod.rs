// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Relay side: accepting WebSocket connections and routing their frames
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as AnyhowContext;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::{TcpListener, TcpStream},
  time::Instant,
};
use tokio_tungstenite::{
  tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
  },
  WebSocketStream,
};
use tracing_futures::Instrument;

use crate::{
  common::{
    connection::{ConnectionState, LogicalConnection},
    fan::{FanConfig, FanError, FanIn, FanOut},
    hub::{Hub, HubCollection, ProxyEndpoint, StatusSnapshot},
    protocol::{
      envelope::{DataPayload, DataTag, Envelope, EstablishPayload, Message, ProxyKind},
      id::ConnectionId,
      negotiation::NegotiationService,
      transport::{Inbound, LegSink, Link, SharedKind, WsLink, DEFAULT_WRITE_TIMEOUT, KEY_HEADER},
    },
    SessionError,
  },
  util::cancellation::CancellationListener,
};

pub mod establish;

use establish::{HttpEndpoint, SocketEndpoint};

#[derive(Clone, Debug)]
pub struct ServerConfig {
  /// Accept HTTP and HTTPS proxy requests in addition to SOCKS5
  pub enable_http: bool,
  /// Required value of the upgrade request's `Key` header, if any
  pub connection_key: Option<String>,
  pub status_page: bool,
  pub dial_timeout: Duration,
  pub write_timeout: Duration,
  pub sweep_interval: Duration,
  /// How long a finished connection's id keeps refusing late legs
  pub retired_ttl: Duration,
  pub fan: FanConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      enable_http: false,
      connection_key: None,
      status_page: false,
      dial_timeout: Duration::from_secs(8),
      write_timeout: DEFAULT_WRITE_TIMEOUT,
      sweep_interval: Duration::from_secs(60),
      retired_ttl: Duration::from_secs(10 * 60),
      fan: FanConfig::default(),
    }
  }
}

/// One relay instance
///
/// The striping tables are shared by every WebSocket connection of the relay, since the legs
/// of one logical connection arrive on different WebSocket connections.
pub struct Relay {
  config: ServerConfig,
  hubs: HubCollection,
  fan_out: FanOut,
  fan_in: FanIn,
  /// Recently finished connections and when they finished
  retired: DashMap<ConnectionId, Instant>,
  kinds: DashMap<ConnectionId, SharedKind>,
  negotiation: NegotiationService,
}

impl Relay {
  pub fn new(config: ServerConfig) -> Arc<Self> {
    Arc::new(Self {
      hubs: HubCollection::new(),
      fan_out: FanOut::new(config.fan.clone()),
      fan_in: FanIn::new(config.fan.clone()),
      retired: DashMap::new(),
      kinds: DashMap::new(),
      negotiation: NegotiationService::new(config.status_page),
      config,
    })
  }

  pub fn config(&self) -> &ServerConfig {
    &self.config
  }

  pub fn status(&self) -> StatusSnapshot {
    self.hubs.snapshot()
  }

  pub(crate) fn fan_out(&self) -> &FanOut {
    &self.fan_out
  }

  pub(crate) fn fan_in(&self) -> &FanIn {
    &self.fan_in
  }

  fn kind_of(&self, master: ConnectionId) -> SharedKind {
    Arc::clone(self.kinds.entry(master).or_default().value())
  }

  /// Releases a connection's striping groups and refuses its legs from then on
  pub(crate) async fn retire(&self, master: ConnectionId) {
    // Recorded first so a concurrent enrollment either sees it or is swept up below
    self.retired.insert(master, Instant::now());
    self.kinds.remove(&master);
    self.fan_out.close(master).await;
    self.fan_in.remove_all(master).await;
  }

  /// Accepts WebSocket clients on `listener` until `shutdown` fires
  pub async fn serve(
    self: Arc<Self>,
    listener: TcpListener,
    shutdown: CancellationListener,
  ) -> anyhow::Result<()> {
    let local = listener.local_addr().context("Listener has no local address")?;
    tracing::info!(%local, "relay listening");
    let sweeper = tokio::spawn(Arc::clone(&self).sweep(shutdown.clone()));
    loop {
      let (stream, peer) = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = listener.accept() => accepted.context("Accept failed")?,
      };
      let relay = Arc::clone(&self);
      let shutdown = shutdown.clone();
      tokio::spawn(
        async move {
          if let Err(error) = relay.accept(stream, peer, shutdown).await {
            tracing::warn!(?error, "session ended with error");
          }
        }
        .instrument(tracing::info_span!("session", %peer)),
      );
    }
    sweeper.abort();
    tracing::info!("relay stopped");
    Ok(())
  }

  async fn accept(
    self: Arc<Self>,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationListener,
  ) -> Result<(), SessionError> {
    let _ = stream.set_nodelay(true);
    let key = self.config.connection_key.clone();
    let check_key = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
      match key {
        None => Ok(response),
        Some(key) => {
          let presented = request
            .headers()
            .get(KEY_HEADER)
            .and_then(|v| v.to_str().ok());
          if presented == Some(key.as_str()) {
            Ok(response)
          } else {
            let mut denied = ErrorResponse::new(Some("Access denied!".to_string()));
            *denied.status_mut() = StatusCode::UNAUTHORIZED;
            Err(denied)
          }
        }
      }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, check_key).await?;
    tracing::debug!(%peer, "WebSocket upgraded");
    self.serve_websocket(ws, shutdown).await
  }

  /// Negotiates versions on an upgraded connection, then routes its frames until it ends
  pub async fn serve_websocket<S>(
    self: Arc<Self>,
    mut ws: WebSocketStream<S>,
    shutdown: CancellationListener,
  ) -> Result<(), SessionError>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let client = self.negotiation.handle(&mut ws).await?;
    tracing::info!(version = %client.version, code = client.version_code, "client connected");
    let (sink, mut stream) = ws.split();
    let link: Arc<dyn Link> = Arc::new(WsLink::new(sink, self.config.write_timeout));
    let hub = self.hubs.new_hub(Arc::clone(&link));

    let result = loop {
      let next = tokio::select! {
        _ = shutdown.cancelled() => break Ok(()),
        next = stream.next() => next,
      };
      let message = match next {
        None => break Ok(()),
        Some(Err(e)) => break Err(SessionError::WebSocket(e)),
        Some(Ok(message)) => message,
      };
      match Inbound::from(message) {
        Inbound::Frame(Ok(envelope)) => self.dispatch(&hub, envelope).await,
        Inbound::Frame(Err(error)) => tracing::debug!(?error, "dropping malformed frame"),
        Inbound::Control => {}
        Inbound::Closed => break Ok(()),
      }
    };

    self.drop_hub(&hub).await;
    link.close().await;
    match &result {
      Ok(()) => tracing::info!(hub = hub.id(), "client disconnected"),
      Err(error) => tracing::error!(hub = hub.id(), ?error, "client transport failed"),
    }
    result
  }

  /// Fails every logical connection that had a leg on `hub`
  async fn drop_hub(&self, hub: &Hub) {
    self.hubs.remove(hub);
    let endpoints = hub.registry().close_all();
    let masters = hub.masters();
    for master in masters.iter() {
      self.retire(*master).await;
    }
    tracing::debug!(
      hub = hub.id(),
      endpoints,
      masters = masters.len(),
      "hub torn down"
    );
  }

  async fn dispatch(self: &Arc<Self>, hub: &Arc<Hub>, envelope: Envelope) {
    let Envelope { id, message } = envelope;
    match message {
      Message::Heartbeat => tracing::trace!(hub = hub.id(), "heartbeat"),
      Message::Hi(master) => self.on_hi(hub, id, master).await,
      Message::Establish(payload) => self.on_establish(hub, id, payload).await,
      Message::Data(payload) if payload.tag.is_stream() => {
        self.on_stream_data(id, payload).await
      }
      Message::Data(payload) => match hub.registry().get(&id) {
        Some(endpoint) => endpoint.on_data(payload),
        None => tracing::debug!(%id, tag = ?payload.tag, "control data for unknown connection"),
      },
      Message::Close => match hub.registry().get(&id) {
        Some(endpoint) => endpoint.on_closed(false),
        None => tracing::trace!(%id, "close for unknown connection"),
      },
    }
  }

  async fn on_hi(&self, hub: &Arc<Hub>, leg: ConnectionId, master: ConnectionId) {
    if self.retired.contains_key(&master) {
      tracing::debug!(%leg, %master, "leg announced for a finished connection");
      return;
    }
    // Hi carries no proxy kind; the master's establish fills it in
    let writer = Arc::new(LegSink::deferred(Arc::clone(hub.link()), leg, self.kind_of(master)));
    let fresh = self.fan_in.master_of(leg).await.is_none();
    let registered = async {
      self.fan_in.register(leg, master).await?;
      if let Err(error) = self.fan_out.register(master, leg, writer).await {
        if fresh {
          self.fan_in.deregister(leg).await;
        }
        return Err(error);
      }
      Ok::<_, FanError>(())
    };
    if let Err(error) = registered.await {
      tracing::debug!(%leg, %master, ?error, "rejecting leg");
      return;
    }
    if self.retired.contains_key(&master) {
      tracing::debug!(%leg, %master, "connection finished while enrolling leg");
      self.fan_out.close(master).await;
      self.fan_in.remove_all(master).await;
      return;
    }
    hub.track_leg(leg, master);
    tracing::trace!(%leg, %master, "leg enrolled");
  }

  async fn on_establish(self: &Arc<Self>, hub: &Arc<Hub>, master: ConnectionId, payload: EstablishPayload) {
    let kind = payload.proxy_type;
    let mut sorted = payload.sorted.clone();
    if sorted.is_empty() {
      sorted.push(master);
    }
    if !sorted.contains(&master) {
      tracing::debug!(%master, "establish order omits the master leg");
      return reject(hub, master, kind, "master leg missing from order").await;
    }
    if kind.is_http() && !self.config.enable_http {
      tracing::debug!(%master, ?kind, "http proxying is disabled");
      return reject(hub, master, kind, "http proxy is not enabled on this server").await;
    }
    if hub.registry().contains(&master) {
      tracing::debug!(%master, "duplicate establish");
      return;
    }
    if self.retired.contains_key(&master) {
      tracing::debug!(%master, "establish for a finished connection");
      return reject(hub, master, kind, "connection already closed").await;
    }
    let _ = self.kind_of(master).set(kind);

    let conn = Arc::new(LogicalConnection::new(master, payload.addr.clone(), kind, sorted.clone()));
    conn.advance(ConnectionState::AwaitingLegs);
    let writer = Arc::new(LegSink::new(Arc::clone(hub.link()), master, kind));
    let enrolled: Result<(), FanError> = async {
      self.fan_in.register(master, master).await?;
      self.fan_out.register(master, master, writer).await?;
      self.fan_in.set_order(master, sorted.clone()).await?;
      self.fan_out.set_order(master, sorted).await
    }
    .await;
    hub.track_leg(master, master);
    if let Err(error) = enrolled {
      tracing::debug!(%master, ?error, "could not enroll connection");
      self.retire(master).await;
      hub.untrack_master(&master);
      return reject(hub, master, kind, "leg order rejected").await;
    }

    let relay = Arc::clone(self);
    let hub = Arc::clone(hub);
    let span = tracing::debug_span!("connection", %master, addr = %payload.addr, ?kind);
    if kind == ProxyKind::Http {
      let endpoint = Arc::new(HttpEndpoint::new(master));
      hub
        .registry()
        .add(master, Arc::clone(&endpoint) as Arc<dyn ProxyEndpoint>);
      tokio::spawn(establish::run_http(relay, hub, conn, payload, endpoint).instrument(span));
    } else {
      let endpoint = Arc::new(SocketEndpoint::new(master));
      hub
        .registry()
        .add(master, Arc::clone(&endpoint) as Arc<dyn ProxyEndpoint>);
      tokio::spawn(establish::run_socket(relay, hub, conn, payload, endpoint).instrument(span));
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
        tracing::warn!(%leg, ?error, "leg write failed; closing its connection");
        if let Some(master) = self.fan_in.master_of(leg).await {
          self.retire(master).await;
        }
      }
    }
  }

  /// Periodically evicts stale striping groups and forgets finished connections
  async fn sweep(self: Arc<Self>, shutdown: CancellationListener) {
    let mut ticker = tokio::time::interval(self.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = ticker.tick() => {}
      }
      let out = self.fan_out.evict_idle().await;
      let inward = self.fan_in.evict_idle().await;
      let live: HashSet<ConnectionId> = self.fan_in.masters().await;
      self.hubs.retain_legs(|master| live.contains(master));
      self.kinds.retain(|master, _| live.contains(master));
      let now = Instant::now();
      let ttl = self.config.retired_ttl;
      self
        .retired
        .retain(|_, at| now.saturating_duration_since(*at) < ttl);
      if out + inward > 0 {
        tracing::debug!(out, inward, "evicted idle groups");
      }
    }
  }
}

async fn reject(hub: &Hub, master: ConnectionId, kind: ProxyKind, reason: &str) {
  let payload = DataPayload::new(
    DataTag::EstablishError,
    kind,
    Bytes::copy_from_slice(reason.as_bytes()),
  );
  if let Err(error) = hub.link().send(Envelope::data(master, payload)).await {
    tracing::debug!(%master, ?error, "could not report establish failure");
  }
}

/// Binds `addr` and serves a relay with `config` until `shutdown` fires
pub async fn run(
  addr: SocketAddr,
  config: ServerConfig,
  shutdown: CancellationListener,
) -> anyhow::Result<()> {
  let listener = TcpListener::bind(addr)
    .await
    .with_context(|| format!("Failed to bind {}", addr))?;
  Relay::new(config).serve(listener, shutdown).await
}
