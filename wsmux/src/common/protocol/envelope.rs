// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire messages exchanged over each WebSocket leg
//!
//! Every frame is a JSON object `{"id", "type", "data"}`; the shape of `data` depends on
//! `type`. Binary payloads travel as base64 strings.
use std::convert::TryFrom;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::id::ConnectionId;

pub const TYPE_HI: &str = "hi";
pub const TYPE_ESTABLISH: &str = "est";
pub const TYPE_DATA: &str = "data";
pub const TYPE_CLOSE: &str = "finish";
pub const TYPE_HEARTBEAT: &str = "heart_beat";

#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
  #[error("Malformed envelope JSON")]
  Json(#[from] serde_json::Error),
  #[error("Envelope id {0:?} is not a valid connection id")]
  InvalidId(String),
  #[error("Unknown envelope type {0:?}")]
  UnknownType(String),
  #[error("Unknown {field} value {value}")]
  UnknownDiscriminant { field: &'static str, value: u8 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProxyKind {
  Socks5 = 0,
  Http = 1,
  Https = 2,
}

impl ProxyKind {
  pub fn is_http(&self) -> bool {
    matches!(self, ProxyKind::Http | ProxyKind::Https)
  }
}

impl TryFrom<u8> for ProxyKind {
  type Error = EnvelopeError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(ProxyKind::Socks5),
      1 => Ok(ProxyKind::Http),
      2 => Ok(ProxyKind::Https),
      value => Err(EnvelopeError::UnknownDiscriminant {
        field: "proxy_type",
        value,
      }),
    }
  }
}

impl From<ProxyKind> for u8 {
  fn from(kind: ProxyKind) -> Self {
    kind as u8
  }
}

/// Sub-tag of a `data` envelope
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataTag {
  Data = 0,
  EstablishOk = 1,
  EstablishError = 2,
  NoMore = 3,
  Handshake = 4,
  Eof = 5,
}

impl DataTag {
  /// Stream tags address a leg and feed reassembly; the rest address the master
  pub fn is_stream(&self) -> bool {
    matches!(self, DataTag::Data | DataTag::Eof | DataTag::NoMore)
  }
}

impl TryFrom<u8> for DataTag {
  type Error = EnvelopeError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(DataTag::Data),
      1 => Ok(DataTag::EstablishOk),
      2 => Ok(DataTag::EstablishError),
      3 => Ok(DataTag::NoMore),
      4 => Ok(DataTag::Handshake),
      5 => Ok(DataTag::Eof),
      value => Err(EnvelopeError::UnknownDiscriminant { field: "tag", value }),
    }
  }
}

impl From<DataTag> for u8 {
  fn from(tag: DataTag) -> Self {
    tag as u8
  }
}

mod base64_bytes {
  use base64::{engine::general_purpose::STANDARD, Engine as _};
  use bytes::Bytes;
  use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = <Option<String>>::deserialize(deserializer)?.unwrap_or_default();
    STANDARD
      .decode(encoded.as_bytes())
      .map(Bytes::from)
      .map_err(D::Error::custom)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishPayload {
  pub proxy_type: ProxyKind,
  pub addr: String,
  #[serde(default)]
  pub with_data: bool,
  #[serde(rename = "base64", with = "base64_bytes", default)]
  pub preamble: Bytes,
  #[serde(default)]
  pub sorted: Vec<ConnectionId>,
}

impl EstablishPayload {
  pub fn new(
    proxy_type: ProxyKind,
    addr: impl Into<String>,
    preamble: Option<Bytes>,
    sorted: Vec<ConnectionId>,
  ) -> Self {
    let preamble = preamble.unwrap_or_default();
    Self {
      proxy_type,
      addr: addr.into(),
      with_data: !preamble.is_empty(),
      preamble,
      sorted,
    }
  }

  pub fn preamble(&self) -> Option<&Bytes> {
    if self.with_data && !self.preamble.is_empty() {
      Some(&self.preamble)
    } else {
      None
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
  pub tag: DataTag,
  pub proxy_type: ProxyKind,
  #[serde(rename = "base64", with = "base64_bytes", default)]
  pub data: Bytes,
}

impl DataPayload {
  pub fn new(tag: DataTag, proxy_type: ProxyKind, data: Bytes) -> Self {
    Self {
      tag,
      proxy_type,
      data,
    }
  }

  pub fn signal(tag: DataTag, proxy_type: ProxyKind) -> Self {
    Self::new(tag, proxy_type, Bytes::new())
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
  /// A non-master leg announcing the master it belongs to
  Hi(ConnectionId),
  Establish(EstablishPayload),
  Data(DataPayload),
  Close,
  Heartbeat,
}

impl Message {
  pub fn type_name(&self) -> &'static str {
    match self {
      Message::Hi(_) => TYPE_HI,
      Message::Establish(_) => TYPE_ESTABLISH,
      Message::Data(_) => TYPE_DATA,
      Message::Close => TYPE_CLOSE,
      Message::Heartbeat => TYPE_HEARTBEAT,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
  pub id: ConnectionId,
  pub message: Message,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
  id: String,
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  data: serde_json::Value,
}

impl Envelope {
  pub fn new(id: ConnectionId, message: Message) -> Self {
    Self { id, message }
  }

  pub fn hi(leg: ConnectionId, master: ConnectionId) -> Self {
    Self::new(leg, Message::Hi(master))
  }

  pub fn data(id: ConnectionId, payload: DataPayload) -> Self {
    Self::new(id, Message::Data(payload))
  }

  pub fn close(id: ConnectionId) -> Self {
    Self::new(id, Message::Close)
  }

  pub fn heartbeat() -> Self {
    Self::new(ConnectionId::nil(), Message::Heartbeat)
  }

  pub fn encode(&self) -> Result<String, EnvelopeError> {
    let data = match &self.message {
      Message::Hi(master) => serde_json::Value::String(master.to_string()),
      Message::Establish(payload) => serde_json::to_value(payload)?,
      Message::Data(payload) => serde_json::to_value(payload)?,
      Message::Close | Message::Heartbeat => serde_json::Value::Null,
    };
    let wire = WireEnvelope {
      id: self.id.to_string(),
      kind: self.message.type_name().to_string(),
      data,
    };
    Ok(serde_json::to_string(&wire)?)
  }

  pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
    let wire: WireEnvelope = serde_json::from_slice(raw)?;
    let id = wire
      .id
      .parse::<ConnectionId>()
      .map_err(|_| EnvelopeError::InvalidId(wire.id.clone()))?;
    let message = match wire.kind.as_str() {
      TYPE_HI => {
        let master: String = serde_json::from_value(wire.data)?;
        let master = master
          .parse::<ConnectionId>()
          .map_err(|_| EnvelopeError::InvalidId(master))?;
        Message::Hi(master)
      }
      TYPE_ESTABLISH => Message::Establish(serde_json::from_value(wire.data)?),
      TYPE_DATA => Message::Data(serde_json::from_value(wire.data)?),
      TYPE_CLOSE => Message::Close,
      TYPE_HEARTBEAT => Message::Heartbeat,
      _ => return Err(EnvelopeError::UnknownType(wire.kind)),
    };
    Ok(Self { id, message })
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;

  use super::{DataPayload, DataTag, Envelope, EnvelopeError, EstablishPayload, Message, ProxyKind};
  use crate::common::protocol::id::ConnectionId;

  #[test]
  fn parses_data_frame_from_wire() {
    let raw = br#"{"id":"0188e0a4-7f3a-7000-8000-000000000001","type":"data","data":{"tag":5,"proxy_type":0,"base64":""}}"#;
    let env = Envelope::decode(raw).unwrap();
    assert_eq!(
      env.message,
      Message::Data(DataPayload::signal(DataTag::Eof, ProxyKind::Socks5))
    );
    assert_eq!(
      env.id.to_string(),
      "0188e0a4-7f3a-7000-8000-000000000001"
    );
  }

  #[test]
  fn establish_payload_field_names() {
    let master = ConnectionId::generate();
    let leg = ConnectionId::generate();
    let payload = EstablishPayload::new(
      ProxyKind::Http,
      "example.com:80",
      Some(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")),
      vec![master, leg],
    );
    let text = Envelope::new(master, Message::Establish(payload.clone()))
      .encode()
      .unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "est");
    assert_eq!(value["data"]["proxy_type"], 1);
    assert_eq!(value["data"]["with_data"], true);
    assert_eq!(value["data"]["base64"], "R0VUIC8gSFRUUC8xLjENCg0K");
    assert_eq!(value["data"]["sorted"][1], leg.to_string());
    let back = Envelope::decode(text.as_bytes()).unwrap();
    assert_eq!(back.message, Message::Establish(payload));
  }

  #[test]
  fn hi_carries_master_as_string() {
    let leg = ConnectionId::generate();
    let master = ConnectionId::generate();
    let text = Envelope::hi(leg, master).encode().unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["data"], master.to_string());
    assert_eq!(Envelope::decode(text.as_bytes()).unwrap().message, Message::Hi(master));
  }

  #[test]
  fn heartbeat_uses_nil_id_and_close_has_no_body() {
    let text = Envelope::heartbeat().encode().unwrap();
    let env = Envelope::decode(text.as_bytes()).unwrap();
    assert!(env.id.is_nil());
    assert_eq!(env.message, Message::Heartbeat);
    let close = Envelope::decode(br#"{"id":"00000000-0000-0000-0000-000000000009","type":"finish"}"#)
      .unwrap();
    assert_eq!(close.message, Message::Close);
  }

  #[test]
  fn rejects_unknown_type_and_bad_tag() {
    let unknown = Envelope::decode(br#"{"id":"00000000-0000-0000-0000-000000000001","type":"nope","data":null}"#);
    assert!(matches!(unknown, Err(EnvelopeError::UnknownType(t)) if t == "nope"));
    let bad_tag = Envelope::decode(br#"{"id":"00000000-0000-0000-0000-000000000001","type":"data","data":{"tag":9,"proxy_type":0,"base64":""}}"#);
    assert!(matches!(bad_tag, Err(EnvelopeError::Json(_))));
    let bad_id = Envelope::decode(br#"{"id":"leg-1","type":"finish"}"#);
    assert!(matches!(bad_id, Err(EnvelopeError::InvalidId(_))));
  }
}
