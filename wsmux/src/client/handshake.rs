// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Local proxy handshakes: SOCKS5 `CONNECT`, HTTP `CONNECT`, and absolute-form HTTP requests
//!
//! Each yields the target address, the proxy kind, and any bytes that must reach the target
//! before the stream is relayed.
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::protocol::envelope::ProxyKind;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const MAX_HTTP_HEAD: usize = 64 * 1024;

pub const SOCKS5_SUCCESS: &[u8] = &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
pub const SOCKS5_FAILURE: &[u8] = &[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
pub const HTTPS_ESTABLISHED: &[u8] =
  b"HTTP/1.0 200 Connection Established\r\nProxy-agent: wsmux\r\n\r\n";
pub const HTTP_BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const HTTP_NOT_A_PROXY_REQUEST: &[u8] = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 63\r\nConnection: close\r\n\r\nThis is a proxy server. Does not respond to non-proxy requests.";

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("Local socket I/O failed")]
  Io(#[from] std::io::Error),
  #[error("Unsupported proxy protocol (first byte {0:#04x})")]
  Unsupported(u8),
  #[error("Malformed proxy request: {0}")]
  Malformed(&'static str),
  #[error("SOCKS5 command {0:#04x} is not supported")]
  UnsupportedCommand(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
  pub addr: String,
  pub kind: ProxyKind,
  pub preamble: Option<Bytes>,
}

/// Bytes written to the local client once the relay reached the target
pub fn success_reply(kind: ProxyKind) -> &'static [u8] {
  match kind {
    ProxyKind::Socks5 => SOCKS5_SUCCESS,
    ProxyKind::Https => HTTPS_ESTABLISHED,
    ProxyKind::Http => b"",
  }
}

pub fn failure_reply(kind: ProxyKind) -> &'static [u8] {
  match kind {
    ProxyKind::Socks5 => SOCKS5_FAILURE,
    ProxyKind::Https | ProxyKind::Http => HTTP_BAD_GATEWAY,
  }
}

/// Reads a proxy request from a freshly accepted local connection
pub async fn accept<S>(stream: &mut S, enable_http: bool) -> Result<ProxyRequest, HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let first = stream.read_u8().await?;
  match first {
    SOCKS_VERSION => socks5(stream).await,
    b'A'..=b'Z' if enable_http => http(stream, first).await,
    other => Err(HandshakeError::Unsupported(other)),
  }
}

async fn socks5<S>(stream: &mut S) -> Result<ProxyRequest, HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let methods = stream.read_u8().await? as usize;
  let mut offered = vec![0u8; methods];
  stream.read_exact(&mut offered).await?;
  // Only "no authentication" is offered back
  stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

  let mut head = [0u8; 4];
  stream.read_exact(&mut head).await?;
  if head[0] != SOCKS_VERSION {
    return Err(HandshakeError::Malformed("bad socks version in request"));
  }
  if head[1] != SOCKS_CMD_CONNECT {
    stream
      .write_all(&[SOCKS_VERSION, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
      .await?;
    return Err(HandshakeError::UnsupportedCommand(head[1]));
  }
  let host = match head[3] {
    0x01 => {
      let mut octets = [0u8; 4];
      stream.read_exact(&mut octets).await?;
      Ipv4Addr::from(octets).to_string()
    }
    0x03 => {
      let len = stream.read_u8().await? as usize;
      let mut domain = vec![0u8; len];
      stream.read_exact(&mut domain).await?;
      String::from_utf8(domain).map_err(|_| HandshakeError::Malformed("domain is not utf-8"))?
    }
    0x04 => {
      let mut octets = [0u8; 16];
      stream.read_exact(&mut octets).await?;
      format!("[{}]", Ipv6Addr::from(octets))
    }
    _ => return Err(HandshakeError::Malformed("unknown socks address type")),
  };
  let port = stream.read_u16().await?;
  Ok(ProxyRequest {
    addr: format!("{}:{}", host, port),
    kind: ProxyKind::Socks5,
    preamble: None,
  })
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
  buffer
    .windows(4)
    .position(|w| w == b"\r\n\r\n")
    .map(|at| at + 4)
}

async fn http<S>(stream: &mut S, first: u8) -> Result<ProxyRequest, HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut buffer = BytesMut::with_capacity(4096);
  buffer.put_u8(first);
  let head_len = loop {
    if let Some(end) = find_head_end(&buffer) {
      break end;
    }
    if buffer.len() > MAX_HTTP_HEAD {
      return Err(HandshakeError::Malformed("request head too large"));
    }
    if stream.read_buf(&mut buffer).await? == 0 {
      return Err(HandshakeError::Malformed("request head truncated"));
    }
  };
  let head = buffer.split_to(head_len);
  let rest = buffer.freeze();
  let text = std::str::from_utf8(&head).map_err(|_| HandshakeError::Malformed("head is not utf-8"))?;
  let mut lines = text.split("\r\n");
  let request_line = lines.next().unwrap_or_default();
  let mut parts = request_line.split(' ');
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(HandshakeError::Malformed("bad request line")),
  };

  if method.eq_ignore_ascii_case("CONNECT") {
    let addr = if target.contains(':') {
      target.to_string()
    } else {
      format!("{}:443", target)
    };
    return Ok(ProxyRequest {
      addr,
      kind: ProxyKind::Https,
      preamble: Some(rest).filter(|r| !r.is_empty()),
    });
  }

  let (authority, path) = match split_absolute(target) {
    Some(parts) => parts,
    None => {
      stream.write_all(HTTP_NOT_A_PROXY_REQUEST).await?;
      return Err(HandshakeError::Malformed("request target is not absolute"));
    }
  };
  let addr = if authority.rsplit_once(':').map_or(false, |(_, port)| port.parse::<u16>().is_ok()) {
    authority.to_string()
  } else {
    format!("{}:80", authority)
  };

  let mut rewritten = BytesMut::with_capacity(head.len() + rest.len());
  rewritten.put_slice(format!("{} {} {}\r\n", method, path, version).as_bytes());
  for line in lines.filter(|l| !l.is_empty()) {
    let is_proxy_header = line
      .split_once(':')
      .map_or(false, |(name, _)| name.trim().to_ascii_lowercase().starts_with("proxy-"));
    if !is_proxy_header {
      rewritten.put_slice(line.as_bytes());
      rewritten.put_slice(b"\r\n");
    }
  }
  rewritten.put_slice(b"\r\n");
  rewritten.put_slice(&rest);
  Ok(ProxyRequest {
    addr,
    kind: ProxyKind::Http,
    preamble: Some(rewritten.freeze()),
  })
}

/// Splits `http://authority/path` into its authority and origin-form path
fn split_absolute(target: &str) -> Option<(&str, &str)> {
  let rest = target.strip_prefix("http://")?;
  match rest.find('/') {
    Some(at) => Some((&rest[..at], &rest[at..])),
    None => Some((rest, "/")),
  }
}
