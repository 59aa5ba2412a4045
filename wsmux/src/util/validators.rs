// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;

use crate::client::MAX_LEGS;

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items.next().ok_or_else(|| AnyErr::msg(
        "No addresses were resolved from the given host",
      ))
    })
}

/// Accepts `ws://host[:port][/path]` and `wss://` URLs with a non-empty host
pub fn parse_ws_url(v: &str) -> Result<String> {
  let rest = v
    .strip_prefix("ws://")
    .or_else(|| v.strip_prefix("wss://"))
    .ok_or_else(|| AnyErr::msg("URL must start with ws:// or wss://"))?;
  let authority = rest.split('/').next().unwrap_or_default();
  if authority.is_empty() {
    return Err(AnyErr::msg("URL has no host"));
  }
  if let Some((_, port)) = authority.rsplit_once(':') {
    if !authority.ends_with(']') && port.parse::<u16>().is_err() {
      return Err(AnyErr::msg("URL port is not a valid u16"));
    }
  }
  Ok(v.to_string())
}

pub fn parse_leg_count(v: &str) -> Result<usize> {
  match v.parse::<usize>() {
    Ok(n) if (1..=MAX_LEGS).contains(&n) => Ok(n),
    Ok(_) => Err(AnyErr::msg(format!("Leg count must be between 1 and {}", MAX_LEGS))),
    Err(_) => Err(AnyErr::msg("Leg count must be a number")),
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_ws_url(v: &str) -> Result<(), String> {
  parse_ws_url(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_leg_count(v: &str) -> Result<(), String> {
  parse_leg_count(v).map(|_| ()).map_err(|e| e.to_string())
}
