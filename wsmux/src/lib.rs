// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! WebSocket tunnel for SOCKS5 and HTTP(S) proxy traffic
//!
//! Many logical TCP connections share a set of WebSocket connections, and each logical
//! connection may be striped over several of them and reassembled in order at the far end.

pub mod common;
pub mod util;

pub mod client;
pub mod server;
