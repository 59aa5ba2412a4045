// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire protocol spoken over each WebSocket leg

pub mod envelope;
pub mod id;
pub mod negotiation;
pub mod transport;

pub use envelope::{DataPayload, DataTag, Envelope, EstablishPayload, Message, ProxyKind};
pub use id::ConnectionId;
