// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use wsmux::{
  common::fan::FanConfig,
  server::{self, ServerConfig},
};

/// Parameters used to run a wsmux relay
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub bind_addr: SocketAddr,
  pub enable_http: bool,
  pub connection_key: Option<String>,
  pub status_page: bool,
  pub low_latency: bool,
}

impl ServerArgs {
  fn config(&self) -> ServerConfig {
    ServerConfig {
      enable_http: self.enable_http,
      connection_key: self.connection_key.clone(),
      status_page: self.status_page,
      fan: if self.low_latency {
        FanConfig::low_latency()
      } else {
        FanConfig::default()
      },
      ..Default::default()
    }
  }
}

pub async fn server_main(args: ServerArgs) -> Result<()> {
  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let result = server::run(args.bind_addr, args.config(), shutdown.into()).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  result
}
