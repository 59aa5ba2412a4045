// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use wsmux::{
  client::{self, ClientConfig},
  common::fan::FanConfig,
};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub remote: String,
  pub bind_addr: SocketAddr,
  pub enable_http: bool,
  pub connection_key: Option<String>,
  pub legs: usize,
  pub low_latency: bool,
}

impl ClientArgs {
  fn config(&self) -> ClientConfig {
    ClientConfig {
      legs: self.legs,
      connection_key: self.connection_key.clone(),
      enable_http: self.enable_http,
      fan: if self.low_latency {
        FanConfig::low_latency()
      } else {
        FanConfig::default()
      },
      ..Default::default()
    }
  }
}

pub async fn client_main(args: ClientArgs) -> Result<()> {
  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let result = client::run(args.bind_addr, &args.remote, args.config(), shutdown.into()).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  result
}
