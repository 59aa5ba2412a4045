// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use wsmux::util;

use util::validators::{
  parse_leg_count, parse_socketaddr, parse_ws_url, validate_leg_count, validate_socketaddr,
  validate_ws_url,
};

mod client;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    tracing_subscriber::EnvFilter::new("tokio_tungstenite=warn,tungstenite=warn,info")
  });
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = build_app().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn build_app() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Serve a local SOCKS5/HTTP proxy tunnelled through a remote relay")
        .arg(
          Arg::new("remote")
            .long("remote")
            .short('r')
            .help("Relay URL, such as ws://relay.example:1088/")
            .validator(validate_ws_url)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("addr")
            .long("addr")
            .short('a')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:1080")
            .takes_value(true),
        )
        .arg(
          Arg::new("http")
            .long("http")
            .help("Also accept HTTP and HTTPS proxy requests"),
        )
        .arg(Arg::new("key").long("key").short('k').takes_value(true))
        .arg(
          Arg::new("legs")
            .long("legs")
            .short('l')
            .help("WebSocket connections to stripe each proxied connection over")
            .validator(validate_leg_count)
            .default_value("1")
            .takes_value(true),
        )
        .arg(Arg::new("low-latency").long("low-latency")),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Run the relay, accepting WebSocket connections from multiple clients")
        .arg(
          Arg::new("addr")
            .long("addr")
            .short('a')
            .validator(validate_socketaddr)
            .default_value("0.0.0.0:1088")
            .takes_value(true),
        )
        .arg(
          Arg::new("http")
            .long("http")
            .help("Allow HTTP and HTTPS proxy connections"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .help("Require this value in the upgrade request's Key header")
            .takes_value(true),
        )
        .arg(
          Arg::new("status")
            .long("status")
            .help("Advertise the status page to clients"),
        )
        .arg(Arg::new("low-latency").long("low-latency")),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    remote: parse_ws_url(args.value_of("remote").unwrap_or_default())?,
    bind_addr: parse_socketaddr(args.value_of("addr").unwrap_or_default())?,
    enable_http: args.is_present("http"),
    connection_key: args.value_of("key").map(String::from),
    legs: parse_leg_count(args.value_of("legs").unwrap_or("1"))?,
    low_latency: args.is_present("low-latency"),
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    bind_addr: parse_socketaddr(args.value_of("addr").unwrap_or_default())?,
    enable_http: args.is_present("http"),
    connection_key: args.value_of("key").map(String::from),
    status_page: args.is_present("status"),
    low_latency: args.is_present("low-latency"),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
