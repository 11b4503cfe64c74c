// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use npserv_common::config::port_from_args;
use npserv_common::net::passive_tcp;
use npserv_socks::firewall::Firewall;
use npserv_socks::server;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    npserv_common::log::enable_logging().ok();

    let port = port_from_args(None)?;
    let listener = std::net::TcpListener::from(passive_tcp(port)?);
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    info!("socks server listening on port {port}");

    server::run(listener, Firewall::from_config()).await
}
