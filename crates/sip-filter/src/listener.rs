// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The proxy's TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::conn_manager::ConnectionManager;
use crate::ProxyServices;

/// Binds the proxy listener with address reuse enabled.
pub fn bind_listener(bind: &str) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind_addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow!("invalid bind address: {}", e))?;
    let socket = Socket::new(
        Domain::for_address(bind_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Accepts downstream connections, running one [`ConnectionManager`] per
/// connection until the listener fails.
pub async fn serve(services: Arc<ProxyServices>, listener: TcpListener) -> Result<()> {
    let bind = listener.local_addr()?;
    info!(%bind, "listening (sip/tcp)");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept error");
                continue;
            }
        };
        let services = services.clone();
        tokio::spawn(async move {
            if let Err(e) = ConnectionManager::run(services, stream, peer).await {
                warn!(peer = %peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// Binds and serves in one call.
pub async fn run_proxy(services: Arc<ProxyServices>, bind: &str) -> Result<()> {
    serve(services.clone(), bind_listener(bind)?).await
}
