/* Relay Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

use super::{connection::handle_connection, relay::Relay};

/// ProxyServer owns the TCP listener and spawns one task per accepted connection.
///
/// Every task gets a clone of the [`Relay`]; clones share the site table, stage pipeline
/// and upstream connection pool, so per-connection setup is a pointer copy.
///
/// Bind and accept errors are fatal and propagate to the caller. Errors inside a
/// connection are logged by its task and never stop the accept loop.
pub struct ProxyServer {
    listener_cfg: ListenerConfig,
    relay: Relay,
}

impl ProxyServer {
    pub fn new(listener_cfg: ListenerConfig, relay: Relay) -> Self {
        Self { listener_cfg, relay }
    }

    /// Binds the configured address and serves until the process exits.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.listener_cfg
                .bind_address
                .parse()
                .with_context(|| format!("invalid bind address: {}", self.listener_cfg.bind_address))?,
            self.listener_cfg.bind_port,
        );
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {addr}"))?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener (tests bind port 0 and pass it in).
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, endpoint = self.relay.endpoint_path(), "relay listener online");

        loop {
            let (socket, peer) = listener.accept().await?;
            let relay = self.relay.clone();
            tracing::debug!(%peer, "accepted client");

            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, relay).await {
                    tracing::warn!(%peer, "client session ended with error: {err:?}");
                }
            });
        }
    }
}
