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

use anyhow::Result;

use crate::{
    config::RelayConfig,
    proxy::{ProxyServer, Relay},
    telemetry::TelemetrySink,
};

/// RelayApp wires configuration, telemetry, the relay and the listener together so
/// `main.rs` only parses arguments and calls [`RelayApp::run`].
///
/// Initialization order:
/// 1. Telemetry, so later steps can report.
/// 2. Relay: validates the site table, loads the header profile, builds the HTTP client and
///    the stage pipeline. Any config mistake fails here, before the port is bound.
/// 3. ProxyServer, holding the listener config and the relay.
pub struct RelayApp {
    server: ProxyServer,
}

impl RelayApp {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let telemetry = TelemetrySink::new(config.telemetry.clone());
        let relay = Relay::new(&config, telemetry)?;
        let server = ProxyServer::new(config.listener.clone(), relay);
        Ok(Self { server })
    }

    /// Runs the accept loop; only returns on bind/accept failure.
    pub async fn run(self) -> Result<()> {
        self.server.run().await
    }
}
