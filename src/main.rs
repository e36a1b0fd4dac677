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

use std::path::PathBuf;

use clap::Parser;
use relay_proxy::{app::RelayApp, config::RelayConfig, utils::init_tracing};

/// Command-line interface. Everything behavioral (listener, endpoint, allow-lists, site
/// rules, response policy) lives in the TOML file.
#[derive(Debug, Parser)]
#[command(
    name = "relay-proxy",
    about = "Framing relay: serves any page through one endpoint, embeddable in a frame"
)]
struct Cli {
    /// Path to the relay configuration file (TOML).
    ///
    /// ```sh
    /// relay-proxy --config config/relay.example.toml
    /// ```
    #[arg(short, long, default_value = "config/relay.example.toml")]
    config: PathBuf,

    /// Enable JSON-formatted logs (default: human-readable stdout).
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

/// Parse CLI, initialize logging, load config, run the listener.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Must happen before any tracing:: calls.
    init_tracing(cli.json_logs)?;

    let config = RelayConfig::load(&cli.config)?;
    let app = RelayApp::new(config)?;
    app.run().await
}
