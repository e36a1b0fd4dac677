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

use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::{TelemetryConfig, TelemetryMode},
    proxy::{flow::Flow, response::ProxyResponse},
    utils::RelayError,
};

/// One structured event per relay request, as a tracing event or a raw JSON line.
#[derive(Clone)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: TelemetryConfig) -> Self {
        Self { mode: cfg.mode }
    }

    pub fn emit(&self, event: &str, flow_id: Uuid, payload: Value) {
        match self.mode {
            TelemetryMode::Stdout => {
                tracing::info!(%flow_id, event, payload = %payload);
            }
            TelemetryMode::Json => {
                let data = json!({
                    "event": event,
                    "flow_id": flow_id,
                    "payload": payload,
                });
                println!("{}", data);
            }
        }
    }

    pub fn flow_completed(&self, flow: &Flow, response: &ProxyResponse, elapsed: Duration) {
        self.emit("relay.completed", flow.id, completed_payload(flow, response, elapsed));
    }

    pub fn flow_failed(&self, flow_id: Uuid, target: Option<&str>, err: &RelayError, status: u16) {
        self.emit(
            "relay.failed",
            flow_id,
            json!({
                "target": target,
                "status": status,
                "error": err.to_string(),
                "client_error": err.is_client_error(),
            }),
        );
    }
}

fn completed_payload(flow: &Flow, response: &ProxyResponse, elapsed: Duration) -> Value {
    json!({
        "target": flow.target.as_str(),
        "final_url": flow.upstream.as_ref().map(|upstream| upstream.final_url.as_str()),
        "redirected": flow.metadata.redirected,
        "status": response.status.as_u16(),
        "kind": flow.metadata.content_kind,
        "binary": response.is_binary,
        "profile": flow.metadata.profile,
        "rewrite": flow.metadata.rewrite,
        "site_rules": flow.metadata.site_rules_applied,
        "stripped_csp": flow.metadata.stripped_csp,
        "elapsed_ms": elapsed.as_millis() as u64,
    })
}
