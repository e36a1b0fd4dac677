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

use std::{sync::Arc, time::Instant};

use anyhow::{anyhow, Result};
use http::Method;
use uuid::Uuid;

use crate::{
    config::{EndpointConfig, RelayConfig, SiteRuleTable},
    telemetry::TelemetrySink,
    utils::{RelayError, RelayResult},
};

use super::{
    classify::ContentKind,
    client::{FetchClient, FetchOutcome},
    endpoint::RelayEndpoint,
    flow::{Flow, OutboundRequest, RequestParts},
    resolver::{resolve_target, ProxyRequest},
    response::ProxyResponse,
    stages::StagePipeline,
};

/// Relay owns everything a request needs: the site table, the fetch client, the stage
/// pipeline and the telemetry sink. Cloning is cheap; every clone shares the same
/// connection pool.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    endpoint: EndpointConfig,
    max_body_bytes: usize,
    sites: SiteRuleTable,
    client: FetchClient,
    stages: StagePipeline,
    telemetry: TelemetrySink,
}

impl Relay {
    /// Validates the site table and builds the client and pipeline from `cfg`.
    pub fn new(cfg: &RelayConfig, telemetry: TelemetrySink) -> Result<Self> {
        let sites = SiteRuleTable::from_config(&cfg.sites)?;
        let client = FetchClient::new(&cfg.fetch)?;
        let stages = StagePipeline::build(cfg, sites.clone())?;
        tracing::debug!(stages = stages.len(), site_rules = sites.len(), "relay initialised");

        Ok(Self {
            inner: Arc::new(RelayInner {
                endpoint: cfg.relay.clone(),
                max_body_bytes: cfg.listener.max_body_bytes,
                sites,
                client,
                stages,
                telemetry,
            }),
        })
    }

    pub fn endpoint_path(&self) -> &str {
        &self.inner.endpoint.path
    }

    pub fn max_body_bytes(&self) -> usize {
        self.inner.max_body_bytes
    }

    /// Answers one inbound request. Never fails: every error becomes a JSON response.
    pub async fn handle(&self, request: RequestParts) -> ProxyResponse {
        if request.uri.path() != self.endpoint_path() {
            tracing::debug!(path = request.uri.path(), "request outside the relay endpoint");
            return ProxyResponse::not_found();
        }
        if request.method == Method::OPTIONS {
            return ProxyResponse::preflight();
        }

        let started = Instant::now();
        let mut flow = match self.open_flow(&request) {
            Ok(flow) => flow,
            Err(err) => return self.fail(Uuid::now_v7(), None, err),
        };

        match self.run_flow(&mut flow).await {
            Ok(response) => {
                self.inner
                    .telemetry
                    .flow_completed(&flow, &response, started.elapsed());
                if request.method == Method::HEAD {
                    return ProxyResponse { body: String::new(), is_binary: false, ..response };
                }
                response
            }
            Err(err) => {
                let target = flow.target.as_str().to_string();
                self.fail(flow.id, Some(&target), err)
            }
        }
    }

    /// Input validation and target resolution. Nothing here touches the network.
    fn open_flow(&self, request: &RequestParts) -> RelayResult<Flow> {
        if request.body.len() > self.inner.max_body_bytes {
            return Err(RelayError::PayloadTooLarge {
                limit: self.inner.max_body_bytes,
            });
        }

        let proxy_request = ProxyRequest::from_inbound(request)?;
        let target = resolve_target(&proxy_request, &self.inner.sites)?;
        let relay = RelayEndpoint::from_request(&self.inner.endpoint, &request.headers);
        let outbound = OutboundRequest::new(proxy_request.method, proxy_request.outbound_body());

        Ok(Flow::new(target, outbound, relay))
    }

    /// Drives a resolved flow through the stages and the upstream fetch and returns the
    /// assembled response.
    pub async fn run_flow(&self, flow: &mut Flow) -> RelayResult<ProxyResponse> {
        let stages = &self.inner.stages;
        stages.process_request(flow).await?;

        tracing::debug!(
            flow_id = %flow.id,
            method = flow.outbound.method.as_form_value(),
            target = %flow.target.as_str(),
            "fetching upstream"
        );
        let response = match self.inner.client.fetch(&flow.target, &flow.outbound).await? {
            FetchOutcome::Fetched(upstream) => {
                flow.metadata.redirected = upstream.final_url != *flow.target.url();
                flow.upstream = Some(upstream);
                stages.process_response_headers(flow).await?;
                stages.process_response_body(flow).await?;
                assemble(flow)?
            }
            FetchOutcome::Suppressed => ProxyResponse::no_content(),
            FetchOutcome::RedirectToOrigin(url) => ProxyResponse::redirect(&url),
        };
        flow.response = Some(response);

        stages.finalize_response(flow).await?;
        flow.response
            .take()
            .ok_or_else(|| RelayError::Other(anyhow!("flow {} finished without a response", flow.id)))
    }

    fn fail(&self, flow_id: Uuid, target: Option<&str>, err: RelayError) -> ProxyResponse {
        let response = ProxyResponse::from_error(&err);
        if err.is_client_error() {
            tracing::debug!(%flow_id, error = %err, "rejected relay request");
        } else {
            tracing::warn!(%flow_id, target = target.unwrap_or("-"), error = %err, "relay request failed");
        }
        self.inner
            .telemetry
            .flow_failed(flow_id, target, &err, response.status.as_u16());
        response
    }
}

/// Builds the caller-facing response from the upstream response and what the stages left
/// in the flow metadata.
fn assemble(flow: &mut Flow) -> RelayResult<ProxyResponse> {
    let upstream = flow
        .upstream
        .as_ref()
        .ok_or_else(|| RelayError::Other(anyhow!("no upstream response to assemble")))?;

    match flow.metadata.content_kind.unwrap_or(ContentKind::Binary) {
        ContentKind::Markup => {
            let html = flow
                .metadata
                .markup
                .take()
                .ok_or_else(|| RelayError::Rewrite("document body missing after rewrite".into()))?;
            Ok(ProxyResponse::markup(upstream.status, &upstream.headers, html))
        }
        ContentKind::Binary => Ok(ProxyResponse::binary(
            upstream.status,
            &upstream.headers,
            upstream.body.as_bytes(),
        )),
    }
}
