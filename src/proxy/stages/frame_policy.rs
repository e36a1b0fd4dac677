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

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_SECURITY_POLICY,
    CONTENT_SECURITY_POLICY_REPORT_ONLY, REFERRER_POLICY, X_FRAME_OPTIONS,
};

use crate::{config::PolicyConfig, proxy::flow::Flow, utils::RelayResult};

use super::FlowStage;

const CROSS_ORIGIN_RESOURCE_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-resource-policy");
const CROSS_ORIGIN_EMBEDDER_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-embedder-policy");
const CROSS_ORIGIN_OPENER_POLICY: HeaderName = HeaderName::from_static("cross-origin-opener-policy");

/// Frame policy stage makes every relayed response embeddable: it remembers the upstream
/// CSP it discards and stamps the permissive framing, CORS and referrer headers on the final
/// response, whatever its kind.
#[derive(Clone)]
pub struct FramePolicyStage {
    overrides: Vec<(HeaderName, HeaderValue)>,
}

impl FramePolicyStage {
    /// Header values are validated here so a bad config fails at startup, not per request.
    pub fn new(cfg: &PolicyConfig) -> Result<Self> {
        let csp = HeaderValue::from_str(cfg.content_security_policy.trim())
            .context("policy.content_security_policy is not a valid header value")?;
        let frame_options = HeaderValue::from_str(cfg.frame_options.trim())
            .context("policy.frame_options is not a valid header value")?;

        Ok(Self {
            overrides: vec![
                (X_FRAME_OPTIONS, frame_options),
                (CONTENT_SECURITY_POLICY, csp),
                (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
                (CROSS_ORIGIN_RESOURCE_POLICY, HeaderValue::from_static("cross-origin")),
                (CROSS_ORIGIN_EMBEDDER_POLICY, HeaderValue::from_static("unsafe-none")),
                (CROSS_ORIGIN_OPENER_POLICY, HeaderValue::from_static("unsafe-none")),
                (REFERRER_POLICY, HeaderValue::from_static("no-referrer")),
            ],
        })
    }
}

#[async_trait]
impl FlowStage for FramePolicyStage {
    /// Records the upstream policy for telemetry before the assembler drops it.
    async fn on_response_headers(&self, flow: &mut Flow) -> RelayResult<()> {
        let Some(upstream) = flow.upstream.as_ref() else {
            return Ok(());
        };
        let stripped: Vec<String> = upstream
            .headers
            .get_all(CONTENT_SECURITY_POLICY)
            .iter()
            .chain(upstream.headers.get_all(CONTENT_SECURITY_POLICY_REPORT_ONLY).iter())
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        if !stripped.is_empty() {
            tracing::trace!(flow_id = %flow.id, count = stripped.len(), "upstream CSP discarded");
        }
        flow.metadata.stripped_csp = stripped;
        Ok(())
    }

    async fn on_response_finalized(&self, flow: &mut Flow) -> RelayResult<()> {
        let Some(response) = flow.response.as_mut() else {
            return Ok(());
        };
        response.headers.remove(CONTENT_SECURITY_POLICY_REPORT_ONLY);
        for (name, value) in &self.overrides {
            response.headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}
