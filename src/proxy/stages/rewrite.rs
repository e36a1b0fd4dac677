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

use async_trait::async_trait;

use crate::{
    proxy::{flow::Flow, rewrite::RewriteEngine},
    utils::RelayResult,
};

use super::FlowStage;

/// Rewrite stage runs the markup the content stage decoded through the rewrite engine,
/// using the post-redirect URL as the document base.
#[derive(Clone)]
pub struct RewriteStage {
    engine: RewriteEngine,
}

impl RewriteStage {
    pub fn new(engine: RewriteEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl FlowStage for RewriteStage {
    async fn on_response_body(&self, flow: &mut Flow) -> RelayResult<()> {
        let Some(markup) = flow.metadata.markup.take() else {
            return Ok(());
        };
        let base = flow
            .upstream
            .as_ref()
            .map(|upstream| upstream.final_url.clone())
            .unwrap_or_else(|| flow.target.url().clone());

        let output = self.engine.rewrite(&markup, &base, &flow.relay)?;
        flow.metadata.site_rules_applied = self
            .engine
            .site_rules()
            .matching(base.host_str().unwrap_or_default())
            .count();

        tracing::debug!(
            flow_id = %flow.id,
            base = %base,
            relayed = output.stats.relayed,
            direct = output.stats.direct,
            forms = output.stats.forms,
            stripped = output.stats.stripped,
            node_errors = output.stats.node_errors,
            "rewrote document"
        );

        flow.metadata.rewrite = output.stats;
        flow.metadata.markup = Some(output.html);
        Ok(())
    }
}
