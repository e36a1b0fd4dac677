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

/// Flow stages are the relay's ordered hooks around the upstream fetch. Each stage
/// implements [`FlowStage`] and the `StagePipeline` drives them in a fixed order so request
/// headers are shaped before the fetch, the body is classified before it is rewritten, and
/// response policy is applied last.

mod content;
mod frame_policy;
mod header_profile;
mod rewrite;

pub use content::ContentStage;
pub use frame_policy::FramePolicyStage;
pub use header_profile::HeaderProfileStage;
pub use rewrite::RewriteStage;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    config::{RelayConfig, SiteRuleTable},
    proxy::{flow::Flow, rewrite::RewriteEngine},
    utils::RelayResult,
};

#[derive(Clone)]
/// Represents the ordered pipeline of stages run for every flow.
pub struct StagePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    stages: Vec<Arc<dyn FlowStage>>,
}

impl StagePipeline {
    /// Builds the pipeline: header profile, content classification, rewrite, frame policy.
    pub fn build(cfg: &RelayConfig, sites: SiteRuleTable) -> Result<Self> {
        let engine = RewriteEngine::new(&cfg.rewrite, sites);
        let stages: Vec<Arc<dyn FlowStage>> = vec![
            Arc::new(HeaderProfileStage::new(cfg.fetch.profile_path.as_deref())?),
            Arc::new(ContentStage),
            Arc::new(RewriteStage::new(engine)),
            Arc::new(FramePolicyStage::new(&cfg.policy)?),
        ];
        Ok(Self::from_stages(stages))
    }

    pub fn from_stages(stages: Vec<Arc<dyn FlowStage>>) -> Self {
        Self {
            inner: Arc::new(PipelineInner { stages }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.stages.is_empty()
    }

    pub async fn process_request(&self, flow: &mut Flow) -> RelayResult<()> {
        for stage in &self.inner.stages {
            stage.on_request(flow).await?;
        }
        Ok(())
    }

    pub async fn process_response_headers(&self, flow: &mut Flow) -> RelayResult<()> {
        for stage in &self.inner.stages {
            stage.on_response_headers(flow).await?;
        }
        Ok(())
    }

    pub async fn process_response_body(&self, flow: &mut Flow) -> RelayResult<()> {
        for stage in &self.inner.stages {
            stage.on_response_body(flow).await?;
        }
        Ok(())
    }

    pub async fn finalize_response(&self, flow: &mut Flow) -> RelayResult<()> {
        for stage in &self.inner.stages {
            stage.on_response_finalized(flow).await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait FlowStage: Send + Sync {
    /// Before the fetch; `flow.outbound` is still mutable.
    async fn on_request(&self, _flow: &mut Flow) -> RelayResult<()> {
        Ok(())
    }

    /// After the fetch, once `flow.upstream` is set.
    async fn on_response_headers(&self, _flow: &mut Flow) -> RelayResult<()> {
        Ok(())
    }

    async fn on_response_body(&self, _flow: &mut Flow) -> RelayResult<()> {
        Ok(())
    }

    /// After `flow.response` is assembled, for every outcome that produced one.
    async fn on_response_finalized(&self, _flow: &mut Flow) -> RelayResult<()> {
        Ok(())
    }
}
