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

use anyhow::Context;
use async_trait::async_trait;
use http::header::CONTENT_ENCODING;

use crate::{
    proxy::{
        classify::{classify, decode_content_encoding, decode_markup, ContentKind},
        flow::Flow,
    },
    utils::RelayResult,
};

use super::FlowStage;

/// Content stage decides whether the upstream body is a document to rewrite or a payload to
/// pass through, and hands the rewrite stage plain UTF-8 text for documents.
#[derive(Clone, Copy, Default)]
pub struct ContentStage;

#[async_trait]
impl FlowStage for ContentStage {
    async fn on_response_body(&self, flow: &mut Flow) -> RelayResult<()> {
        let Some(upstream) = flow.upstream.as_ref() else {
            return Ok(());
        };

        let content_type = upstream.content_type.as_deref();
        let mut kind = classify(content_type, upstream.body.as_bytes());

        if kind == ContentKind::Markup {
            let encoding = upstream
                .headers
                .get(CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok());
            let decoded = decode_content_encoding(encoding, upstream.body.as_bytes())
                .with_context(|| format!("failed to decode {} body", encoding.unwrap_or("encoded")))?;

            match decoded {
                Some(bytes) => {
                    flow.metadata.markup = Some(decode_markup(content_type, &bytes));
                }
                None => {
                    tracing::debug!(flow_id = %flow.id, ?encoding, "passing undecodable document through");
                    kind = ContentKind::Binary;
                }
            }
        }

        tracing::debug!(
            flow_id = %flow.id,
            ?kind,
            content_type = content_type.unwrap_or("-"),
            bytes = upstream.body.len(),
            "classified upstream body"
        );
        flow.metadata.content_kind = Some(kind);
        Ok(())
    }
}
