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

use anyhow::{Context, Result};
use http::header::{CONTENT_TYPE, HeaderValue};
use reqwest::redirect::Policy;
use url::Url;

use crate::{
    config::FetchConfig,
    proxy::{
        flow::{BodyBuffer, OutboundRequest, RelayMethod, ResolvedTarget, UpstreamResponse},
        hosts::HostList,
    },
    utils::{RelayError, RelayResult},
};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Result of one upstream fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// A 2xx response, fully buffered.
    Fetched(UpstreamResponse),
    /// The target is a known beacon; nothing was sent.
    Suppressed,
    /// A trusted CDN failed; the browser should load the original URL itself.
    RedirectToOrigin(Url),
}

/// Upstream HTTP client shared by every request. Owns the reqwest connection pool, the
/// redirect policy and the beacon/CDN host rules.
#[derive(Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    blocked_patterns: Vec<String>,
    trusted_cdn: HostList,
}

impl FetchClient {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::limited(cfg.max_redirects))
            .use_rustls_tls();
        if let Some(secs) = cfg.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder.build().context("failed to build upstream HTTP client")?;

        Ok(Self {
            http,
            blocked_patterns: cfg
                .blocked_patterns
                .iter()
                .map(|pattern| pattern.trim().to_ascii_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
            trusted_cdn: HostList::new(&cfg.trusted_cdn_hosts),
        })
    }

    /// True when `host + path` contains a blocklisted pattern (case-insensitive).
    pub fn is_blocked(&self, url: &Url) -> bool {
        let haystack = format!("{}{}", url.host_str().unwrap_or_default(), url.path()).to_ascii_lowercase();
        self.blocked_patterns
            .iter()
            .any(|pattern| haystack.contains(pattern.as_str()))
    }

    pub fn is_trusted_cdn(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| self.trusted_cdn.matches(host))
            .unwrap_or(false)
    }

    /// Fetches `target` with the flow's outbound request, following redirects.
    pub async fn fetch(&self, target: &ResolvedTarget, outbound: &OutboundRequest) -> RelayResult<FetchOutcome> {
        let url = target.url();
        if self.is_blocked(url) {
            tracing::debug!(target = %url, "suppressed beacon request");
            return Ok(FetchOutcome::Suppressed);
        }

        match self.send(url, outbound).await {
            Ok(upstream) => Ok(FetchOutcome::Fetched(upstream)),
            Err(err) if self.is_trusted_cdn(url) => {
                tracing::debug!(target = %url, error = %err, "trusted CDN failed; redirecting to origin");
                Ok(FetchOutcome::RedirectToOrigin(url.clone()))
            }
            Err(err) => Err(err),
        }
    }

    async fn send(&self, url: &Url, outbound: &OutboundRequest) -> RelayResult<UpstreamResponse> {
        let mut request = self
            .http
            .request(outbound.method.as_method(), url.clone())
            .headers(outbound.headers.clone());
        if let (RelayMethod::Post, Some(body)) = (outbound.method, outbound.body.as_ref()) {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
                .body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().clone();
        if final_url != *url {
            tracing::debug!(from = %url, to = %final_url, "followed upstream redirects");
        }
        if !status.is_success() {
            return Err(RelayError::UpstreamStatus(status));
        }

        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        tracing::trace!(%status, bytes = body.len(), "upstream response buffered");
        Ok(UpstreamResponse {
            status,
            content_type,
            headers,
            body: BodyBuffer::from_slice(&body),
            final_url,
        })
    }
}
