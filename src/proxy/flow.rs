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

use bytes::BytesMut;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use super::{classify::ContentKind, endpoint::RelayEndpoint, response::ProxyResponse};

/// Flow tracks everything we know about a single relay request as it moves through the
/// pipeline: the resolved target, the outbound request, the upstream response and the
/// response handed back to the caller.
///
/// A Flow is created once the target URL has been resolved, run through the stage
/// pipeline around the upstream fetch, and logged once the response is assembled. Flows
/// are owned by a single task, so mutating them with `&mut` is safe without extra
/// synchronization.
#[derive(Debug)]
pub struct Flow {
    /// UUID v7, so ids sort by arrival time in the logs.
    pub id: Uuid,

    /// Normalized absolute URL the relay fetches.
    pub target: ResolvedTarget,

    /// What the fetch client sends upstream. Stages mutate headers before the fetch.
    pub outbound: OutboundRequest,

    /// Where rewritten links point back to.
    pub relay: RelayEndpoint,

    /// Upstream response; None until the fetch completes.
    pub upstream: Option<UpstreamResponse>,

    /// Final response for the caller; None until assembled.
    pub response: Option<ProxyResponse>,

    /// Cross-stage scratchpad and the data telemetry reports.
    pub metadata: FlowMetadata,
}

impl Flow {
    pub fn new(target: ResolvedTarget, outbound: OutboundRequest, relay: RelayEndpoint) -> Self {
        Self {
            id: Uuid::now_v7(),
            target,
            outbound,
            relay,
            upstream: None,
            response: None,
            metadata: FlowMetadata::default(),
        }
    }
}

/// A normalized absolute target URL. Always http(s) with a host; the resolver only ever
/// hands out `https` targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    url: Url,
}

impl ResolvedTarget {
    /// Wraps an already validated URL. Returns None for anything without a host or with a
    /// scheme other than http/https.
    pub fn from_url(url: Url) -> Option<Self> {
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return None;
        }
        Some(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.url.fragment()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

/// Relay method for the upstream request. The relay never issues anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMethod {
    Get,
    Post,
}

impl RelayMethod {
    /// Parses the `_proxyFormMethod` marker; anything but `post` means GET, like an HTML form.
    pub fn from_form_value(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("post") {
            RelayMethod::Post
        } else {
            RelayMethod::Get
        }
    }

    pub fn as_method(self) -> Method {
        match self {
            RelayMethod::Get => Method::GET,
            RelayMethod::Post => Method::POST,
        }
    }

    pub fn as_form_value(self) -> &'static str {
        match self {
            RelayMethod::Get => "get",
            RelayMethod::Post => "post",
        }
    }
}

/// An inbound request as parsed by the listener. The body is owned so the resolver can
/// read the `url` field from either the query string or a urlencoded form.
#[derive(Debug)]
pub struct RequestParts {
    pub method: Method,

    pub uri: Uri,

    pub version: Version,

    pub headers: HeaderMap,

    pub body: BodyBuffer,
}

impl Default for RequestParts {
    /// Placeholder request for tests.
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/relay"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BodyBuffer::default(),
        }
    }
}

/// The request the fetch client issues upstream.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: RelayMethod,

    pub headers: HeaderMap,

    /// urlencoded form body for relayed POST forms.
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: RelayMethod, body: Option<String>) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body,
        }
    }
}

/// Upstream response as buffered by the fetch client.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,

    pub content_type: Option<String>,

    pub headers: HeaderMap,

    pub body: BodyBuffer,

    /// URL after redirects; relative references in the document resolve against it.
    pub final_url: Url,
}

/// Fully buffered message body. Requests are capped at `relay.max_body_bytes` by the
/// listener and upstream bodies are read whole by reqwest, so nothing here streams.
#[derive(Debug, Default)]
pub struct BodyBuffer {
    data: BytesMut,
}

impl BodyBuffer {
    pub fn from_slice(chunk: &[u8]) -> Self {
        Self {
            data: BytesMut::from(chunk),
        }
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// FlowMetadata is a typed scratchpad for stages to communicate (content classification,
/// decoded markup, rewrite statistics) and for telemetry to record the final state of the
/// flow without poking at stage internals.
#[derive(Debug, Default)]
pub struct FlowMetadata {
    /// Name of the header profile applied to the outbound request.
    pub profile: Option<String>,

    pub content_kind: Option<ContentKind>,

    /// Decoded UTF-8 markup, set by the content stage, consumed by the rewrite stage.
    pub markup: Option<String>,

    pub rewrite: RewriteStats,

    /// Upstream CSP values dropped by the frame policy.
    pub stripped_csp: Vec<String>,

    pub site_rules_applied: usize,

    pub redirected: bool,
}

/// Counters for one document rewrite.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RewriteStats {
    pub relayed: usize,
    pub direct: usize,
    pub inert: usize,
    pub forms: usize,
    pub stripped: usize,
    pub node_errors: usize,
}
