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

//! Response assembly: what the relay hands back to the caller for every outcome,
//! including the JSON error mapping.

use base64::{engine::general_purpose::STANDARD, Engine};
use http::{
    header::{
        ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
        CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
        CONTENT_SECURITY_POLICY_REPORT_ONLY, CONTENT_TYPE, LOCATION, SET_COOKIE, X_FRAME_OPTIONS,
    },
    HeaderMap, HeaderName, HeaderValue, StatusCode,
};
use serde::Serialize;
use url::Url;

use crate::utils::{RelayError, RelayResult};

use super::classify::ContentKind;

const MARKUP_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Connection-scoped headers that never cross the relay.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// What the caller receives. Binary bodies travel as base64 text with `is_binary` set; the
/// listener decodes them back to raw bytes on the wire.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    pub is_binary: bool,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ProxyResponse {
    /// Rewritten document with the filtered upstream headers.
    pub fn markup(status: StatusCode, upstream: &HeaderMap, html: String) -> Self {
        let mut headers = passthrough_headers(upstream, ContentKind::Markup);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(MARKUP_CONTENT_TYPE));
        Self {
            status,
            headers,
            body: html,
            is_binary: false,
        }
    }

    /// Untouched payload; the upstream content type and encoding are preserved.
    pub fn binary(status: StatusCode, upstream: &HeaderMap, bytes: &[u8]) -> Self {
        Self {
            status,
            headers: passthrough_headers(upstream, ContentKind::Binary),
            body: STANDARD.encode(bytes),
            is_binary: true,
        }
    }

    /// Answer for a suppressed beacon.
    pub fn no_content() -> Self {
        Self::empty(StatusCode::NO_CONTENT)
    }

    /// Sends the browser straight to `location`, bypassing the relay.
    pub fn redirect(location: &Url) -> Self {
        let mut response = Self::empty(StatusCode::FOUND);
        if let Ok(value) = HeaderValue::from_str(location.as_str()) {
            response.headers.insert(LOCATION, value);
        }
        response
    }

    /// CORS preflight answer.
    pub fn preflight() -> Self {
        let mut response = Self::empty(StatusCode::NO_CONTENT);
        response
            .headers
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response
            .headers
            .insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
        response
            .headers
            .insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
        response
    }

    pub fn not_found() -> Self {
        Self::json(StatusCode::NOT_FOUND, "Not found", None)
    }

    /// The listener could not parse the request at all.
    pub fn malformed_request(detail: &str) -> Self {
        Self::json(StatusCode::BAD_REQUEST, "Malformed request", Some(detail.to_string()))
    }

    /// Maps a relay failure onto its status code and JSON body.
    pub fn from_error(err: &RelayError) -> Self {
        match err {
            RelayError::MissingTarget => Self::json(StatusCode::BAD_REQUEST, "Missing url parameter", None),
            RelayError::InvalidUrl(_) => Self::json(StatusCode::BAD_REQUEST, "Invalid URL format", None),
            RelayError::MethodNotAllowed(_) => {
                Self::json(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed", None)
            }
            RelayError::PayloadTooLarge { .. } => {
                Self::json(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large", None)
            }
            RelayError::UpstreamStatus(_) => Self::json(
                StatusCode::BAD_GATEWAY,
                "Upstream request failed",
                Some(err.to_string()),
            ),
            RelayError::Network(message) => Self::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error fetching URL",
                Some(message.clone()),
            ),
            RelayError::Rewrite(_) | RelayError::Io(_) | RelayError::Other(_) => Self::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process response",
                Some(err.to_string()),
            ),
        }
    }

    fn json(status: StatusCode, error: &str, message: Option<String>) -> Self {
        let body = serde_json::to_string(&ErrorBody { error, message })
            .unwrap_or_else(|_| format!("{{\"error\":\"{error}\"}}"));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        Self {
            status,
            headers,
            body,
            is_binary: false,
        }
    }

    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
            is_binary: false,
        }
    }

    /// Wire bytes of the body.
    pub fn body_bytes(&self) -> RelayResult<Vec<u8>> {
        if self.is_binary {
            STANDARD
                .decode(self.body.as_bytes())
                .map_err(|err| RelayError::Other(anyhow::anyhow!("invalid base64 body: {err}")))
        } else {
            Ok(self.body.as_bytes().to_vec())
        }
    }
}

/// Copies upstream headers the caller may see. Framing blockers and cookies are dropped;
/// markup additionally loses length and encoding because its body is re-serialized.
pub fn passthrough_headers(upstream: &HeaderMap, kind: ContentKind) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_filtered(name, kind) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn is_filtered(name: &HeaderName, kind: ContentKind) -> bool {
    if HOP_BY_HOP.contains(&name.as_str()) {
        return true;
    }
    if name == SET_COOKIE
        || name == CONTENT_SECURITY_POLICY
        || name == CONTENT_SECURITY_POLICY_REPORT_ONLY
        || name == X_FRAME_OPTIONS
    {
        return true;
    }
    kind == ContentKind::Markup && (name == CONTENT_LENGTH || name == CONTENT_ENCODING)
}
