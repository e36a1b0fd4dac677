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

use http::{Method, StatusCode};
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Failures that end a relay request. Every variant maps to a structured JSON response in
/// `ProxyResponse::from_error`; nothing escapes to the caller as an empty 500.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Missing url parameter")]
    MissingTarget,

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),

    #[error("method {0} is not supported by the relay endpoint")]
    MethodNotAllowed(Method),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Upstream responded with {}", .0.as_u16())]
    UpstreamStatus(StatusCode),

    #[error("{0}")]
    Network(String),

    #[error("document rewrite failed: {0}")]
    Rewrite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// True for errors detected from the inbound request alone, before any network call.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::MissingTarget
                | RelayError::InvalidUrl(_)
                | RelayError::MethodNotAllowed(_)
                | RelayError::PayloadTooLarge { .. }
        )
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Network(err.to_string())
    }
}

/// Per-attribute rewrite failure. Never surfaced to the caller: the attribute is left as-is
/// and the rest of the document keeps going.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("cannot resolve `{value}` against {base}: {source}")]
    Unresolvable {
        value: String,
        base: String,
        #[source]
        source: url::ParseError,
    },

    #[error("cannot set attribute `{attribute}`: {reason}")]
    Attribute { attribute: String, reason: String },
}
