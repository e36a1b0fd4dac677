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

use http::{header::HOST, HeaderMap};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::config::EndpointConfig;

/// Hidden field carrying the true absolute action of a relay form.
pub const FORM_ACTION_FIELD: &str = "_proxyFormAction";
/// Hidden field carrying the true method (`get`|`post`) of a relay form.
pub const FORM_METHOD_FIELD: &str = "_proxyFormMethod";

/// Same unreserved set as `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The relay endpoint as seen by the browser.
///
/// Rewritten markup carries an injected `<base>` pointing at the upstream origin, so the
/// endpoint embedded in attributes must be absolute whenever the inbound request tells us
/// where we are; otherwise relative relay links would resolve against the upstream site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    base: String,
}

impl RelayEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Picks the configured public URL, else derives `<proto>://<Host><path>` from the
    /// inbound headers, else falls back to the bare path.
    pub fn from_request(cfg: &EndpointConfig, headers: &HeaderMap) -> Self {
        if let Some(public) = cfg.public_url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Self::new(public.trim());
        }

        let host = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|host| !host.is_empty());

        match host {
            Some(host) => {
                let proto = headers
                    .get(FORWARDED_PROTO)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|raw| raw.split(',').next())
                    .map(|proto| proto.trim().to_ascii_lowercase())
                    .filter(|proto| proto == "http" || proto == "https")
                    .unwrap_or_else(|| "http".to_string());
                Self::new(format!("{proto}://{host}{}", cfg.path))
            }
            None => Self::new(cfg.path.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.base
    }

    /// `<endpoint>?url=<percent-encoded absolute URL>`
    pub fn relay_url(&self, target: &Url) -> String {
        format!(
            "{}?url={}",
            self.base,
            utf8_percent_encode(target.as_str(), COMPONENT)
        )
    }

    /// Reverses [`relay_url`](Self::relay_url); `None` for anything that is not a relay link.
    pub fn unwrap_relay(&self, value: &str) -> Option<String> {
        let encoded = self.relay_payload(value)?;
        let encoded = encoded.split('&').next().unwrap_or(encoded);
        percent_decode_str(encoded)
            .decode_utf8()
            .ok()
            .map(|decoded| decoded.into_owned())
    }

    /// True when `value` already points at this endpoint. Once the endpoint is absolute,
    /// a bare `/relay?url=` in upstream markup belongs to the upstream site and is not ours.
    pub fn is_relayed(&self, value: &str) -> bool {
        self.relay_payload(value).is_some()
    }

    fn relay_payload<'a>(&self, value: &'a str) -> Option<&'a str> {
        value.trim().strip_prefix(self.base.as_str())?.strip_prefix("?url=")
    }
}
