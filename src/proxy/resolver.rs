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

use http::{header::CONTENT_TYPE, Method};
use url::{form_urlencoded, Url};

use crate::{
    config::SiteRuleTable,
    utils::{RelayError, RelayResult},
};

use super::{
    endpoint::{FORM_ACTION_FIELD, FORM_METHOD_FIELD},
    flow::{RelayMethod, RequestParts, ResolvedTarget},
};

/// What the caller asked the relay to do, extracted from the inbound HTTP request.
///
/// Relay form markers are consumed here: they become `target_url`/`method` and never show
/// up in `form_fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub target_url: Option<String>,
    pub method: RelayMethod,
    pub form_fields: Vec<(String, String)>,
    pub relayed_form: bool,
}

impl ProxyRequest {
    pub fn get(target_url: impl Into<String>) -> Self {
        Self {
            target_url: Some(target_url.into()),
            method: RelayMethod::Get,
            form_fields: Vec::new(),
            relayed_form: false,
        }
    }

    /// Builds the request from `GET ?url=…` or a urlencoded `POST` (relay form or plain).
    pub fn from_inbound(parts: &RequestParts) -> RelayResult<Self> {
        let query_target = parts
            .uri
            .query()
            .and_then(|query| lookup_pair(query.as_bytes(), "url"));

        match parts.method {
            Method::GET | Method::HEAD => Ok(Self {
                target_url: query_target,
                method: RelayMethod::Get,
                form_fields: Vec::new(),
                relayed_form: false,
            }),
            Method::POST => {
                let fields = if is_urlencoded(parts) {
                    form_urlencoded::parse(parts.body.as_bytes())
                        .into_owned()
                        .collect::<Vec<_>>()
                } else {
                    Vec::new()
                };

                let relay_action = fields
                    .iter()
                    .find(|(key, _)| key == FORM_ACTION_FIELD)
                    .map(|(_, value)| value.clone());

                match relay_action {
                    Some(action) => {
                        let method = fields
                            .iter()
                            .find(|(key, _)| key == FORM_METHOD_FIELD)
                            .map(|(_, value)| RelayMethod::from_form_value(value))
                            .unwrap_or(RelayMethod::Get);
                        Ok(Self {
                            target_url: Some(action),
                            method,
                            form_fields: strip_markers(fields),
                            relayed_form: true,
                        })
                    }
                    None => Ok(Self {
                        target_url: query_target,
                        method: RelayMethod::Post,
                        form_fields: strip_markers(fields),
                        relayed_form: false,
                    }),
                }
            }
            ref other => Err(RelayError::MethodNotAllowed(other.clone())),
        }
    }

    /// urlencoded body for POST requests; GET forms travel in the query instead.
    pub fn outbound_body(&self) -> Option<String> {
        if self.method != RelayMethod::Post {
            return None;
        }
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.form_fields {
            serializer.append_pair(key, value);
        }
        Some(serializer.finish())
    }
}

/// Normalizes the requested target into the URL the fetch client will hit.
///
/// Order matters: parse, force https, merge GET form fields, then apply the site table's
/// query overrides so they win over anything the page submitted.
pub fn resolve_target(request: &ProxyRequest, sites: &SiteRuleTable) -> RelayResult<ResolvedTarget> {
    let raw = request
        .target_url
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or(RelayError::MissingTarget)?;

    let mut url = Url::parse(raw).map_err(|err| RelayError::InvalidUrl(format!("{raw}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RelayError::InvalidUrl(format!("{raw}: not an http(s) URL")));
    }

    if url.scheme() == "http" {
        url.set_scheme("https")
            .map_err(|_| RelayError::InvalidUrl(format!("{raw}: cannot upgrade to https")))?;
    }

    if request.relayed_form && request.method == RelayMethod::Get {
        merge_query(&mut url, &request.form_fields);
    }

    let host = url.host_str().unwrap_or_default().to_string();
    let overrides = sites.query_overrides(&host);
    if !overrides.is_empty() {
        let pairs: Vec<(String, String)> = overrides.into_iter().collect();
        merge_query(&mut url, &pairs);
        tracing::debug!(%host, params = pairs.len(), "applied site query overrides");
    }

    ResolvedTarget::from_url(url).ok_or_else(|| RelayError::InvalidUrl(raw.to_string()))
}

/// Sets every pair on the URL's query, replacing existing pairs with the same key and
/// keeping the rest in order. Relay markers never leak into the upstream query.
fn merge_query(url: &mut Url, fields: &[(String, String)]) {
    let fields: Vec<&(String, String)> = fields
        .iter()
        .filter(|(key, _)| key != FORM_ACTION_FIELD && key != FORM_METHOD_FIELD)
        .collect();
    if fields.is_empty() {
        return;
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(key, _)| !fields.iter().any(|(field, _)| field == key))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (key, value) in &kept {
        pairs.append_pair(key, value);
    }
    for (key, value) in fields {
        pairs.append_pair(key, value);
    }
}

fn strip_markers(fields: Vec<(String, String)>) -> Vec<(String, String)> {
    fields
        .into_iter()
        .filter(|(key, _)| key != FORM_ACTION_FIELD && key != FORM_METHOD_FIELD)
        .collect()
}

fn lookup_pair(raw: &[u8], name: &str) -> Option<String> {
    form_urlencoded::parse(raw)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn is_urlencoded(parts: &RequestParts) -> bool {
    match parts.headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()) {
        Some(content_type) => content_type
            .to_ascii_lowercase()
            .contains("application/x-www-form-urlencoded"),
        // Forms default to urlencoded; tolerate clients that omit the header.
        None => !parts.body.is_empty(),
    }
}
