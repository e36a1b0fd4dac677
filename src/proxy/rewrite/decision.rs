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

use std::collections::HashSet;

use url::Url;

use crate::{proxy::endpoint::RelayEndpoint, proxy::hosts::HostList, utils::NodeError};

/// `{tag → URL-valued attribute}`. A tag may appear more than once (`video` has both a
/// source and a poster).
pub const URL_ATTRIBUTES: &[(&str, &str)] = &[
    ("a", "href"),
    ("area", "href"),
    ("link", "href"),
    ("img", "src"),
    ("script", "src"),
    ("iframe", "src"),
    ("frame", "src"),
    ("source", "src"),
    ("embed", "src"),
    ("video", "src"),
    ("video", "poster"),
    ("audio", "src"),
    ("track", "src"),
    ("object", "data"),
    ("input", "src"),
];

/// Attributes holding comma-separated candidate lists (`url descriptor, …`).
pub const SRCSET_ATTRIBUTES: &[(&str, &str)] = &[("img", "srcset"), ("source", "srcset")];

/// What to do with one URL-bearing attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteDecision {
    /// Route through the relay endpoint.
    ProxyRelay(Url),
    /// Let the browser fetch the absolute URL from its origin.
    DirectLoad(Url),
    /// Leave the attribute byte-for-byte as it is.
    Inert,
}

impl RewriteDecision {
    /// The attribute value to write, or None to leave the original untouched.
    pub fn render(&self, relay: &RelayEndpoint) -> Option<String> {
        match self {
            RewriteDecision::ProxyRelay(url) => Some(relay.relay_url(url)),
            RewriteDecision::DirectLoad(url) => Some(url.to_string()),
            RewriteDecision::Inert => None,
        }
    }
}

/// Hosts and path extensions the browser may load without going through the relay.
#[derive(Debug, Clone, Default)]
pub struct DirectLoadRules {
    hosts: HostList,
    extensions: HashSet<String>,
}

impl DirectLoadRules {
    pub fn new(hosts: &[String], extensions: &[String]) -> Self {
        Self {
            hosts: HostList::new(hosts),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, url: &Url) -> bool {
        if url.host_str().map(|host| self.hosts.matches(host)).unwrap_or(false) {
            return true;
        }
        path_extension(url)
            .map(|ext| self.extensions.contains(&ext))
            .unwrap_or(false)
    }
}

/// Lower-cased extension of the last path segment, if it has one.
fn path_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Values the engine never touches: empty, fragments, `data:` and `javascript:` URLs.
pub fn is_inert_value(value: &str) -> bool {
    let value = value.trim();
    value.is_empty()
        || value.starts_with('#')
        || has_scheme(value, "data:")
        || has_scheme(value, "javascript:")
}

fn has_scheme(value: &str, scheme: &str) -> bool {
    value
        .get(..scheme.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(scheme))
        .unwrap_or(false)
}

/// One `srcset` entry: the URL and its descriptor (`2x`, `480w`, or empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcsetCandidate<'a> {
    pub url: &'a str,
    pub descriptor: &'a str,
}

/// Splits a `srcset` value the way browsers do. A URL runs to the next whitespace, so
/// commas inside it (`data:image/gif;base64,…`) stay part of the URL; only a comma after
/// the URL or at the top level of the descriptor ends a candidate.
pub fn srcset_candidates(raw: &str) -> Vec<SrcsetCandidate<'_>> {
    let mut candidates = Vec::new();
    let mut rest = raw;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_ascii_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        let url_end = rest
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        let (url, after) = rest.split_at(url_end);
        let bare = url.trim_end_matches(',');
        if bare.len() != url.len() {
            candidates.push(SrcsetCandidate { url: bare, descriptor: "" });
            rest = after;
            continue;
        }

        let (descriptor, remainder) = split_descriptor(after);
        candidates.push(SrcsetCandidate {
            url,
            descriptor: descriptor.trim(),
        });
        rest = remainder;
    }
    candidates
}

/// Descriptor text up to the next comma outside parentheses, and what follows it.
fn split_descriptor(rest: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return (&rest[..idx], &rest[idx + 1..]),
            _ => {}
        }
    }
    (rest, "")
}

/// Classifies one attribute value against the document base.
pub fn decide(
    raw: &str,
    base: &Url,
    rules: &DirectLoadRules,
    relay: &RelayEndpoint,
) -> Result<RewriteDecision, NodeError> {
    if is_inert_value(raw) || relay.is_relayed(raw) {
        return Ok(RewriteDecision::Inert);
    }

    let absolute = base
        .join(raw.trim())
        .map_err(|source| NodeError::Unresolvable {
            value: raw.to_string(),
            base: base.to_string(),
            source,
        })?;

    // mailto:, tel:, blob:, about: and friends stay as written.
    if !matches!(absolute.scheme(), "http" | "https") {
        return Ok(RewriteDecision::Inert);
    }

    if rules.allows(&absolute) {
        Ok(RewriteDecision::DirectLoad(absolute))
    } else {
        Ok(RewriteDecision::ProxyRelay(absolute))
    }
}
