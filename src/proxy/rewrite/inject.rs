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

use url::Url;

use super::escape_attribute;

/// Markup prepended to `<head>`: a base pointing at the fetch base so anything the engine
/// missed still resolves against the original origin, then charset, viewport and referrer.
pub fn head_block(base: &Url) -> String {
    format!(
        "<base href=\"{}\">\
         <meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <meta name=\"referrer\" content=\"no-referrer\">",
        escape_attribute(base.as_str())
    )
}

/// Fallback for documents without a `<head>` tag: synthesize one after `<html …>` or the
/// doctype, or put it first.
pub fn insert_without_head(body: &str, block: &str) -> String {
    let at = head_insertion_point(&body.to_ascii_lowercase());
    let mut out = String::with_capacity(body.len() + block.len() + 13);
    out.push_str(&body[..at]);
    out.push_str("<head>");
    out.push_str(block);
    out.push_str("</head>");
    out.push_str(&body[at..]);
    out
}

/// Byte offset just past the opening `<html>` tag, else past the doctype, else zero.
/// ASCII lowercasing keeps offsets valid for the original body.
fn head_insertion_point(lower: &str) -> usize {
    opening_tag_end(lower, "<html")
        .or_else(|| opening_tag_end(lower, "<!doctype"))
        .unwrap_or(0)
}

/// End of the first `tag` whose name is not merely a prefix (`<htmlx` is not `<html`).
fn opening_tag_end(lower: &str, tag: &str) -> Option<usize> {
    lower.match_indices(tag).find_map(|(idx, _)| {
        let rest = &lower[idx + tag.len()..];
        match rest.bytes().next() {
            Some(b) if b.is_ascii_alphanumeric() => None,
            Some(_) => rest.find('>').map(|close| idx + tag.len() + close + 1),
            None => None,
        }
    })
}
