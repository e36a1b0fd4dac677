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

use std::io::{Cursor, Read};

use anyhow::Result;
use brotli::Decompressor;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Serialize;

const MARKUP_MEDIA_TYPE: &str = "text/html";

/// How the relay treats an upstream payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// HTML: decoded to text and sent through the rewrite engine.
    Markup,
    /// Anything else: passed through untouched as base64.
    Binary,
}

/// Branches on the content type. Without one, only bodies that look like a document
/// (UTF-8, first non-whitespace byte `<`) are treated as markup.
pub fn classify(content_type: Option<&str>, body: &[u8]) -> ContentKind {
    match content_type {
        Some(value) if value.to_ascii_lowercase().contains(MARKUP_MEDIA_TYPE) => ContentKind::Markup,
        Some(_) => ContentKind::Binary,
        None => {
            let looks_like_markup = std::str::from_utf8(body)
                .map(|text| text.trim_start().starts_with('<'))
                .unwrap_or(false);
            if looks_like_markup {
                ContentKind::Markup
            } else {
                ContentKind::Binary
            }
        }
    }
}

/// Undoes `Content-Encoding` so the rewriter sees plain bytes.
///
/// Returns None when an encoding is not supported; callers then pass the body through as
/// binary instead of mangling it.
pub fn decode_content_encoding(content_encoding: Option<&str>, body: &[u8]) -> Result<Option<Vec<u8>>> {
    let encodings: Vec<String> = content_encoding
        .unwrap_or_default()
        .split(',')
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty() && token != "identity")
        .collect();

    let mut decoded = body.to_vec();
    for encoding in encodings.into_iter().rev() {
        decoded = match encoding.as_str() {
            "gzip" | "x-gzip" => decode_gzip(&decoded)?,
            "deflate" => decode_deflate(&decoded)?,
            "br" => decode_brotli(&decoded)?,
            other => {
                tracing::debug!(encoding = %other, "unsupported content-encoding");
                return Ok(None);
            }
        };
    }
    Ok(Some(decoded))
}

/// Decodes markup bytes into UTF-8 using the `charset` from the content type, falling back
/// to BOM sniffing and then UTF-8. Malformed sequences become U+FFFD.
pub fn decode_markup(content_type: Option<&str>, body: &[u8]) -> String {
    let encoding = content_type
        .and_then(charset_label)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, actual, had_errors) = encoding.decode(body);
    if had_errors {
        tracing::debug!(charset = actual.name(), "markup contained malformed sequences");
    }
    text.into_owned()
}

fn charset_label(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn decode_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decode_deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decode_brotli(data: &[u8]) -> Result<Vec<u8>> {
    let cursor = Cursor::new(data);
    let mut decoder = Decompressor::new(cursor, 4096);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
