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

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::{proxy::flow::Flow, utils::RelayResult};

use super::FlowStage;

/// Desktop browser profile used when the config names no profile file.
const BUILTIN_PROFILE: &str = r#"{
    "name": "desktop-chrome",
    "set": [
        ["User-Agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"],
        ["Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"],
        ["Accept-Language", "en-US,en;q=0.9"],
        ["Accept-Encoding", "gzip, deflate, br"],
        ["Cache-Control", "no-cache"],
        ["Upgrade-Insecure-Requests", "1"]
    ],
    "replaceDynamic": [
        ["Accept", {
            "image": "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
            "css": "text/css,*/*;q=0.1",
            "javascript": "*/*",
            "font": "*/*"
        }]
    ]
}"#;

/// Path suffixes mapped to the resource kind keys a `replaceDynamic` rule may name.
const RESOURCE_SUFFIXES: &[(&str, &[&str])] = &[
    ("image", &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".ico", ".avif"]),
    ("css", &[".css"]),
    ("json", &[".json"]),
    ("javascript", &[".js", ".mjs"]),
    ("font", &[".woff", ".woff2", ".ttf", ".eot", ".otf"]),
    ("xml", &[".xml"]),
];

/// HeaderProfileStage gives every upstream request the header set of a real browser. The
/// profile is a JSON rule document read once at startup: `remove`, `set`, `replace`,
/// `replaceDynamic` (per resource kind) and `append`.
#[derive(Clone)]
pub struct HeaderProfileStage {
    name: String,
    rules: ProfileRules,
}

/// On-disk shape of a profile document.
#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ProfileDocument {
    name: Option<String>,
    remove: Vec<String>,
    set: Vec<(String, String)>,
    replace: Vec<(String, String)>,
    replace_dynamic: Vec<(String, BTreeMap<String, String>)>,
    append: Vec<(String, String)>,
}

/// Validated rules; every header name and value was checked at load time.
#[derive(Clone, Default)]
struct ProfileRules {
    remove: Vec<HeaderName>,
    set: Vec<(HeaderName, HeaderValue)>,
    replace: Vec<(HeaderName, HeaderValue)>,
    by_kind: Vec<(HeaderName, BTreeMap<String, HeaderValue>)>,
    append: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderProfileStage {
    /// Loads the profile at `path`, or the built-in profile when no path is configured.
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let (raw, fallback) = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read header profile: {}", path.display()))?;
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("profile");
                (raw, stem.to_string())
            }
            None => (BUILTIN_PROFILE.to_string(), "builtin".to_string()),
        };

        let document: ProfileDocument = serde_json::from_str(&raw)
            .with_context(|| format!("invalid header profile JSON ({fallback})"))?;
        let name = document.name.clone().unwrap_or(fallback);
        let rules = ProfileRules::compile(document).with_context(|| format!("header profile {name}"))?;
        Ok(Self { name, rules })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl FlowStage for HeaderProfileStage {
    async fn on_request(&self, flow: &mut Flow) -> RelayResult<()> {
        let path = flow.target.path().to_string();
        self.rules.apply(&mut flow.outbound.headers, &path);
        flow.metadata.profile = Some(self.name.clone());
        tracing::trace!(
            flow_id = %flow.id,
            profile = %self.name,
            user_agent = ?flow.outbound.headers.get(USER_AGENT),
            "applied header profile"
        );
        Ok(())
    }
}

impl ProfileRules {
    fn compile(document: ProfileDocument) -> Result<Self> {
        let remove = document
            .remove
            .iter()
            .map(|name| parse_name(name))
            .collect::<Result<_>>()?;

        let mut by_kind = Vec::with_capacity(document.replace_dynamic.len());
        for (name, variants) in &document.replace_dynamic {
            let name = parse_name(name)?;
            let variants = variants
                .iter()
                .map(|(kind, value)| Ok((kind.to_ascii_lowercase(), parse_value(&name, value)?)))
                .collect::<Result<_>>()?;
            by_kind.push((name, variants));
        }

        Ok(Self {
            remove,
            set: compile_pairs(&document.set)?,
            replace: compile_pairs(&document.replace)?,
            by_kind,
            append: compile_pairs(&document.append)?,
        })
    }

    /// Order matters: `set` only fills gaps, `replace` only overwrites what is present,
    /// and per-kind replacement sees the result of both.
    fn apply(&self, headers: &mut HeaderMap, path: &str) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        for (name, value) in &self.replace {
            if headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        let kind = resource_kind(path).unwrap_or("default");
        for (name, variants) in &self.by_kind {
            if !headers.contains_key(name) {
                continue;
            }
            if let Some(value) = variants.get(kind) {
                headers.insert(name.clone(), value.clone());
            }
        }

        for (name, value) in &self.append {
            headers.append(name.clone(), value.clone());
        }
    }
}

fn compile_pairs(pairs: &[(String, String)]) -> Result<Vec<(HeaderName, HeaderValue)>> {
    pairs
        .iter()
        .map(|(name, value)| {
            let name = parse_name(name)?;
            let value = parse_value(&name, value)?;
            Ok((name, value))
        })
        .collect()
}

fn parse_name(name: &str) -> Result<HeaderName> {
    HeaderName::try_from(name).with_context(|| format!("invalid header name {name:?}"))
}

fn parse_value(name: &HeaderName, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).with_context(|| format!("invalid value for header {name}"))
}

fn resource_kind(path: &str) -> Option<&'static str> {
    let path = path.to_ascii_lowercase();
    RESOURCE_SUFFIXES
        .iter()
        .find(|(_, suffixes)| suffixes.iter().any(|suffix| path.ends_with(suffix)))
        .map(|(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|h| h.to_str().ok())
    }

    fn compile(json: &str) -> ProfileRules {
        let document: ProfileDocument = serde_json::from_str(json).expect("profile json");
        ProfileRules::compile(document).expect("compile profile")
    }

    #[test]
    fn rules_remove_then_set_then_replace() {
        let rules = compile(
            r#"{
                "remove": ["Sec-CH-UA"],
                "set": [["Viewport-Width", "1920"], ["User-Agent", "ignored"]],
                "replace": [["User-Agent", "spoofed UA"]]
            }"#,
        );
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static("original"));
        headers.insert("Sec-CH-UA", HeaderValue::from_static("fake"));

        rules.apply(&mut headers, "/");

        assert_eq!(header(&headers, "user-agent"), Some("spoofed UA"));
        assert!(headers.get("sec-ch-ua").is_none());
        assert_eq!(header(&headers, "viewport-width"), Some("1920"));
    }

    #[test]
    fn builtin_profile_uses_resource_specific_accept() {
        let stage = HeaderProfileStage::new(None).expect("builtin profile");
        assert_eq!(stage.name(), "desktop-chrome");

        let mut page = HeaderMap::new();
        stage.rules.apply(&mut page, "/index.html");
        assert!(header(&page, "accept").is_some_and(|v| v.starts_with("text/html")));
        assert_eq!(header(&page, "upgrade-insecure-requests"), Some("1"));

        let mut image = HeaderMap::new();
        stage.rules.apply(&mut image, "/assets/logo.PNG");
        assert!(header(&image, "accept").is_some_and(|v| v.starts_with("image/avif")));
    }

    #[test]
    fn append_keeps_existing_values() {
        let rules = compile(r#"{"append": [["Accept-Language", "de;q=0.5"]]}"#);
        let mut headers = HeaderMap::new();
        headers.insert("Accept-Language", HeaderValue::from_static("en-US"));

        rules.apply(&mut headers, "/");

        let values: Vec<_> = headers.get_all("accept-language").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn profile_file_is_loaded_and_named() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mobile.json");
        fs::write(&path, r#"{"set": [["User-Agent", "Mobile UA"]]}"#).expect("write profile");

        let stage = HeaderProfileStage::new(Some(&path)).expect("load profile");
        assert_eq!(stage.name(), "mobile");

        let mut headers = HeaderMap::new();
        stage.rules.apply(&mut headers, "/");
        assert_eq!(header(&headers, "user-agent"), Some("Mobile UA"));
    }

    #[test]
    fn broken_profiles_are_startup_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").expect("write profile");
        assert!(HeaderProfileStage::new(Some(&path)).is_err());

        fs::write(&path, r#"{"set": [["Bad Name", "x"]]}"#).expect("write profile");
        assert!(HeaderProfileStage::new(Some(&path)).is_err());
    }
}
