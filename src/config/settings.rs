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

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration loaders and structures for the relay proxy.
///
/// These types mirror `relay.example.toml`. Every section has defaults, so an empty file
/// yields a working relay on 127.0.0.1:8080 serving `/relay`.
#[derive(Debug, Clone, Deserialize)]
/// Top-level configuration parsed from the relay TOML file.
///
/// Each nested struct captures one subsystem (listener, endpoint, fetch, rewrite, response
/// policy, site rules, telemetry) so changes stay localized.
pub struct RelayConfig {
    /// Listener configuration (bind address, port, inbound body limit).
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Where the relay endpoint lives and how rewritten markup addresses it.
    #[serde(default)]
    pub relay: EndpointConfig,
    /// Upstream fetch behavior (header profile, redirects, beacon blocklist, CDN fallback).
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Rewrite engine allow-lists and form handling.
    #[serde(default)]
    pub rewrite: RewriteConfig,
    /// Header overrides applied to every outbound response.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Declarative per-host rule table (chrome stripping + query overrides).
    #[serde(default = "default_sites")]
    pub sites: Vec<SiteRuleConfig>,
    /// Telemetry configuration (stdout vs structured log output).
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            relay: EndpointConfig::default(),
            fetch: FetchConfig::default(),
            rewrite: RewriteConfig::default(),
            policy: PolicyConfig::default(),
            sites: default_sites(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Reads the config file, deserializes TOML, and normalizes safe relative paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg: RelayConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid relay config: {}", path.display()))?;

        let base_dir = path.parent();
        if let Some(profile) = cfg.fetch.profile_path.as_mut() {
            Self::absolutize_path(base_dir, profile);
        }

        Ok(cfg)
    }

    /// Helper that resolves relative paths against the config file's location.
    fn absolutize_path(base_dir: Option<&Path>, target: &mut PathBuf) {
        if target.is_relative() {
            if let Some(dir) = base_dir {
                *target = dir.join(&*target);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Bind address for the HTTP listener (defaults to loopback for local testing).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port used for inbound client connections.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Largest inbound request body accepted (relayed form submissions).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Default listener bind address (loopback).
fn default_bind_address() -> String {
    "127.0.0.1".into()
}

/// Default listener port when none is provided.
fn default_bind_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Path the listener serves the relay on; every rewritten URL points here.
    #[serde(default = "default_endpoint_path")]
    pub path: String,
    /// Absolute public URL of the endpoint (e.g. `https://relay.example.net/relay`).
    /// When unset, the URL is derived from the inbound `Host` header.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            path: default_endpoint_path(),
            public_url: None,
        }
    }
}

fn default_endpoint_path() -> String {
    "/relay".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Optional JSON header profile (relative paths resolve beside the config file).
    /// The built-in desktop browser profile is used when absent.
    #[serde(default)]
    pub profile_path: Option<PathBuf>,
    /// Redirect hops followed transparently before giving up.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Overall upstream timeout. Unset means the host runtime decides.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Host/path substrings of analytics beacons and ad endpoints; matches answer 204.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
    /// Hosts whose failures redirect the browser to the original URL instead of erroring.
    #[serde(default = "default_trusted_cdn_hosts")]
    pub trusted_cdn_hosts: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            profile_path: None,
            max_redirects: default_max_redirects(),
            timeout_secs: None,
            blocked_patterns: default_blocked_patterns(),
            trusted_cdn_hosts: default_trusted_cdn_hosts(),
        }
    }
}

fn default_max_redirects() -> usize {
    10
}

fn default_blocked_patterns() -> Vec<String> {
    [
        "google-analytics.com",
        "googletagmanager.com",
        "doubleclick.net",
        "googlesyndication.com",
        "adservice.google.",
        "/pagead/",
        "/gen_204",
        "facebook.com/tr",
        "connect.facebook.net",
        "scorecardresearch.com",
        "bat.bing.com",
        "hotjar.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_trusted_cdn_hosts() -> Vec<String> {
    [
        "cdnjs.cloudflare.com",
        "cdn.jsdelivr.net",
        "unpkg.com",
        "ajax.googleapis.com",
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "gstatic.com",
        "code.jquery.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteConfig {
    /// Hosts whose resources the browser loads directly (suffix match, `*.` prefix allowed).
    #[serde(default = "default_direct_load_hosts")]
    pub direct_load_hosts: Vec<String>,
    /// Path extensions (without the dot) that are always loaded directly.
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,
    /// Relay form behavior.
    #[serde(default)]
    pub forms: FormConfig,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            direct_load_hosts: default_direct_load_hosts(),
            static_extensions: default_static_extensions(),
            forms: FormConfig::default(),
        }
    }
}

fn default_direct_load_hosts() -> Vec<String> {
    [
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "cdnjs.cloudflare.com",
        "cdn.jsdelivr.net",
        "unpkg.com",
        "ajax.googleapis.com",
        "code.jquery.com",
        "use.fontawesome.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_static_extensions() -> Vec<String> {
    [
        "js", "mjs", "css", "woff", "woff2", "ttf", "otf", "eot", "png", "jpg", "jpeg", "gif",
        "webp", "avif", "svg", "ico", "mp4", "webm", "mp3", "ogg", "wav",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormConfig {
    /// Drop `onsubmit` handlers from relay forms (scripts often rebuild the action URL).
    #[serde(default)]
    pub clear_onsubmit: bool,
    /// Drop `target` from relay forms so submissions stay inside the relay frame.
    #[serde(default = "default_true")]
    pub clear_target: bool,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            clear_onsubmit: false,
            clear_target: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Content-Security-Policy sent on every response in place of the upstream policy.
    #[serde(default = "default_content_security_policy")]
    pub content_security_policy: String,
    /// X-Frame-Options value forced on every response.
    #[serde(default = "default_frame_options")]
    pub frame_options: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            content_security_policy: default_content_security_policy(),
            frame_options: default_frame_options(),
        }
    }
}

fn default_content_security_policy() -> String {
    "default-src * 'unsafe-inline' 'unsafe-eval' data: blob:; \
     script-src * 'unsafe-inline' 'unsafe-eval' data: blob:; \
     style-src * 'unsafe-inline' data: blob:; \
     img-src * data: blob:; \
     frame-ancestors *"
        .into()
}

fn default_frame_options() -> String {
    "ALLOWALL".into()
}

/// One row of the declarative site table.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteRuleConfig {
    /// Host suffix this rule applies to (`google.com` also covers `www.google.com`).
    pub host: String,
    /// Selectors of cosmetic chrome removed from matching documents.
    #[serde(default)]
    pub remove_selectors: Vec<String>,
    /// Query parameters set (or overwritten) on every target URL for this host.
    #[serde(default)]
    pub query_overrides: BTreeMap<String, String>,
}

fn default_sites() -> Vec<SiteRuleConfig> {
    vec![
        SiteRuleConfig {
            host: "google.com".into(),
            remove_selectors: vec!["#gb".into(), "#footcnt".into(), "#tads".into(), "#bottomads".into()],
            query_overrides: BTreeMap::from([
                ("hl".to_string(), "en".to_string()),
                ("safe".to_string(), "active".to_string()),
            ]),
        },
        SiteRuleConfig {
            host: "bing.com".into(),
            remove_selectors: vec!["#id_h".into(), ".b_ad".into()],
            query_overrides: BTreeMap::from([
                ("setlang".to_string(), "en".to_string()),
                ("adlt".to_string(), "strict".to_string()),
            ]),
        },
        SiteRuleConfig {
            host: "duckduckgo.com".into(),
            remove_selectors: vec![".header--aside".into()],
            query_overrides: BTreeMap::from([
                ("kl".to_string(), "us-en".to_string()),
                ("kp".to_string(), "1".to_string()),
            ]),
        },
    ]
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Print structured, readable logs to stdout.
    #[default]
    Stdout,
    /// Emit JSON objects for ingestion systems.
    Json,
}
