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

use std::fs;

use base64::{engine::general_purpose::STANDARD, Engine};
use http::header::{
    ACCEPT_LANGUAGE, CONTENT_SECURITY_POLICY, CONTENT_TYPE, LOCATION, USER_AGENT, X_FRAME_OPTIONS,
};
use http::StatusCode;
use relay_proxy::config::{RelayConfig, TelemetryConfig};
use relay_proxy::proxy::endpoint::RelayEndpoint;
use relay_proxy::proxy::flow::{Flow, OutboundRequest, RelayMethod, ResolvedTarget};
use relay_proxy::proxy::stages::{FlowStage, HeaderProfileStage};
use relay_proxy::proxy::{ProxyResponse, Relay};
use relay_proxy::telemetry::TelemetrySink;
use relay_proxy::utils::RelayError;
use serde_json::json;
use tempfile::tempdir;
use url::Url;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RELAY: &str = "http://relay.test/relay";

fn build_flow(url: &str, method: RelayMethod, body: Option<String>) -> Flow {
    let target = ResolvedTarget::from_url(Url::parse(url).expect("url")).expect("http target");
    Flow::new(target, OutboundRequest::new(method, body), RelayEndpoint::new(RELAY))
}

fn relay_with(cfg: RelayConfig) -> Relay {
    Relay::new(&cfg, TelemetrySink::new(TelemetryConfig::default())).expect("relay builds")
}

fn relayed(url: &str) -> String {
    RelayEndpoint::new(RELAY).relay_url(&Url::parse(url).expect("url"))
}

fn header_str<'a>(response: &'a ProxyResponse, name: impl http::header::AsHeaderName) -> Option<&'a str> {
    response.headers.get(name).and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn header_profile_stage_shapes_outbound_headers() {
    let dir = tempdir().expect("tempdir");
    let profile = json!({
        "name": "Firefox Windows",
        "set": [
            ["User-Agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0"],
            ["Accept-Language", "en-US"]
        ],
        "append": [["Accept-Language", "en;q=0.5"]]
    });
    let profile_path = dir.path().join("firefox-windows.json");
    fs::write(&profile_path, serde_json::to_string_pretty(&profile).expect("json")).expect("write profile");

    let stage = HeaderProfileStage::new(Some(&profile_path)).expect("stage initializes");
    let mut flow = build_flow("https://example.com/", RelayMethod::Get, None);

    stage.on_request(&mut flow).await.expect("stage sets headers");

    assert_eq!(flow.metadata.profile.as_deref(), Some("Firefox Windows"));
    assert!(flow
        .outbound
        .headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ua| ua.contains("Firefox/126.0")));
    let languages: Vec<_> = flow
        .outbound
        .headers
        .get_all(ACCEPT_LANGUAGE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    assert_eq!(languages, vec!["en-US", "en;q=0.5"]);
}

#[tokio::test]
async fn markup_is_rewritten_and_made_embeddable() {
    let server = MockServer::start().await;
    let page = format!("{}/docs/page", server.uri());
    let html = r##"<!doctype html><html><head><base href="https://elsewhere.test/"><meta http-equiv="Content-Security-Policy" content="frame-ancestors 'none'"></head>
<body><a href="/about" target="_blank">About</a><img src="logo.png"><a href="#top">top</a>
<form action="/search"><input name="q"></form></body></html>"##;

    Mock::given(method("GET"))
        .and(path("/docs/page"))
        .and(header("upgrade-insecure-requests", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-frame-options", "DENY")
                .insert_header("content-security-policy", "frame-ancestors 'self'")
                .insert_header("set-cookie", "sid=abc")
                .set_body_raw(html, "text/html; charset=utf-8"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let relay = relay_with(RelayConfig::default());
    let mut flow = build_flow(&page, RelayMethod::Get, None);
    let response = relay.run_flow(&mut flow).await.expect("relay succeeds");

    assert_eq!(response.status, StatusCode::OK);
    assert!(!response.is_binary);
    assert_eq!(header_str(&response, CONTENT_TYPE), Some("text/html; charset=utf-8"));
    assert_eq!(header_str(&response, X_FRAME_OPTIONS), Some("ALLOWALL"));
    assert!(header_str(&response, CONTENT_SECURITY_POLICY).is_some_and(|csp| csp.contains("frame-ancestors *")));
    assert!(response.headers.get("set-cookie").is_none());

    let body = &response.body;
    let about = relayed(&format!("{}/about", server.uri()));
    assert!(body.contains(&format!(r#"<a href="{about}">About</a>"#)), "{body}");
    assert!(body.contains(&format!(r#"<img src="{}/docs/logo.png">"#, server.uri())));
    assert!(body.contains(r##"<a href="#top">top</a>"##));
    assert!(body.contains(&format!(r#"<form action="{RELAY}" method="post">"#)));
    assert!(body.contains(&format!(
        r#"<input type="hidden" name="_proxyFormAction" value="{}/search">"#,
        server.uri()
    )));
    assert!(body.contains(r#"<input type="hidden" name="_proxyFormMethod" value="get">"#));
    assert!(!body.contains("elsewhere.test"));
    assert!(!body.contains("frame-ancestors 'none'"));
    assert!(body.contains(&format!(r#"<head><base href="{page}">"#)));

    assert_eq!(flow.metadata.rewrite.relayed, 1);
    assert_eq!(flow.metadata.rewrite.forms, 1);
    assert_eq!(flow.metadata.rewrite.stripped, 2);
    assert_eq!(flow.metadata.stripped_csp, vec!["frame-ancestors 'self'".to_string()]);
}

#[tokio::test]
async fn binary_payloads_pass_through_as_base64() {
    let server = MockServer::start().await;
    let png: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    Mock::given(method("GET"))
        .and(path("/img"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(png.clone(), "image/png"))
        .mount(&server)
        .await;

    let relay = relay_with(RelayConfig::default());
    let mut flow = build_flow(&format!("{}/img", server.uri()), RelayMethod::Get, None);
    let response = relay.run_flow(&mut flow).await.expect("relay succeeds");

    assert!(response.is_binary);
    assert_eq!(response.body, STANDARD.encode(&png));
    assert_eq!(header_str(&response, CONTENT_TYPE), Some("image/png"));
    assert_eq!(header_str(&response, "access-control-allow-origin"), Some("*"));
    assert_eq!(response.body_bytes().expect("decodes"), png);
}

#[tokio::test]
async fn upstream_error_status_maps_to_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let relay = relay_with(RelayConfig::default());
    let mut flow = build_flow(&format!("{}/missing", server.uri()), RelayMethod::Get, None);
    let err = relay.run_flow(&mut flow).await.expect_err("404 upstream");

    assert!(matches!(err, RelayError::UpstreamStatus(status) if status == StatusCode::NOT_FOUND));
    let response = ProxyResponse::from_error(&err);
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.body,
        r#"{"error":"Upstream request failed","message":"Upstream responded with 404"}"#
    );
}

#[tokio::test]
async fn trusted_cdn_failure_redirects_to_origin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut cfg = RelayConfig::default();
    cfg.fetch.trusted_cdn_hosts = vec!["127.0.0.1".into()];
    let relay = relay_with(cfg);

    let target = format!("{}/npm/lib.js", server.uri());
    let mut flow = build_flow(&target, RelayMethod::Get, None);
    let response = relay.run_flow(&mut flow).await.expect("falls back");

    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(header_str(&response, LOCATION), Some(target.as_str()));
    assert_eq!(header_str(&response, X_FRAME_OPTIONS), Some("ALLOWALL"));
}

#[tokio::test]
async fn beacons_are_suppressed_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut cfg = RelayConfig::default();
    cfg.fetch.blocked_patterns = vec!["/collect".into()];
    let relay = relay_with(cfg);

    let mut flow = build_flow(&format!("{}/g/collect?v=2", server.uri()), RelayMethod::Get, None);
    let response = relay.run_flow(&mut flow).await.expect("suppressed");

    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(response.body.is_empty());
    assert_eq!(header_str(&response, "referrer-policy"), Some("no-referrer"));
}

#[tokio::test]
async fn redirects_rebase_relative_links_on_the_final_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("location", format!("{}/new/index.html", server.uri())),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"<a href="next">n</a>"#, "text/html"))
        .mount(&server)
        .await;

    let relay = relay_with(RelayConfig::default());
    let mut flow = build_flow(&format!("{}/old", server.uri()), RelayMethod::Get, None);
    let response = relay.run_flow(&mut flow).await.expect("follows redirect");

    assert!(flow.metadata.redirected);
    assert!(response
        .body
        .contains(&relayed(&format!("{}/new/next", server.uri()))));
}

#[tokio::test]
async fn relayed_post_forms_send_urlencoded_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("user=ada&note=a+b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>welcome</p>", "text/html"))
        .expect(1)
        .mount(&server)
        .await;

    let relay = relay_with(RelayConfig::default());
    let mut flow = build_flow(
        &format!("{}/login", server.uri()),
        RelayMethod::Post,
        Some("user=ada&note=a+b".into()),
    );
    let response = relay.run_flow(&mut flow).await.expect("post relayed");
    assert!(response.body.contains("<p>welcome</p>"));
}
