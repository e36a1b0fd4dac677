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

use proptest::prelude::*;
use relay_proxy::config::{RewriteConfig, SiteRuleTable};
use relay_proxy::proxy::endpoint::RelayEndpoint;
use relay_proxy::proxy::rewrite::RewriteEngine;
use url::Url;

const RELAY: &str = "http://localhost:8080/relay";

fn engine() -> RewriteEngine {
    RewriteEngine::new(&RewriteConfig::default(), SiteRuleTable::default())
}

/// No direct-load hosts or extensions: every http(s) URL is relayed.
fn relay_everything() -> RewriteEngine {
    let cfg = RewriteConfig {
        direct_load_hosts: Vec::new(),
        static_extensions: Vec::new(),
        ..RewriteConfig::default()
    };
    RewriteEngine::new(&cfg, SiteRuleTable::default())
}

fn base() -> Url {
    Url::parse("https://example.com/page").expect("base")
}

fn rewrite(engine: &RewriteEngine, html: &str) -> String {
    engine
        .rewrite(html, &base(), &RelayEndpoint::new(RELAY))
        .expect("document rewrites")
        .html
}

/// href of the first anchor; the injected `<base>` also carries an href, so match the tag.
fn anchor_href(html: &str) -> Option<&str> {
    let marker = "<a href=\"";
    let start = html.find(marker)? + marker.len();
    let len = html[start..].find('"')?;
    Some(&html[start..start + len])
}

#[test]
fn data_and_fragment_values_are_untouched() {
    let html = r##"<body><img src="data:image/png;base64,iVBORw0KGgo="><a href="#section-2">jump</a><a href="javascript:void(0)">js</a></body>"##;
    let out = rewrite(&engine(), html);
    assert!(out.contains(r#"<img src="data:image/png;base64,iVBORw0KGgo=">"#));
    assert!(out.contains(r##"<a href="#section-2">jump</a>"##));
    assert!(out.contains(r#"<a href="javascript:void(0)">js</a>"#));
}

#[test]
fn anchors_point_back_through_the_relay_without_target() {
    let out = rewrite(&engine(), r#"<a href="/x" target="_top">x</a>"#);
    assert!(out.contains(r#"href="http://localhost:8080/relay?url=https%3A%2F%2Fexample.com%2Fx""#));
    assert!(!out.contains("target="));
}

#[test]
fn post_forms_become_relay_forms() {
    let out = rewrite(
        &engine(),
        r#"<form method="post" action="/submit" enctype="multipart/form-data" target="_blank"><input name="q"></form>"#,
    );
    assert!(out.contains(&format!(r#"<form method="post" action="{RELAY}">"#)), "{out}");
    assert!(out.contains(r#"<input type="hidden" name="_proxyFormAction" value="https://example.com/submit">"#));
    assert!(out.contains(r#"<input type="hidden" name="_proxyFormMethod" value="post">"#));
    assert!(!out.contains("enctype"));
    assert!(!out.contains("_blank"));
    assert!(out.contains(r#"<input name="q">"#));
}

#[test]
fn actionless_forms_submit_to_the_document() {
    let out = rewrite(&engine(), r#"<form><input name="q"></form>"#);
    assert!(out.contains(r#"name="_proxyFormAction" value="https://example.com/page""#));
    assert!(out.contains(r#"name="_proxyFormMethod" value="get""#));
}

#[test]
fn allow_listed_scripts_load_directly() {
    let out = rewrite(
        &engine(),
        r#"<script src="https://cdn.jsdelivr.net/npm/vue@3/dist/vue.js"></script><script src="/app/main.js"></script>"#,
    );
    assert!(out.contains(r#"<script src="https://cdn.jsdelivr.net/npm/vue@3/dist/vue.js"></script>"#));
    assert!(out.contains(r#"<script src="https://example.com/app/main.js"></script>"#));
    assert!(!out.contains("relay?url=https%3A%2F%2Fcdn.jsdelivr.net"));
}

#[test]
fn already_relayed_links_are_not_wrapped_twice() {
    let link = "http://localhost:8080/relay?url=https%3A%2F%2Fexample.com%2Fx";
    let out = rewrite(&engine(), &format!(r#"<a href="{link}">x</a>"#));
    assert_eq!(anchor_href(&out), Some(link));
}

proptest! {
    #[test]
    fn relayed_links_round_trip_to_the_resolved_url(
        path in "[a-z0-9]{1,8}(/[a-z0-9._-]{1,8}){0,3}",
        query in proptest::option::of("[a-z]{1,5}=[a-z0-9%+]{0,6}"),
    ) {
        let relative = match &query {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };
        let expected = base().join(&relative).expect("resolves");

        let out = rewrite(&relay_everything(), &format!(r#"<a href="{relative}">x</a>"#));
        let href = anchor_href(&out).expect("href kept");
        let recovered = RelayEndpoint::new(RELAY).unwrap_relay(href).expect("relay link");

        prop_assert_eq!(recovered, expected.as_str());
    }
}
