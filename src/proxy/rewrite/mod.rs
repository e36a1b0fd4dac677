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

//! The rewrite engine: one streaming pass over the upstream markup that strips framing
//! blockers and site chrome, classifies every URL-bearing attribute, converts forms into
//! relay forms and injects the relay's own `<head>` preamble.

mod decision;
mod forms;
mod inject;

pub use decision::{
    decide, is_inert_value, srcset_candidates, DirectLoadRules, RewriteDecision, SrcsetCandidate,
    SRCSET_ATTRIBUTES, URL_ATTRIBUTES,
};
pub use forms::FormOutcome;
pub use inject::head_block;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use lol_html::{
    doc_text, element, end_tag,
    html_content::{ContentType, Element},
    rewrite_str, HandlerResult, RewriteStrSettings,
};
use url::Url;

use crate::{
    config::{FormConfig, RewriteConfig, SiteRuleTable},
    proxy::{endpoint::RelayEndpoint, flow::RewriteStats},
    utils::{NodeError, RelayError, RelayResult},
};

/// Elements a site rule may never remove, whatever its selector matched.
const PROTECTED_TAGS: &[&str] = &["html", "head", "body", "main"];

/// Elements whose end tag may be implied by what follows. End-tag callbacks never fire for
/// them, so a stripped region rooted here could not be closed.
const OPTIONAL_END_TAGS: &[&str] = &[
    "p", "li", "dt", "dd", "option", "optgroup", "rb", "rt", "rtc", "rp", "tr", "td", "th",
    "thead", "tbody", "tfoot", "colgroup", "caption",
];

/// Open site-rule region, innermost last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Strip,
    Keep,
}

/// Result of one document rewrite.
#[derive(Debug, Clone)]
pub struct RewriteOutput {
    pub html: String,
    pub stats: RewriteStats,
}

/// Host-agnostic rewrite engine. Site specifics come from the rule table, allow-lists from
/// config; the engine holds no per-request state.
#[derive(Debug, Clone)]
pub struct RewriteEngine {
    direct: DirectLoadRules,
    forms: FormConfig,
    sites: SiteRuleTable,
}

impl RewriteEngine {
    pub fn new(cfg: &RewriteConfig, sites: SiteRuleTable) -> Self {
        Self {
            direct: DirectLoadRules::new(&cfg.direct_load_hosts, &cfg.static_extensions),
            forms: cfg.forms.clone(),
            sites,
        }
    }

    pub fn site_rules(&self) -> &SiteRuleTable {
        &self.sites
    }

    /// Rewrites `html` fetched from `base` so its links route through `relay`.
    ///
    /// Per-attribute failures are logged and counted; only a failure of the rewriter
    /// itself fails the document.
    pub fn rewrite(&self, html: &str, base: &Url, relay: &RelayEndpoint) -> RelayResult<RewriteOutput> {
        let stats = RefCell::new(RewriteStats::default());
        let head_seen = Cell::new(false);
        let preamble = head_block(base);
        let chrome = self.sites.remove_selectors(base.host_str().unwrap_or_default());
        let regions: Rc<RefCell<Vec<Region>>> = Rc::default();

        let stats = &stats;
        let head_seen = &head_seen;
        let preamble = preamble.as_str();

        let mut handlers = vec![
            // Strip phase: an inherited <base> or CSP meta would override our own policy.
            element!("base", move |el| {
                el.remove();
                stats.borrow_mut().stripped += 1;
                Ok(())
            }),
            element!("meta[http-equiv]", move |el| {
                self.handle_http_equiv(el, base, relay, stats);
                Ok(())
            }),
        ];

        for selector in &chrome {
            let regions = Rc::clone(&regions);
            handlers.push(element!(selector.as_str(), move |el| {
                if is_protected(el) {
                    tracing::debug!(%selector, tag = %el.tag_name(), "site rule skipped primary content");
                    return Ok(());
                }
                if inside_stripped_region(&regions) {
                    return Ok(());
                }
                stats.borrow_mut().stripped += 1;
                strip_keeping_primary(el, &regions)
            }));
        }

        if !chrome.is_empty() {
            // Descendants of a stripped element go too, except primary content, which
            // survives with its whole subtree.
            let regions = Rc::clone(&regions);
            handlers.push(element!("*", move |el| {
                if el.removed() || !inside_stripped_region(&regions) {
                    return Ok(());
                }
                if is_protected(el) {
                    enter_region(el, &regions, Region::Keep)
                } else if el.can_have_content() {
                    el.remove_and_keep_content();
                    Ok(())
                } else {
                    el.remove();
                    Ok(())
                }
            }));
        }

        for &(tag, attribute) in URL_ATTRIBUTES {
            handlers.push(element!(format!("{tag}[{attribute}]"), move |el| {
                self.rewrite_attribute(el, attribute, base, relay, stats);
                Ok(())
            }));
        }

        for &(tag, attribute) in SRCSET_ATTRIBUTES {
            handlers.push(element!(format!("{tag}[{attribute}]"), move |el| {
                self.rewrite_srcset(el, attribute, base, relay, stats);
                Ok(())
            }));
        }

        handlers.push(element!("a[target]", |el| {
            el.remove_attribute("target");
            Ok(())
        }));

        handlers.push(element!("form", move |el| {
            match forms::rewrite_form(el, base, &self.direct, relay, &self.forms) {
                Ok(FormOutcome::Relayed) => stats.borrow_mut().forms += 1,
                Ok(FormOutcome::Direct) => stats.borrow_mut().direct += 1,
                Ok(FormOutcome::Inert) => stats.borrow_mut().inert += 1,
                Err(err) => record_node_error(stats, &err),
            }
            Ok(())
        }));

        // Injection phase.
        handlers.push(element!("head", move |el| {
            if !head_seen.get() {
                el.prepend(preamble, ContentType::Html);
                head_seen.set(true);
            }
            Ok(())
        }));

        let text_regions = Rc::clone(&regions);
        let rewritten = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: handlers,
                document_content_handlers: vec![doc_text!(move |text| {
                    if inside_stripped_region(&text_regions) {
                        text.remove();
                    }
                    Ok(())
                })],
                ..RewriteStrSettings::default()
            },
        )
        .map_err(|err| RelayError::Rewrite(err.to_string()))?;

        let html = if head_seen.get() {
            rewritten
        } else {
            inject::insert_without_head(&rewritten, preamble)
        };

        let stats = *stats.borrow();
        Ok(RewriteOutput { html, stats })
    }

    fn rewrite_attribute(
        &self,
        el: &mut Element<'_, '_>,
        attribute: &str,
        base: &Url,
        relay: &RelayEndpoint,
        stats: &RefCell<RewriteStats>,
    ) {
        let Some(raw) = el.get_attribute(attribute) else {
            return;
        };

        let decision = match decide(&raw, base, &self.direct, relay) {
            Ok(decision) => decision,
            Err(err) => {
                record_node_error(stats, &err);
                return;
            }
        };

        let Some(rendered) = decision.render(relay) else {
            stats.borrow_mut().inert += 1;
            return;
        };

        match el.set_attribute(attribute, &rendered) {
            Ok(()) => {
                let mut stats = stats.borrow_mut();
                match decision {
                    RewriteDecision::ProxyRelay(_) => stats.relayed += 1,
                    RewriteDecision::DirectLoad(_) => stats.direct += 1,
                    RewriteDecision::Inert => stats.inert += 1,
                }
            }
            Err(err) => record_node_error(
                stats,
                &NodeError::Attribute {
                    attribute: attribute.to_string(),
                    reason: err.to_string(),
                },
            ),
        }
    }

    fn rewrite_srcset(
        &self,
        el: &mut Element<'_, '_>,
        attribute: &str,
        base: &Url,
        relay: &RelayEndpoint,
        stats: &RefCell<RewriteStats>,
    ) {
        let Some(raw) = el.get_attribute(attribute) else {
            return;
        };

        let mut changed = false;
        let candidates: Vec<String> = srcset_candidates(&raw)
            .into_iter()
            .map(|SrcsetCandidate { url, descriptor }| {
                let rendered = match decide(url, base, &self.direct, relay) {
                    Ok(decision) => decision.render(relay),
                    Err(err) => {
                        record_node_error(stats, &err);
                        None
                    }
                };
                let url = match rendered {
                    Some(rendered) => {
                        changed = true;
                        rendered
                    }
                    None => url.to_string(),
                };
                if descriptor.is_empty() {
                    url
                } else {
                    format!("{url} {descriptor}")
                }
            })
            .collect();

        if changed {
            if let Err(err) = el.set_attribute(attribute, &candidates.join(", ")) {
                tracing::debug!(%attribute, error = %err, "srcset rewrite rejected");
            }
        }
    }

    /// Drops CSP metas and points `refresh` redirects back through the relay.
    fn handle_http_equiv(
        &self,
        el: &mut Element<'_, '_>,
        base: &Url,
        relay: &RelayEndpoint,
        stats: &RefCell<RewriteStats>,
    ) {
        let equiv = el.get_attribute("http-equiv").unwrap_or_default();
        let equiv = equiv.trim();

        if equiv.eq_ignore_ascii_case("content-security-policy")
            || equiv.eq_ignore_ascii_case("content-security-policy-report-only")
        {
            el.remove();
            stats.borrow_mut().stripped += 1;
            return;
        }

        if !equiv.eq_ignore_ascii_case("refresh") {
            return;
        }
        let Some(content) = el.get_attribute("content") else {
            return;
        };
        let Some(idx) = content.to_ascii_lowercase().find("url=") else {
            return;
        };

        let (prefix, target) = content.split_at(idx + 4);
        let target = target.trim().trim_matches(|c| c == '\'' || c == '"');
        match decide(target, base, &self.direct, relay) {
            Ok(decision) => {
                if let Some(rendered) = decision.render(relay) {
                    if el.set_attribute("content", &format!("{prefix}{rendered}")).is_ok() {
                        stats.borrow_mut().relayed += 1;
                    }
                }
            }
            Err(err) => record_node_error(stats, &err),
        }
    }
}

fn is_protected(el: &Element<'_, '_>) -> bool {
    let tag = el.tag_name().to_ascii_lowercase();
    PROTECTED_TAGS.contains(&tag.as_str())
        || el
            .get_attribute("role")
            .map(|role| role.trim().eq_ignore_ascii_case("main"))
            .unwrap_or(false)
}

fn inside_stripped_region(regions: &Rc<RefCell<Vec<Region>>>) -> bool {
    regions.borrow().last() == Some(&Region::Strip)
}

/// Removes a site-rule match. Elements that may hold primary content lose only their own
/// tags and text, so a protected descendant can be kept; the rest are dropped whole.
fn strip_keeping_primary(el: &mut Element<'_, '_>, regions: &Rc<RefCell<Vec<Region>>>) -> HandlerResult {
    let tag = el.tag_name().to_ascii_lowercase();
    if !el.can_have_content() || OPTIONAL_END_TAGS.contains(&tag.as_str()) {
        el.remove();
        return Ok(());
    }
    el.remove_and_keep_content();
    enter_region(el, regions, Region::Strip)
}

/// Pushes `region` until the element's end tag.
fn enter_region(el: &mut Element<'_, '_>, regions: &Rc<RefCell<Vec<Region>>>, region: Region) -> HandlerResult {
    let tag = el.tag_name().to_ascii_lowercase();
    if !el.can_have_content() || OPTIONAL_END_TAGS.contains(&tag.as_str()) {
        return Ok(());
    }
    regions.borrow_mut().push(region);
    let regions = Rc::clone(regions);
    el.on_end_tag(end_tag!(move |_end| {
        regions.borrow_mut().pop();
        Ok(())
    }))
}

fn record_node_error(stats: &RefCell<RewriteStats>, err: &NodeError) {
    tracing::debug!(error = %err, "left attribute untouched");
    stats.borrow_mut().node_errors += 1;
}

/// Minimal attribute-value escaping for markup we generate ourselves.
pub(crate) fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteRuleConfig;

    fn engine() -> RewriteEngine {
        RewriteEngine::new(&RewriteConfig::default(), SiteRuleTable::default())
    }

    fn relay() -> RelayEndpoint {
        RelayEndpoint::new("http://localhost:8080/relay")
    }

    fn base() -> Url {
        Url::parse("https://example.com/page").expect("base")
    }

    #[test]
    fn anchors_are_relayed_and_lose_target() {
        let out = engine()
            .rewrite(
                r#"<html><head></head><body><a href="/x" target="_blank">x</a></body></html>"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(out
            .html
            .contains(r#"<a href="http://localhost:8080/relay?url=https%3A%2F%2Fexample.com%2Fx">"#));
        assert!(!out.html.contains("target="));
        assert_eq!(out.stats.relayed, 1);
    }

    #[test]
    fn strips_inherited_base_and_csp_meta() {
        let out = engine()
            .rewrite(
                r#"<html><head><base href="https://other.test/"><meta http-equiv="Content-Security-Policy" content="default-src 'none'"><meta http-equiv="content-type" content="text/html"></head></html>"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(!out.html.contains("other.test"));
        assert!(!out.html.contains("default-src 'none'"));
        assert!(out.html.contains(r#"<meta http-equiv="content-type""#));
        assert_eq!(out.stats.stripped, 2);
        assert!(out.html.contains(r#"<base href="https://example.com/page">"#));
    }

    #[test]
    fn injects_preamble_once_at_head_start() {
        let out = engine()
            .rewrite("<html><head><title>t</title></head></html>", &base(), &relay())
            .expect("rewrites");
        assert!(out.html.starts_with(
            "<html><head><base href=\"https://example.com/page\"><meta charset=\"utf-8\">"
        ));
        assert_eq!(out.html.matches("<base ").count(), 1);
        assert!(out.html.contains("<title>t</title>"));
    }

    #[test]
    fn documents_without_head_still_get_preamble() {
        let out = engine()
            .rewrite("<p>hello</p>", &base(), &relay())
            .expect("rewrites");
        assert!(out.html.starts_with("<head><base href=\"https://example.com/page\">"));
        assert!(out.html.ends_with("<p>hello</p>"));
    }

    #[test]
    fn malformed_attribute_is_left_and_rest_continues() {
        let out = engine()
            .rewrite(
                r#"<img src="http://[::1"><a href="/ok">ok</a>"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(out.html.contains(r#"<img src="http://[::1">"#));
        assert!(out.html.contains("relay?url=https%3A%2F%2Fexample.com%2Fok"));
        assert_eq!(out.stats.node_errors, 1);
    }

    #[test]
    fn srcset_candidates_are_rewritten() {
        let out = engine()
            .rewrite(
                r#"<img srcset="/a.png 1x, /b 2x, data:image/gif;base64,R0 3x">"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(out.html.contains(
            r#"srcset="https://example.com/a.png 1x, http://localhost:8080/relay?url=https%3A%2F%2Fexample.com%2Fb 2x, data:image/gif;base64,R0 3x""#
        ));
    }

    #[test]
    fn meta_refresh_target_is_relayed() {
        let out = engine()
            .rewrite(
                r#"<meta http-equiv="refresh" content="0; url=/next">"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(out
            .html
            .contains(r#"content="0; url=http://localhost:8080/relay?url=https%3A%2F%2Fexample.com%2Fnext""#));
    }

    #[test]
    fn site_rules_strip_chrome_but_never_main_content() {
        let sites = SiteRuleTable::from_config(&[SiteRuleConfig {
            host: "example.com".into(),
            remove_selectors: vec!["#nav".into(), ".ad".into()],
            query_overrides: Default::default(),
        }])
        .expect("table");
        let engine = RewriteEngine::new(&RewriteConfig::default(), sites);

        let out = engine
            .rewrite(
                r#"<body><div id="nav">menu</div><main class="ad"><p>story</p></main><div class="ad">buy</div></body>"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(!out.html.contains("menu"));
        assert!(!out.html.contains("buy"));
        assert!(out.html.contains("<p>story</p>"));
        assert_eq!(out.stats.stripped, 2);
    }

    #[test]
    fn stripped_wrapper_keeps_primary_content_inside_it() {
        let sites = SiteRuleTable::from_config(&[SiteRuleConfig {
            host: "example.com".into(),
            remove_selectors: vec![".ad".into(), ".promo".into()],
            query_overrides: Default::default(),
        }])
        .expect("table");
        let engine = RewriteEngine::new(&RewriteConfig::default(), sites);

        let out = engine
            .rewrite(
                r#"<body><div class="ad">sponsored<span>x</span><main><p>story</p><aside class="promo">deal</aside></main><img src="/px.gif"></div><p>after</p></body>"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(out.html.contains("<main><p>story</p></main>"), "{}", out.html);
        assert!(out.html.contains("<p>after</p>"));
        assert!(!out.html.contains("sponsored"));
        assert!(!out.html.contains("<span>"));
        assert!(!out.html.contains("deal"));
        assert!(!out.html.contains("px.gif"));
        assert!(!out.html.contains("class=\"ad\""));
        assert_eq!(out.stats.stripped, 2);

        let out = engine
            .rewrite(
                r#"<div class="ad"><section role="main">lead</section></div>"#,
                &base(),
                &relay(),
            )
            .expect("rewrites");
        assert!(out.html.contains(r#"<section role="main">lead</section>"#));
    }

    #[test]
    fn srcset_with_only_a_data_uri_is_untouched() {
        let html = r#"<img srcset="data:image/gif;base64,R0lGODlh">"#;
        let out = engine().rewrite(html, &base(), &relay()).expect("rewrites");
        assert!(out.html.contains(r#"<img srcset="data:image/gif;base64,R0lGODlh">"#), "{}", out.html);
        assert_eq!(out.stats.relayed, 0);
    }

    #[test]
    fn escape_attribute_covers_markup_metacharacters() {
        assert_eq!(escape_attribute(r#"a&b"<c>"#), "a&amp;b&quot;&lt;c&gt;");
    }
}
