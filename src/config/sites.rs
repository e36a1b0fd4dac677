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

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

use crate::proxy::hosts::host_matches_suffix;

use super::SiteRuleConfig;

/// Selectors that would take out primary content. Site rules are cosmetic filters only,
/// so the table refuses them outright.
const PROTECTED_SELECTORS: &[&str] = &[
    "html",
    "head",
    "body",
    "main",
    "*",
    "#main",
    "#content",
    "[role=main]",
    "[role=\"main\"]",
];

/// A validated row of the site table.
#[derive(Debug, Clone)]
pub struct SiteRule {
    pub host: String,
    pub remove_selectors: Vec<String>,
    pub query_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
/// Declarative per-host rules: which chrome to strip from documents and which query
/// parameters to force on target URLs. Adding a site is a config change only.
pub struct SiteRuleTable {
    rules: Vec<SiteRule>,
}

impl SiteRuleTable {
    /// Validates every selector (lol_html syntax, not protected) and normalizes hosts.
    pub fn from_config(rows: &[SiteRuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let host = row
                .host
                .trim()
                .trim_start_matches("*.")
                .to_ascii_lowercase();
            if host.is_empty() {
                bail!("site rule with empty host");
            }

            for selector in &row.remove_selectors {
                validate_selector(selector)
                    .with_context(|| format!("invalid remove selector for site {host}"))?;
            }

            rules.push(SiteRule {
                host,
                remove_selectors: row
                    .remove_selectors
                    .iter()
                    .map(|s| s.trim().to_string())
                    .collect(),
                query_overrides: row.query_overrides.clone(),
            });
        }

        Ok(Self { rules })
    }

    pub fn matching<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a SiteRule> + 'a {
        let host = host.trim_end_matches('.');
        self.rules
            .iter()
            .filter(move |rule| host_matches_suffix(&host.to_ascii_lowercase(), &rule.host))
    }

    /// Query parameters forced for `host`. Later rules win on key collisions.
    pub fn query_overrides(&self, host: &str) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for rule in self.matching(host) {
            for (key, value) in &rule.query_overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    pub fn remove_selectors(&self, host: &str) -> Vec<String> {
        self.matching(host)
            .flat_map(|rule| rule.remove_selectors.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn validate_selector(selector: &str) -> Result<()> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        bail!("empty selector");
    }
    let lowered = trimmed.to_ascii_lowercase();
    if PROTECTED_SELECTORS.contains(&lowered.as_str()) {
        bail!("selector `{trimmed}` targets a primary content container");
    }
    trimmed
        .parse::<lol_html::Selector>()
        .map_err(|err| anyhow::anyhow!("selector `{trimmed}` does not parse: {err}"))?;
    Ok(())
}
