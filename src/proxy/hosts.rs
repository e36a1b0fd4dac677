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

/// Host allow/deny lists matched by domain suffix.
///
/// `example.com` matches `example.com` and any subdomain (`cdn.example.com`) but never
/// `badexample.com`. A leading `*.` or `.` in a pattern is accepted and ignored.
#[derive(Debug, Clone, Default)]
pub struct HostList {
    patterns: Vec<String>,
}

impl HostList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| normalize_pattern(pattern.as_ref()))
            .filter(|pattern| !pattern.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns
            .iter()
            .any(|suffix| host_matches_suffix(&host, suffix))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn normalize_pattern(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .to_ascii_lowercase()
}

pub fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    if host.len() <= suffix.len() {
        return false;
    }
    host.ends_with(suffix)
        && host
            .as_bytes()
            .get(host.len() - suffix.len() - 1)
            .map(|byte| *byte == b'.')
            .unwrap_or(false)
}
