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

use lol_html::html_content::{ContentType, Element};
use url::Url;

use crate::{
    config::FormConfig,
    proxy::{
        endpoint::{RelayEndpoint, FORM_ACTION_FIELD, FORM_METHOD_FIELD},
        flow::RelayMethod,
    },
    utils::NodeError,
};

use super::{
    decision::{decide, DirectLoadRules, RewriteDecision},
    escape_attribute,
};

/// What happened to one `<form>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormOutcome {
    Relayed,
    Direct,
    Inert,
}

/// Turns a form into a relay form: the browser posts every field plus the true action and
/// method to the relay endpoint, and the resolver reassembles the upstream request.
///
/// A missing or empty action means "submit to this document", so it resolves to the base.
pub fn rewrite_form(
    el: &mut Element<'_, '_>,
    base: &Url,
    rules: &DirectLoadRules,
    relay: &RelayEndpoint,
    cfg: &FormConfig,
) -> Result<FormOutcome, NodeError> {
    let action = el
        .get_attribute("action")
        .filter(|action| !action.trim().is_empty())
        .unwrap_or_else(|| base.to_string());
    let method = RelayMethod::from_form_value(&el.get_attribute("method").unwrap_or_default());

    let absolute = match decide(&action, base, rules, relay)? {
        RewriteDecision::Inert => return Ok(FormOutcome::Inert),
        RewriteDecision::DirectLoad(url) => {
            set(el, "action", url.as_str())?;
            return Ok(FormOutcome::Direct);
        }
        RewriteDecision::ProxyRelay(url) => url,
    };

    set(el, "action", relay.as_str())?;
    set(el, "method", "post")?;
    // The relay parses urlencoded bodies only.
    el.remove_attribute("enctype");

    if cfg.clear_target {
        el.remove_attribute("target");
    }
    if cfg.clear_onsubmit {
        el.remove_attribute("onsubmit");
    }

    el.append(&hidden_fields(&absolute, method), ContentType::Html);
    Ok(FormOutcome::Relayed)
}

fn hidden_fields(action: &Url, method: RelayMethod) -> String {
    format!(
        "<input type=\"hidden\" name=\"{FORM_ACTION_FIELD}\" value=\"{}\">\
         <input type=\"hidden\" name=\"{FORM_METHOD_FIELD}\" value=\"{}\">",
        escape_attribute(action.as_str()),
        method.as_form_value()
    )
}

fn set(el: &mut Element<'_, '_>, attribute: &str, value: &str) -> Result<(), NodeError> {
    el.set_attribute(attribute, value)
        .map_err(|err| NodeError::Attribute {
            attribute: attribute.to_string(),
            reason: err.to_string(),
        })
}
