// file: src/seed/template.rs
// version: 1.0.0
// guid: 0a7c3e95-6d21-4b8f-a4e3-5c9b1f2d7e60

//! Closed-set `{{ name }}` substitution
//!
//! Only names in [`DECLARED`] may appear in a template. A declared name with
//! no value, or an empty value, fails the render.

use crate::error::ProvisionError;
use crate::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Every variable a seed template may reference
pub const DECLARED: &[&str] = &[
    "hostname",
    "node_name",
    "description",
    "coordinates",
    "locale",
    "timezone",
    "instance_id",
    "created_at",
    "created_by",
    "media_label",
    "discovery_endpoint",
    "owner_fingerprint",
    "community_fingerprint",
    "node_fingerprint",
    "node_public_key",
    "tls_ca_cert_b64",
    "tls_node_cert_b64",
    "tls_node_key_b64",
    "agent_config_b64",
    "interface_name",
    "ip_suffix",
    "mesh_address",
    "mgmt_vlan_id",
    "mgmt_address",
    "gateway",
    "nameservers",
];

/// Values bound to declared variables
pub type Values = BTreeMap<&'static str, String>;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]*)\s*\}\}").unwrap_or_else(|e| unreachable!("{}", e))
    })
}

/// Variable names referenced by `text`, in order of first appearance
pub fn referenced(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Substitute every placeholder in `text` or fail naming the first problem
pub fn render(template_name: &str, text: &str, values: &Values) -> Result<String> {
    let mut out = String::with_capacity(text.len() + 1024);
    let mut last = 0;

    for caps in placeholder().captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        if !DECLARED.contains(&name) {
            return Err(ProvisionError::render(format!(
                "{}: unknown placeholder {:?}",
                template_name, name
            )));
        }
        let value = values
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ProvisionError::render(format!("{}: variable {} is unset", template_name, name))
            })?;
        push_literal(&mut out, template_name, text, last, whole.start())?;
        out.push_str(value);
        last = whole.end();
    }
    push_literal(&mut out, template_name, text, last, text.len())?;
    Ok(out)
}

fn push_literal(out: &mut String, template_name: &str, text: &str, from: usize, to: usize) -> Result<()> {
    let literal = &text[from..to];
    if let Some(pos) = literal.find("{{") {
        let line = text[..from + pos].lines().count().max(1);
        return Err(ProvisionError::render(format!(
            "{}: malformed placeholder near line {}",
            template_name, line
        )));
    }
    out.push_str(literal);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&'static str, &str)]) -> Values {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_substitutes_with_spacing() {
        let out = render(
            "t",
            "host: {{hostname}}\nzone: {{ timezone }}\n",
            &values(&[("hostname", "node-01"), ("timezone", "UTC")]),
        )
        .unwrap();
        assert_eq!(out, "host: node-01\nzone: UTC\n");
    }

    #[test]
    fn test_unset_variable_fails() {
        let err = render("t", "host: {{ hostname }}", &Values::new()).unwrap_err();
        assert!(err.to_string().contains("hostname is unset"));
        assert_eq!(err.code(), "RENDER_FAILURE");
    }

    #[test]
    fn test_empty_value_counts_as_unset() {
        let err = render("t", "{{ locale }}", &values(&[("locale", "")])).unwrap_err();
        assert!(err.to_string().contains("locale is unset"));
    }

    #[test]
    fn test_unknown_placeholder_fails() {
        let err = render("t", "{{ password }}", &values(&[("hostname", "x")])).unwrap_err();
        assert!(err.to_string().contains("unknown placeholder"));
    }

    #[test]
    fn test_malformed_placeholder_fails() {
        let err = render("t", "a\nb: {{ hostname", &values(&[("hostname", "x")])).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let out = render("t", "d: {{ description }}", &values(&[("description", "\"{{ x }}\"")]))
            .unwrap();
        assert_eq!(out, "d: \"{{ x }}\"");
    }

    #[test]
    fn test_referenced_names() {
        assert_eq!(
            referenced("{{ a_b }} {{c}} {{ a_b }}"),
            vec!["a_b".to_string(), "c".to_string()]
        );
    }
}
