// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The quirks engine (C9, SPEC_FULL.md §4.7): three JSON rule arrays
//! (kernel, adapter, device) matched against property dictionaries,
//! grounded on `quirks.c`'s `do_match`.
//!
//! A rule is a flat JSON object. Keys not in [`ACTION_KEYS`] are match
//! conditions: a `null` value means "property absent", a string
//! starting with `~` is a POSIX extended regex tested against the
//! property's value, any other string is an exact match. A rule
//! matches only if every one of its match conditions holds. Keys in
//! [`ACTION_KEYS`] are not conditions — they are the quirk applied when
//! the rule matches.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::Value;

use crate::error::Error;

pub const ACTION_KEYS: &[&str] = &["no-features", "force_profile", "force_codec"];

pub type PropertyMap = HashMap<String, String>;
pub type Rule = serde_json::Map<String, Value>;

/// The accumulated effect of every matching rule across all three
/// layers, in kernel → adapter → device order (device rules are
/// evaluated last and win on conflicting `force_*` keys).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AppliedQuirks {
    pub no_features: HashSet<String>,
    pub force_profile: Option<String>,
    pub force_codec: Option<String>,
}

fn parse_rules(text: &str) -> Result<Vec<Rule>, Error> {
    Ok(serde_json::from_str(text)?)
}

fn rule_matches(rule: &Rule, props: &PropertyMap) -> Result<bool, Error> {
    for (key, value) in rule {
        if ACTION_KEYS.contains(&key.as_str()) {
            continue;
        }
        let matched = match value {
            Value::Null => !props.contains_key(key),
            Value::String(pattern) => {
                if let Some(regex_src) = pattern.strip_prefix('~') {
                    let re = Regex::new(regex_src)?;
                    props.get(key).is_some_and(|actual| re.is_match(actual))
                } else {
                    props.get(key).is_some_and(|actual| actual == pattern)
                }
            }
            _ => return Err(Error::Quirks(format!("rule key {key} has non-string, non-null condition value"))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_matching(rules: &[Rule], props: &PropertyMap, applied: &mut AppliedQuirks) -> Result<(), Error> {
    for rule in rules {
        if !rule_matches(rule, props)? {
            continue;
        }
        if let Some(Value::Array(items)) = rule.get("no-features") {
            applied.no_features.extend(items.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
        if let Some(Value::String(p)) = rule.get("force_profile") {
            applied.force_profile = Some(p.clone());
        }
        if let Some(Value::String(c)) = rule.get("force_codec") {
            applied.force_codec = Some(c.clone());
        }
    }
    Ok(())
}

/// Holds the three parsed rule arrays and evaluates them against a
/// device's kernel/adapter/device property dictionaries.
pub struct QuirksEngine {
    kernel: Vec<Rule>,
    adapter: Vec<Rule>,
    device: Vec<Rule>,
}

impl QuirksEngine {
    pub fn empty() -> Self {
        Self { kernel: Vec::new(), adapter: Vec::new(), device: Vec::new() }
    }

    pub fn from_json(kernel_json: &str, adapter_json: &str, device_json: &str) -> Result<Self, Error> {
        Ok(Self {
            kernel: parse_rules(kernel_json)?,
            adapter: parse_rules(adapter_json)?,
            device: parse_rules(device_json)?,
        })
    }

    pub fn evaluate(
        &self,
        kernel_props: &PropertyMap,
        adapter_props: &PropertyMap,
        device_props: &PropertyMap,
    ) -> Result<AppliedQuirks, Error> {
        let mut applied = AppliedQuirks::default();
        apply_matching(&self.kernel, kernel_props, &mut applied)?;
        apply_matching(&self.adapter, adapter_props, &mut applied)?;
        apply_matching(&self.device, device_props, &mut applied)?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn exact_match_applies_no_features() {
        let json = r#"[{"name": "Bad Headset", "no-features": ["sbc-xq"]}]"#;
        let engine = QuirksEngine::from_json("[]", "[]", json).unwrap();
        let applied = engine.evaluate(&props(&[]), &props(&[]), &props(&[("name", "Bad Headset")])).unwrap();
        assert!(applied.no_features.contains("sbc-xq"));
    }

    #[test]
    fn regex_prefix_matches_as_pattern() {
        let json = r#"[{"address": "~^AA:BB:.*", "force_profile": "a2dp"}]"#;
        let engine = QuirksEngine::from_json("[]", "[]", json).unwrap();
        let matched = engine.evaluate(&props(&[]), &props(&[]), &props(&[("address", "AA:BB:CC:DD:EE:FF")])).unwrap();
        assert_eq!(matched.force_profile.as_deref(), Some("a2dp"));

        let unmatched = engine.evaluate(&props(&[]), &props(&[]), &props(&[("address", "11:22:33:44:55:66")])).unwrap();
        assert!(unmatched.force_profile.is_none());
    }

    #[test]
    fn null_condition_requires_property_absence() {
        let json = r#"[{"vendor_id": null, "force_codec": "msbc"}]"#;
        let engine = QuirksEngine::from_json("[]", "[]", json).unwrap();
        let matched = engine.evaluate(&props(&[]), &props(&[]), &props(&[])).unwrap();
        assert_eq!(matched.force_codec.as_deref(), Some("msbc"));

        let unmatched = engine.evaluate(&props(&[]), &props(&[]), &props(&[("vendor_id", "0x1234")])).unwrap();
        assert!(unmatched.force_codec.is_none());
    }

    #[test]
    fn device_layer_overrides_kernel_layer_on_conflicting_force() {
        let kernel = r#"[{"name": "~.*", "force_profile": "hsp"}]"#;
        let device = r#"[{"name": "Special", "force_profile": "a2dp"}]"#;
        let engine = QuirksEngine::from_json(kernel, "[]", device).unwrap();
        let applied = engine.evaluate(&props(&[("name", "Special")]), &props(&[]), &props(&[("name", "Special")])).unwrap();
        assert_eq!(applied.force_profile.as_deref(), Some("a2dp"));
    }

    #[test]
    fn malformed_rule_json_reports_quirks_error() {
        let err = QuirksEngine::from_json("not json", "[]", "[]").unwrap_err();
        assert!(matches!(err, Error::Quirks(_)));
    }
}
