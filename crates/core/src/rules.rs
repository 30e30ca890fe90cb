use crate::context::ExpressionContext;
use crate::expr::Evaluated;
use crate::template::process_dynamic_value;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved body key: when a rule (or a stream transformer) leaves an
/// array under this key, the result stands for multiple SSE events
/// rather than one object.
pub const MULTI_EVENTS_KEY: &str = "__multi_events";

/// Declarative modification rules for one value domain (body, headers,
/// or query parameters). Values may contain `{{…}}` templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModificationRules {
    pub add: Option<Map<String, Value>>,
    pub replace: Option<Map<String, Value>>,
    #[serde(rename = "default")]
    pub default_values: Option<Map<String, Value>>,
    pub remove: Option<Vec<String>>,
}

impl ModificationRules {
    pub fn is_empty(&self) -> bool {
        self.add.is_none()
            && self.replace.is_none()
            && self.default_values.is_none()
            && self.remove.is_none()
    }

    fn protects(&self, key: &str) -> bool {
        self.add.as_ref().is_some_and(|m| m.contains_key(key))
            || self.replace.as_ref().is_some_and(|m| m.contains_key(key))
    }
}

/// The rule sets a route or upstream declares.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSet {
    pub headers: Option<ModificationRules>,
    pub body: Option<ModificationRules>,
    pub query: Option<ModificationRules>,
}

// ─── Body rules ────────────────────────────────────────────────────────────

/// Apply body rules in the fixed order add → replace → default → remove.
/// Keys are dot-separated paths into the JSON body.
pub fn apply_body_rules(body: &mut Value, rules: &ModificationRules, ctx: &ExpressionContext) {
    if let Some(add) = &rules.add {
        for (path, template) in add {
            match process_dynamic_value(template, ctx) {
                Evaluated::Undefined => {}
                Evaluated::Value(v) => {
                    set_nested(body, path, v, false);
                }
            }
        }
    }

    if let Some(replace) = &rules.replace {
        for (path, template) in replace {
            let added = rules.add.as_ref().is_some_and(|m| m.contains_key(path));
            if !added && get_nested(body, path).is_none() {
                continue;
            }
            if let Evaluated::Value(v) = process_dynamic_value(template, ctx) {
                set_nested(body, path, v, false);
            }
        }
    }

    if let Some(defaults) = &rules.default_values {
        for (path, template) in defaults {
            if get_nested(body, path).is_some() {
                continue;
            }
            if let Evaluated::Value(v) = process_dynamic_value(template, ctx) {
                set_nested(body, path, v, true);
            }
        }
    }

    if let Some(remove) = &rules.remove {
        for path in remove {
            if rules.protects(path) {
                continue;
            }
            remove_nested(body, path);
        }
    }
}

/// Pull the reserved multi-event array out of a rule result, if present.
pub fn take_multi_events(body: &mut Value) -> Option<Vec<Value>> {
    let obj = body.as_object_mut()?;
    match obj.remove(MULTI_EVENTS_KEY) {
        Some(Value::Array(events)) => Some(events),
        Some(other) => {
            // non-array values under the reserved key are put back untouched
            obj.insert(MULTI_EVENTS_KEY.to_string(), other);
            None
        }
        None => None,
    }
}

/// Set a value at a dot-separated path, creating intermediate objects.
fn set_nested(root: &mut Value, path: &str, value: Value, only_if_missing: bool) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = current.as_object_mut() {
                if only_if_missing && obj.contains_key(*part) {
                    return false;
                }
                obj.insert(part.to_string(), value);
                return true;
            }
            return false;
        }
        if !current.is_object() {
            return false;
        }
        let obj = current.as_object_mut().unwrap();
        if !obj.contains_key(*part) {
            obj.insert(part.to_string(), Value::Object(Map::new()));
        }
        current = obj.get_mut(*part).unwrap();
    }
    false
}

fn get_nested<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn remove_nested(root: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = current.as_object_mut() {
                obj.remove(*part);
            }
        } else {
            match current.as_object_mut().and_then(|obj| obj.get_mut(*part)) {
                Some(next) => current = next,
                None => return,
            }
        }
    }
}

// ─── Header rules ──────────────────────────────────────────────────────────

/// Apply header rules to an ordered, lowercased-key header list. The
/// dispatch path runs remove → replace → add → default so removals can
/// never erase a value the same rule set installs.
pub fn apply_header_rules(
    headers: &mut Vec<(String, String)>,
    rules: &ModificationRules,
    ctx: &ExpressionContext,
) {
    if let Some(remove) = &rules.remove {
        for name in remove {
            if rules.protects(name) {
                continue;
            }
            let lower = name.to_lowercase();
            headers.retain(|(k, _)| *k != lower);
        }
    }

    if let Some(replace) = &rules.replace {
        for (name, template) in replace {
            let lower = name.to_lowercase();
            let added = rules.add.as_ref().is_some_and(|m| m.contains_key(name));
            if !added && !headers.iter().any(|(k, _)| *k == lower) {
                continue;
            }
            if let Some(v) = eval_to_header(template, ctx) {
                set_header(headers, &lower, v);
            }
        }
    }

    if let Some(add) = &rules.add {
        for (name, template) in add {
            if let Some(v) = eval_to_header(template, ctx) {
                set_header(headers, &name.to_lowercase(), v);
            }
        }
    }

    if let Some(defaults) = &rules.default_values {
        for (name, template) in defaults {
            let lower = name.to_lowercase();
            if headers.iter().any(|(k, _)| *k == lower) {
                continue;
            }
            if let Some(v) = eval_to_header(template, ctx) {
                headers.push((lower, v));
            }
        }
    }
}

fn eval_to_header(template: &Value, ctx: &ExpressionContext) -> Option<String> {
    match process_dynamic_value(template, ctx) {
        Evaluated::Undefined => None,
        v => Some(v.to_display_string()),
    }
}

fn set_header(headers: &mut Vec<(String, String)>, lower: &str, value: String) {
    headers.retain(|(k, _)| k != lower);
    headers.push((lower.to_string(), value));
}

// ─── Query rules ───────────────────────────────────────────────────────────

/// Apply query rules to an ordered parameter list that preserves
/// duplicate keys. Same phase order as headers.
pub fn apply_query_rules(
    params: &mut Vec<(String, String)>,
    rules: &ModificationRules,
    ctx: &ExpressionContext,
) {
    if let Some(remove) = &rules.remove {
        for name in remove {
            if rules.protects(name) {
                continue;
            }
            params.retain(|(k, _)| k != name);
        }
    }

    if let Some(replace) = &rules.replace {
        for (name, template) in replace {
            let added = rules.add.as_ref().is_some_and(|m| m.contains_key(name));
            if !added && !params.iter().any(|(k, _)| k == name) {
                continue;
            }
            if let Some(v) = eval_to_header(template, ctx) {
                params.retain(|(k, _)| k != name);
                params.push((name.clone(), v));
            }
        }
    }

    if let Some(add) = &rules.add {
        for (name, template) in add {
            if let Some(v) = eval_to_header(template, ctx) {
                params.retain(|(k, _)| k != name);
                params.push((name.clone(), v));
            }
        }
    }

    if let Some(defaults) = &rules.default_values {
        for (name, template) in defaults {
            if params.iter().any(|(k, _)| k == name) {
                continue;
            }
            if let Some(v) = eval_to_header(template, ctx) {
                params.push((name.clone(), v));
            }
        }
    }
}

// ─── Rule merging ──────────────────────────────────────────────────────────

/// Merge two rule records: objects deep-merge with `override` winning,
/// arrays union with value-equality dedup.
pub fn deep_merge_rules(base: &ModificationRules, overlay: &ModificationRules) -> ModificationRules {
    ModificationRules {
        add: merge_maps(&base.add, &overlay.add),
        replace: merge_maps(&base.replace, &overlay.replace),
        default_values: merge_maps(&base.default_values, &overlay.default_values),
        remove: merge_lists(&base.remove, &overlay.remove),
    }
}

pub fn deep_merge_rule_sets(base: &RuleSet, overlay: &RuleSet) -> RuleSet {
    RuleSet {
        headers: merge_opt_rules(&base.headers, &overlay.headers),
        body: merge_opt_rules(&base.body, &overlay.body),
        query: merge_opt_rules(&base.query, &overlay.query),
    }
}

fn merge_opt_rules(
    base: &Option<ModificationRules>,
    overlay: &Option<ModificationRules>,
) -> Option<ModificationRules> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(deep_merge_rules(b, o)),
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (None, None) => None,
    }
}

fn merge_maps(
    base: &Option<Map<String, Value>>,
    overlay: &Option<Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (base, overlay) {
        (Some(b), Some(o)) => {
            let mut merged = b.clone();
            for (k, v) in o {
                match (merged.get_mut(k), v) {
                    (Some(Value::Object(bo)), Value::Object(oo)) => {
                        let mut combined = bo.clone();
                        deep_merge_objects(&mut combined, oo);
                        merged.insert(k.clone(), Value::Object(combined));
                    }
                    _ => {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            Some(merged)
        }
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (None, None) => None,
    }
}

fn deep_merge_objects(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (k, v) in overlay {
        match (base.get_mut(k), v) {
            (Some(Value::Object(bo)), Value::Object(oo)) => {
                let mut combined = bo.clone();
                deep_merge_objects(&mut combined, oo);
                base.insert(k.clone(), Value::Object(combined));
            }
            (Some(Value::Array(ba)), Value::Array(oa)) => {
                let mut combined = ba.clone();
                for item in oa {
                    if !combined.contains(item) {
                        combined.push(item.clone());
                    }
                }
                base.insert(k.clone(), Value::Array(combined));
            }
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

fn merge_lists(base: &Option<Vec<String>>, overlay: &Option<Vec<String>>) -> Option<Vec<String>> {
    match (base, overlay) {
        (Some(b), Some(o)) => {
            let mut merged = b.clone();
            for item in o {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Some(merged)
        }
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExpressionContext {
        let mut ctx = ExpressionContext::default();
        ctx.body = json!({"model": "gpt-4o"});
        ctx
    }

    fn rules(raw: Value) -> ModificationRules {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn add_sets_unconditionally() {
        let mut body = json!({"temperature": 0.5});
        apply_body_rules(
            &mut body,
            &rules(json!({"add": {"temperature": 1.0, "model": "{{body.model}}"}})),
            &ctx(),
        );
        assert_eq!(body["temperature"], json!(1.0));
        assert_eq!(body["model"], json!("gpt-4o"));
    }

    #[test]
    fn add_skips_undefined_results() {
        let mut body = json!({});
        apply_body_rules(
            &mut body,
            &rules(json!({"add": {"missing": "{{body.nothing}}"}})),
            &ctx(),
        );
        assert!(body.as_object().unwrap().is_empty());
    }

    #[test]
    fn replace_only_existing_or_added() {
        let mut body = json!({"present": 1});
        apply_body_rules(
            &mut body,
            &rules(json!({
                "add": {"added": "x"},
                "replace": {"present": 2, "added": "y", "absent": 3}
            })),
            &ctx(),
        );
        assert_eq!(body["present"], json!(2));
        assert_eq!(body["added"], json!("y"));
        assert!(body.get("absent").is_none());
    }

    #[test]
    fn default_only_when_missing() {
        let mut body = json!({"present": 1});
        apply_body_rules(
            &mut body,
            &rules(json!({"default": {"present": 9, "absent": 9}})),
            &ctx(),
        );
        assert_eq!(body["present"], json!(1));
        assert_eq!(body["absent"], json!(9));
    }

    #[test]
    fn remove_spares_same_rule_additions() {
        let mut body = json!({"drop": 1, "keep": 2});
        apply_body_rules(
            &mut body,
            &rules(json!({
                "add": {"keep": 3},
                "remove": ["drop", "keep"]
            })),
            &ctx(),
        );
        assert!(body.get("drop").is_none());
        assert_eq!(body["keep"], json!(3));
    }

    #[test]
    fn fixed_phase_order() {
        // add installs, replace overwrites, default is a no-op on the now
        // present key, remove is blocked by the add.
        let mut body = json!({});
        apply_body_rules(
            &mut body,
            &rules(json!({
                "add": {"k": "a"},
                "replace": {"k": "b"},
                "default": {"k": "c"},
                "remove": ["k"]
            })),
            &ctx(),
        );
        assert_eq!(body["k"], json!("b"));
    }

    #[test]
    fn nested_paths() {
        let mut body = json!({});
        apply_body_rules(
            &mut body,
            &rules(json!({"add": {"generationConfig.thinkingConfig.budget": 1024}})),
            &ctx(),
        );
        assert_eq!(body["generationConfig"]["thinkingConfig"]["budget"], json!(1024));

        apply_body_rules(
            &mut body,
            &rules(json!({"remove": ["generationConfig.thinkingConfig.budget"]})),
            &ctx(),
        );
        assert!(body["generationConfig"]["thinkingConfig"].get("budget").is_none());
    }

    #[test]
    fn multi_events_escape() {
        let mut body = json!({"__multi_events": [{"a": 1}, {"b": 2}], "ignored": true});
        let events = take_multi_events(&mut body).unwrap();
        assert_eq!(events, vec![json!({"a": 1}), json!({"b": 2})]);

        let mut body = json!({"__multi_events": "not-an-array"});
        assert!(take_multi_events(&mut body).is_none());
        assert_eq!(body["__multi_events"], json!("not-an-array"));
    }

    #[test]
    fn header_rules_case_insensitive() {
        let mut headers = vec![
            ("authorization".to_string(), "Bearer x".to_string()),
            ("x-keep".to_string(), "1".to_string()),
        ];
        apply_header_rules(
            &mut headers,
            &rules(json!({
                "remove": ["Authorization"],
                "add": {"X-Request-Id": "{{body.model}}"}
            })),
            &ctx(),
        );
        assert!(!headers.iter().any(|(k, _)| k == "authorization"));
        assert!(headers.iter().any(|(k, v)| k == "x-request-id" && v == "gpt-4o"));
        assert!(headers.iter().any(|(k, _)| k == "x-keep"));
    }

    #[test]
    fn query_rules_preserve_duplicates() {
        let mut params = vec![
            ("tag".to_string(), "a".to_string()),
            ("tag".to_string(), "b".to_string()),
            ("drop".to_string(), "x".to_string()),
        ];
        apply_query_rules(
            &mut params,
            &rules(json!({"remove": ["drop"], "default": {"page": "1"}})),
            &ctx(),
        );
        assert_eq!(params.iter().filter(|(k, _)| k == "tag").count(), 2);
        assert!(!params.iter().any(|(k, _)| k == "drop"));
        assert!(params.iter().any(|(k, v)| k == "page" && v == "1"));
    }

    #[test]
    fn merge_overrides_and_unions() {
        let base = rules(json!({
            "add": {"a": 1, "nested": {"x": 1}},
            "remove": ["r1"]
        }));
        let overlay = rules(json!({
            "add": {"a": 2, "nested": {"y": 2}},
            "remove": ["r1", "r2"]
        }));
        let merged = deep_merge_rules(&base, &overlay);
        let add = merged.add.unwrap();
        assert_eq!(add["a"], json!(2));
        assert_eq!(add["nested"], json!({"x": 1, "y": 2}));
        assert_eq!(merged.remove.unwrap(), vec!["r1", "r2"]);
    }
}
