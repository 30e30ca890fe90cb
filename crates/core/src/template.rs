use crate::context::ExpressionContext;
use crate::expr::{self, Evaluated};
use serde_json::{Map, Value};

/// Walk a config value, evaluating `{{…}}` templates in leaf strings.
///
/// A string that is exactly one template returns the evaluated value
/// with its type preserved; mixed strings get each match stringified in
/// place. Evaluation failures inside a mixed string are logged and the
/// fragment is left as written; they never abort the walk.
pub fn process_dynamic_value(v: &Value, ctx: &ExpressionContext) -> Evaluated {
    match v {
        Value::String(s) => process_string(s, ctx),
        Value::Array(items) => {
            let out = items
                .iter()
                .map(|item| {
                    process_dynamic_value(item, ctx)
                        .into_value()
                        .unwrap_or(Value::Null)
                })
                .collect();
            Evaluated::Value(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, item) in map {
                out.insert(
                    k.clone(),
                    process_dynamic_value(item, ctx)
                        .into_value()
                        .unwrap_or(Value::Null),
                );
            }
            Evaluated::Value(Value::Object(out))
        }
        other => Evaluated::Value(other.clone()),
    }
}

fn process_string(s: &str, ctx: &ExpressionContext) -> Evaluated {
    let matches = find_templates(s);
    if matches.is_empty() {
        return Evaluated::Value(Value::String(s.to_string()));
    }

    // Sole full-string template: return the raw evaluated value.
    if matches.len() == 1 {
        let (start, end, inner) = &matches[0];
        if *start == 0 && *end == s.len() {
            return match expr::evaluate(inner, ctx) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(expression = %inner, error = %e, "template evaluation failed");
                    Evaluated::Undefined
                }
            };
        }
    }

    let mut out = String::new();
    let mut cursor = 0;
    for (start, end, inner) in &matches {
        out.push_str(&s[cursor..*start]);
        match expr::evaluate(inner, ctx) {
            Ok(v) => out.push_str(&v.to_display_string()),
            Err(e) => {
                tracing::warn!(expression = %inner, error = %e, "template evaluation failed");
                out.push_str(&s[*start..*end]);
            }
        }
        cursor = *end;
    }
    out.push_str(&s[cursor..]);
    Evaluated::Value(Value::String(out))
}

/// Find `{{…}}` occurrences; returns (start, end, inner) byte offsets
/// spanning the braces. Templates do not nest.
fn find_templates(s: &str) -> Vec<(usize, usize, String)> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(open) = s[cursor..].find("{{") {
        let open = cursor + open;
        match s[open + 2..].find("}}") {
            Some(close) => {
                let close = open + 2 + close;
                found.push((open, close + 2, s[open + 2..close].trim().to_string()));
                cursor = close + 2;
            }
            None => break,
        }
    }
    found
}
