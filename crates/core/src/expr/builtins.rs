use super::eval::{Evaluated, as_number, number};
use crate::context::ExpressionContext;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use sha2::Digest;

/// Dispatch a call into the fixed builtin table. Unknown names fail;
/// there is deliberately no way to reach anything outside this table.
pub fn call(
    name: &str,
    args: &[Evaluated],
    _ctx: &ExpressionContext,
) -> Result<Evaluated, String> {
    match name {
        "uuid" => Ok(Value::String(uuid::Uuid::new_v4().to_string()).into()),
        "now" | "Date.now" => Ok(number(chrono::Utc::now().timestamp_millis() as f64)),
        "randomInt" => {
            let min = req_num(args, 0, name)?;
            let max = req_num(args, 1, name)?;
            if max <= min {
                return Ok(number(min.floor()));
            }
            let n = min + rand::random::<f64>() * (max - min);
            Ok(number(n.floor()))
        }
        "base64encode" => Ok(Value::String(STANDARD.encode(req_str(args, 0, name)?)).into()),
        "base64decode" => {
            let decoded = STANDARD
                .decode(req_str(args, 0, name)?)
                .map_err(|e| format!("base64decode: {e}"))?;
            Ok(Value::String(String::from_utf8_lossy(&decoded).into_owned()).into())
        }
        "md5" => {
            let digest = md5::compute(req_str(args, 0, name)?.as_bytes());
            Ok(Value::String(format!("{digest:x}")).into())
        }
        "sha256" => {
            let digest = sha2::Sha256::digest(req_str(args, 0, name)?.as_bytes());
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            Ok(Value::String(hex).into())
        }
        "parseJWT" => parse_jwt(&req_str(args, 0, name)?),
        "jsonParse" | "JSON.parse" => {
            let parsed: Value = serde_json::from_str(&req_str(args, 0, name)?)
                .map_err(|e| format!("jsonParse: {e}"))?;
            Ok(parsed.into())
        }
        "jsonStringify" | "JSON.stringify" => {
            let v = req_val(args, 0, name)?;
            Ok(Value::String(serde_json::to_string(&v).map_err(|e| e.to_string())?).into())
        }
        "first" => Ok(seq_end(args, name, true)?),
        "last" => Ok(seq_end(args, name, false)?),
        "length" => match req_val(args, 0, name)? {
            Value::Array(items) => Ok(number(items.len() as f64)),
            Value::String(s) => Ok(number(s.chars().count() as f64)),
            Value::Object(map) => Ok(number(map.len() as f64)),
            _ => Ok(Evaluated::Undefined),
        },
        "keys" => match req_val(args, 0, name)? {
            Value::Object(map) => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )
            .into()),
            _ => Ok(Value::Array(Vec::new()).into()),
        },
        "values" => match req_val(args, 0, name)? {
            Value::Object(map) => Ok(Value::Array(map.values().cloned().collect()).into()),
            _ => Ok(Value::Array(Vec::new()).into()),
        },
        "trim" => Ok(Value::String(req_str(args, 0, name)?.trim().to_string()).into()),
        "toLowerCase" => Ok(Value::String(req_str(args, 0, name)?.to_lowercase()).into()),
        "toUpperCase" => Ok(Value::String(req_str(args, 0, name)?.to_uppercase()).into()),
        "split" => {
            let s = req_str(args, 0, name)?;
            let sep = req_str(args, 1, name)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(sep.as_str())
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts).into())
        }
        "replace" => {
            let s = req_str(args, 0, name)?;
            let from = req_str(args, 1, name)?;
            let to = req_str(args, 2, name)?;
            Ok(Value::String(s.replacen(from.as_str(), to.as_str(), 1)).into())
        }
        "isString" => Ok(Value::Bool(matches!(args.first(), Some(Evaluated::Value(Value::String(_))))).into()),
        "isNumber" => Ok(Value::Bool(matches!(args.first(), Some(Evaluated::Value(Value::Number(_))))).into()),
        "isArray" => Ok(Value::Bool(matches!(args.first(), Some(Evaluated::Value(Value::Array(_))))).into()),
        "isObject" => Ok(Value::Bool(matches!(args.first(), Some(Evaluated::Value(Value::Object(_))))).into()),
        "isDefined" => Ok(Value::Bool(!matches!(
            args.first(),
            None | Some(Evaluated::Undefined)
        ))
        .into()),
        "deepClean" => Ok(deep_clean(req_val(args, 0, name)?).into()),
        "parseInt" => {
            let s = match args.first() {
                Some(Evaluated::Value(Value::Number(_))) => {
                    return Ok(number(req_num(args, 0, name)?.trunc()));
                }
                _ => req_str(args, 0, name)?,
            };
            let trimmed = s.trim();
            let digits: String = trimmed
                .chars()
                .enumerate()
                .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
                .map(|(_, c)| c)
                .collect();
            match digits.parse::<f64>() {
                Ok(n) => Ok(number(n)),
                Err(_) => Ok(Value::Null.into()),
            }
        }
        "parseFloat" => match req_str(args, 0, name)?.trim().parse::<f64>() {
            Ok(n) => Ok(number(n)),
            Err(_) => Ok(Value::Null.into()),
        },
        "isNaN" => Ok(Value::Bool(args.first().and_then(|v| as_number(v)).is_none()).into()),
        "isFinite" => Ok(Value::Bool(
            args.first()
                .and_then(|v| as_number(v))
                .is_some_and(|n| n.is_finite()),
        )
        .into()),
        "encodeURIComponent" => {
            Ok(Value::String(urlencoding::encode(&req_str(args, 0, name)?).into_owned()).into())
        }
        "decodeURIComponent" => {
            let s = req_str(args, 0, name)?;
            let decoded = urlencoding::decode(&s)
                .map_err(|e| format!("decodeURIComponent: {e}"))?;
            Ok(Value::String(decoded.into_owned()).into())
        }
        "Math.floor" => Ok(number(req_num(args, 0, name)?.floor())),
        "Math.ceil" => Ok(number(req_num(args, 0, name)?.ceil())),
        "Math.round" => Ok(number(req_num(args, 0, name)?.round())),
        "Math.abs" => Ok(number(req_num(args, 0, name)?.abs())),
        "Math.min" => fold_nums(args, name, f64::min),
        "Math.max" => fold_nums(args, name, f64::max),
        "Math.random" => Ok(number(rand::random::<f64>())),
        other => Err(format!("unknown function '{other}'")),
    }
}

fn req_val(args: &[Evaluated], idx: usize, name: &str) -> Result<Value, String> {
    match args.get(idx) {
        Some(Evaluated::Value(v)) => Ok(v.clone()),
        Some(Evaluated::Undefined) | None => {
            Err(format!("{name}: argument {n} is missing", n = idx + 1))
        }
    }
}

fn req_str(args: &[Evaluated], idx: usize, name: &str) -> Result<String, String> {
    match req_val(args, idx, name)? {
        Value::String(s) => Ok(s),
        other => Ok(Evaluated::Value(other).to_display_string()),
    }
}

fn req_num(args: &[Evaluated], idx: usize, name: &str) -> Result<f64, String> {
    args.get(idx)
        .and_then(as_number)
        .ok_or_else(|| format!("{name}: argument {n} is not a number", n = idx + 1))
}

fn fold_nums(
    args: &[Evaluated],
    name: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Evaluated, String> {
    let mut acc = req_num(args, 0, name)?;
    for i in 1..args.len() {
        acc = f(acc, req_num(args, i, name)?);
    }
    Ok(number(acc))
}

fn seq_end(args: &[Evaluated], name: &str, first: bool) -> Result<Evaluated, String> {
    match req_val(args, 0, name)? {
        Value::Array(items) => Ok(match if first { items.first() } else { items.last() } {
            Some(v) => v.clone().into(),
            None => Evaluated::Undefined,
        }),
        Value::String(s) => {
            let c = if first { s.chars().next() } else { s.chars().last() };
            Ok(match c {
                Some(c) => Value::String(c.to_string()).into(),
                None => Evaluated::Undefined,
            })
        }
        _ => Ok(Evaluated::Undefined),
    }
}

/// Decode a JWT without verifying it and return the payload claims.
fn parse_jwt(token: &str) -> Result<Evaluated, String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| "parseJWT: token has no payload segment".to_string())?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| format!("parseJWT: {e}"))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|e| format!("parseJWT: {e}"))?;
    Ok(claims.into())
}

/// Recursively strip null entries from objects and arrays.
fn deep_clean(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if !v.is_null() {
                    out.insert(k, deep_clean(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(deep_clean)
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(val: Value) -> Evaluated {
        Evaluated::Value(val)
    }

    fn ctx() -> ExpressionContext {
        ExpressionContext::default()
    }

    #[test]
    fn hashing() {
        let out = call("md5", &[v(json!("hello"))], &ctx()).unwrap();
        assert_eq!(out, v(json!("5d41402abc4b2a76b9719d911017c592")));
        let out = call("sha256", &[v(json!("hello"))], &ctx()).unwrap();
        assert_eq!(
            out,
            v(json!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"))
        );
    }

    #[test]
    fn parse_jwt_payload() {
        // header {"alg":"none"}, payload {"sub":"u1","admin":true}
        let token = format!(
            "{}.{}.",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(r#"{"sub":"u1","admin":true}"#),
        );
        let out = call("parseJWT", &[v(json!(token))], &ctx()).unwrap();
        assert_eq!(out, v(json!({"sub": "u1", "admin": true})));
    }

    #[test]
    fn deep_clean_strips_nulls() {
        let out = call(
            "deepClean",
            &[v(json!({"a": null, "b": {"c": null, "d": 1}, "e": [1, null, 2]}))],
            &ctx(),
        )
        .unwrap();
        assert_eq!(out, v(json!({"b": {"d": 1}, "e": [1, 2]})));
    }

    #[test]
    fn random_int_in_range() {
        for _ in 0..50 {
            let out = call("randomInt", &[v(json!(3)), v(json!(7))], &ctx()).unwrap();
            let n = match out {
                Evaluated::Value(Value::Number(n)) => n.as_i64().unwrap(),
                other => panic!("unexpected {other:?}"),
            };
            assert!((3..7).contains(&n), "{n}");
        }
    }

    #[test]
    fn parse_int_prefix() {
        assert_eq!(
            call("parseInt", &[v(json!("42px"))], &ctx()).unwrap(),
            v(json!(42))
        );
        assert_eq!(
            call("parseInt", &[v(json!("abc"))], &ctx()).unwrap(),
            v(json!(null))
        );
    }

    #[test]
    fn uri_component_round_trip() {
        let out = call("encodeURIComponent", &[v(json!("a b/c"))], &ctx()).unwrap();
        assert_eq!(out, v(json!("a%20b%2Fc")));
        let back = call("decodeURIComponent", &[v(json!("a%20b%2Fc"))], &ctx()).unwrap();
        assert_eq!(back, v(json!("a b/c")));
    }

    #[test]
    fn unknown_function_fails() {
        assert!(call("fetch", &[], &ctx()).is_err());
    }
}
