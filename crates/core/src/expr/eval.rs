use super::builtins;
use super::parser::{BinaryOp, Expr, UnaryOp};
use crate::context::ExpressionContext;
use serde_json::{Map, Number, Value};

/// An evaluation result. `Undefined` is distinct from JSON null so the
/// rule engine can skip fields whose expression resolved to nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Undefined,
    Value(Value),
}

impl Evaluated {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Evaluated::Undefined => None,
            Evaluated::Value(v) => Some(v),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Evaluated::Undefined => false,
            Evaluated::Value(v) => match v {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
                Value::String(s) => !s.is_empty(),
                Value::Array(_) | Value::Object(_) => true,
            },
        }
    }

    /// Stringification used for template interpolation: strings are
    /// unquoted, structures are JSON, `undefined` mirrors JS.
    pub fn to_display_string(&self) -> String {
        match self {
            Evaluated::Undefined => "undefined".to_string(),
            Evaluated::Value(v) => match v {
                Value::Null => "null".to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

impl From<Value> for Evaluated {
    fn from(v: Value) -> Self {
        Evaluated::Value(v)
    }
}

pub fn eval(expr: &Expr, ctx: &ExpressionContext) -> Result<Evaluated, String> {
    match expr {
        Expr::Null => Ok(Value::Null.into()),
        Expr::Undefined => Ok(Evaluated::Undefined),
        Expr::Bool(b) => Ok(Value::Bool(*b).into()),
        Expr::Number(n) => Ok(number(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone()).into()),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                // undefined elements become null, as in JSON.stringify
                out.push(eval(item, ctx)?.into_value().unwrap_or(Value::Null));
            }
            Ok(Value::Array(out).into())
        }
        Expr::Object(fields) => {
            let mut out = Map::new();
            for (key, field) in fields {
                if let Some(v) = eval(field, ctx)?.into_value() {
                    out.insert(key.clone(), v);
                }
            }
            Ok(Value::Object(out).into())
        }
        Expr::Ident(name) => Ok(resolve_ident(name, ctx)),
        Expr::Member { object, property } => {
            let base = eval(object, ctx)?;
            access(&base, &Value::String(property.clone()), describe(object))
        }
        Expr::Index { object, index } => {
            let base = eval(object, ctx)?;
            let idx = eval(index, ctx)?
                .into_value()
                .ok_or_else(|| "index expression evaluated to undefined".to_string())?;
            access(&base, &idx, describe(object))
        }
        Expr::Unary { op, operand } => {
            let v = eval(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.is_truthy()).into()),
                UnaryOp::Neg => match as_number(&v) {
                    Some(n) => Ok(number(-n)),
                    None => Ok(Value::Null.into()),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
        Expr::Ternary { cond, then, otherwise } => {
            if eval(cond, ctx)?.is_truthy() {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Call { callee, args } => {
            let name = callee_name(callee)?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, ctx)?);
            }
            builtins::call(&name, &evaluated, ctx)
        }
    }
}

/// Builtin namespaces usable only as call targets (`Math.floor(x)`).
const NAMESPACES: [&str; 3] = ["Math", "Date", "JSON"];

fn callee_name(callee: &Expr) -> Result<String, String> {
    match callee {
        Expr::Ident(name) => Ok(name.clone()),
        Expr::Member { object, property } => match object.as_ref() {
            Expr::Ident(ns) if NAMESPACES.contains(&ns.as_str()) => Ok(format!("{ns}.{property}")),
            _ => Err(format!("'{property}' is not a function")),
        },
        _ => Err("expression is not callable".to_string()),
    }
}

fn resolve_ident(name: &str, ctx: &ExpressionContext) -> Evaluated {
    match name {
        "headers" => ctx.headers.clone().into(),
        "body" => ctx.body.clone().into(),
        "url" => ctx.url_value().into(),
        "method" => Value::String(ctx.method.clone()).into(),
        "env" => ctx.env.clone().into(),
        "stream" => match ctx.stream_value() {
            Some(v) => v.into(),
            None => Evaluated::Undefined,
        },
        "NaN" => Value::Null.into(),
        _ => Evaluated::Undefined,
    }
}

fn access(base: &Evaluated, key: &Value, base_desc: String) -> Result<Evaluated, String> {
    let container = match base {
        Evaluated::Undefined => {
            return Err(format!("cannot read property of undefined ({base_desc})"));
        }
        Evaluated::Value(Value::Null) => {
            return Err(format!("cannot read property of null ({base_desc})"));
        }
        Evaluated::Value(v) => v,
    };

    let found = match (container, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned(),
        (Value::Array(items), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| items.get(f as usize).cloned()),
        (Value::Array(items), Value::String(k)) if k == "length" => {
            Some(Value::from(items.len() as u64))
        }
        (Value::String(s), Value::String(k)) if k == "length" => {
            Some(Value::from(s.chars().count() as u64))
        }
        (Value::String(s), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| s.chars().nth(f as usize))
            .map(|c| Value::String(c.to_string())),
        _ => None,
    };

    Ok(found.map(Evaluated::Value).unwrap_or(Evaluated::Undefined))
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member { property, .. } => property.clone(),
        Expr::Index { .. } => "index expression".to_string(),
        _ => "expression".to_string(),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &ExpressionContext,
) -> Result<Evaluated, String> {
    // short-circuit forms return an operand, not a boolean
    match op {
        BinaryOp::And => {
            let l = eval(left, ctx)?;
            return if l.is_truthy() { eval(right, ctx) } else { Ok(l) };
        }
        BinaryOp::Or => {
            let l = eval(left, ctx)?;
            return if l.is_truthy() { Ok(l) } else { eval(right, ctx) };
        }
        _ => {}
    }

    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;

    let result = match op {
        BinaryOp::Add => {
            if is_string(&l) || is_string(&r) {
                Value::String(format!("{}{}", l.to_display_string(), r.to_display_string())).into()
            } else {
                numeric(&l, &r, |a, b| a + b)
            }
        }
        BinaryOp::Sub => numeric(&l, &r, |a, b| a - b),
        BinaryOp::Mul => numeric(&l, &r, |a, b| a * b),
        BinaryOp::Div => numeric(&l, &r, |a, b| a / b),
        BinaryOp::Rem => numeric(&l, &r, |a, b| a % b),
        BinaryOp::Eq => Value::Bool(loosely_equal(&l, &r)).into(),
        BinaryOp::NotEq => Value::Bool(!loosely_equal(&l, &r)).into(),
        BinaryOp::Lt => compare(&l, &r, |o| o == std::cmp::Ordering::Less),
        BinaryOp::Le => compare(&l, &r, |o| o != std::cmp::Ordering::Greater),
        BinaryOp::Gt => compare(&l, &r, |o| o == std::cmp::Ordering::Greater),
        BinaryOp::Ge => compare(&l, &r, |o| o != std::cmp::Ordering::Less),
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    };
    Ok(result)
}

fn is_string(v: &Evaluated) -> bool {
    matches!(v, Evaluated::Value(Value::String(_)))
}

pub(super) fn as_number(v: &Evaluated) -> Option<f64> {
    match v {
        Evaluated::Undefined => None,
        Evaluated::Value(Value::Number(n)) => n.as_f64(),
        Evaluated::Value(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        Evaluated::Value(Value::Null) => Some(0.0),
        Evaluated::Value(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Build a JSON number, collapsing NaN/infinity to null (JSON cannot
/// represent them) and preserving integer representation where exact.
pub(super) fn number(n: f64) -> Evaluated {
    if !n.is_finite() {
        return Value::Null.into();
    }
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::Number(Number::from(n as i64)).into()
    } else {
        Number::from_f64(n)
            .map(|num| Value::Number(num).into())
            .unwrap_or(Evaluated::Value(Value::Null))
    }
}

fn numeric(l: &Evaluated, r: &Evaluated, f: impl Fn(f64, f64) -> f64) -> Evaluated {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => number(f(a, b)),
        _ => Value::Null.into(),
    }
}

fn compare(l: &Evaluated, r: &Evaluated, pred: impl Fn(std::cmp::Ordering) -> bool) -> Evaluated {
    let ordering = match (l, r) {
        (Evaluated::Value(Value::String(a)), Evaluated::Value(Value::String(b))) => {
            Some(a.cmp(b))
        }
        _ => match (as_number(l), as_number(r)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    match ordering {
        Some(o) => Value::Bool(pred(o)).into(),
        None => Value::Bool(false).into(),
    }
}

fn loosely_equal(l: &Evaluated, r: &Evaluated) -> bool {
    match (l, r) {
        (Evaluated::Undefined, Evaluated::Undefined) => true,
        (Evaluated::Undefined, Evaluated::Value(Value::Null)) => true,
        (Evaluated::Value(Value::Null), Evaluated::Undefined) => true,
        (Evaluated::Value(a), Evaluated::Value(b)) => match (a, b) {
            (Value::Number(_), _) | (_, Value::Number(_)) => {
                match (as_number(l), as_number(r)) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            _ => a == b,
        },
        _ => false,
    }
}
