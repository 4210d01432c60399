//! Evaluator for the JSON form of filter expressions.
//!
//! An expression is an array whose first element is the operator:
//! `["and", a, b, ...]`, `["or", a, b, ...]`, `["!", a]`, or a comparison
//! `[op, left, right]` with `op` one of `=`, `!=`, `<`, `<=`, `>`, `>=`,
//! `contains`, `match`. In a comparison a string operand is a dotted path into
//! the event and `{"value": v}` is a literal. Bare booleans evaluate to
//! themselves.

use std::cmp::Ordering;

use serde_json::Value;

pub(crate) fn evaluate(expr: &Value, event: &Value) -> bool {
    match expr {
        Value::Bool(b) => *b,
        Value::Array(items) => {
            let Some((op, args)) = items.split_first() else {
                return false;
            };
            match op.as_str() {
                Some("and") => !args.is_empty() && args.iter().all(|arg| evaluate(arg, event)),
                Some("or") => args.iter().any(|arg| evaluate(arg, event)),
                Some("!") => args.len() == 1 && !evaluate(&args[0], event),
                Some(op) => match args {
                    [left, right] => compare(op, &operand(left, event), &operand(right, event)),
                    _ => false,
                },
                None => false,
            }
        }
        _ => false,
    }
}

fn operand(value: &Value, event: &Value) -> Value {
    match value {
        Value::String(path) => lookup(event, path).cloned().unwrap_or(Value::Null),
        Value::Object(literal) => literal.get("value").cloned().unwrap_or(Value::Null),
        // A nested expression used as an operand.
        Value::Array(_) => Value::Bool(evaluate(value, event)),
        other => other.clone(),
    }
}

pub(crate) fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "=" => loosely_equal(left, right),
        "!=" => !loosely_equal(left, right),
        "<" => order(left, right) == Some(Ordering::Less),
        "<=" => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        ">" => order(left, right) == Some(Ordering::Greater),
        ">=" => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
        "contains" => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            _ => false,
        },
        "match" => match (left, right) {
            (Value::String(text), Value::String(pattern)) => glob(pattern, text),
            _ => false,
        },
        _ => false,
    }
}

/// Numbers compare by value regardless of integer/float encoding.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// `*` matches any run of characters, `?` exactly one.
pub(crate) fn glob(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Value {
        json!({
            "type": "track",
            "event": "Order Completed",
            "properties": { "total": 42, "tags": ["gift", "promo"], "coupon": "SPRING24" },
            "context": { "app": { "version": "2.1.0" } }
        })
    }

    fn eval(ir: Value) -> bool {
        evaluate(&ir, &event())
    }

    #[test]
    fn comparisons_resolve_paths_against_literals() {
        assert!(eval(json!(["=", "event", { "value": "Order Completed" }])));
        assert!(eval(json!(["!=", "type", { "value": "screen" }])));
        assert!(eval(json!([">=", "properties.total", { "value": 42.0 }])));
        assert!(eval(json!(["<", "properties.total", { "value": 100 }])));
        assert!(!eval(json!([">", "properties.total", { "value": 100 }])));
        assert!(eval(json!(["=", "properties.missing", { "value": null }])));
        assert!(!eval(json!(["<", "properties.coupon", { "value": 3 }])));
    }

    #[test]
    fn boolean_connectives() {
        assert!(eval(json!([
            "and",
            ["=", "type", { "value": "track" }],
            ["or", ["=", "event", { "value": "nope" }], ["contains", "properties.tags", { "value": "promo" }]]
        ])));
        assert!(eval(json!(["!", ["=", "type", { "value": "identify" }]])));
        assert!(!eval(json!(["and"])));
    }

    #[test]
    fn contains_and_match() {
        assert!(eval(json!(["contains", "event", { "value": "Order" }])));
        assert!(eval(json!(["match", "properties.coupon", { "value": "SPRING??" }])));
        assert!(eval(json!(["match", "context.app.version", { "value": "2.*" }])));
        assert!(!eval(json!(["match", "event", { "value": "Order" }])));
    }

    #[test]
    fn unknown_operators_never_match() {
        assert!(!eval(json!(["~=", "event", { "value": "Order Completed" }])));
        assert!(!eval(json!("event")));
        assert!(!eval(json!([])));
    }

    #[test]
    fn glob_backtracks() {
        assert!(glob("*Completed", "Order Completed"));
        assert!(glob("a*b*c", "aXbYbZc"));
        assert!(glob("*", ""));
        assert!(!glob("a*d", "abc"));
    }
}
