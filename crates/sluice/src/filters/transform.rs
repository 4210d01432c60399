//! Transformer chain execution over an event's JSON form.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use super::fql::lookup;
use super::{SampleConfig, Transformer};

/// Apply `chain` in order. `None` as soon as a step leaves something that is
/// not an object.
pub(super) fn apply_chain(chain: &[Transformer], mut event: Value) -> Option<Value> {
    for transformer in chain {
        event = apply(transformer, event);
        if !event.is_object() {
            return None;
        }
    }
    Some(event)
}

fn apply(transformer: &Transformer, mut event: Value) -> Value {
    let config = transformer.config.as_ref();
    match transformer.kind.as_str() {
        "drop" => Value::Null,
        "drop_properties" => {
            if let Some(fields) = config.and_then(|config| config.drop.as_ref()) {
                edit_objects(&mut event, fields, |object, names| {
                    for name in names {
                        object.remove(name);
                    }
                });
            }
            event
        }
        "allow_properties" => {
            if let Some(fields) = config.and_then(|config| config.allow.as_ref()) {
                edit_objects(&mut event, fields, |object, names| {
                    object.retain(|key, _| names.contains(key));
                });
            }
            event
        }
        "sample" => match config.and_then(|config| config.sample.as_ref()) {
            Some(sample) if !sampled_in(sample, &event) => Value::Null,
            _ => event,
        },
        other => {
            debug!(transformer = %other, "unknown transformer, passing event through");
            event
        }
    }
}

fn edit_objects(
    event: &mut Value,
    fields: &BTreeMap<String, Vec<String>>,
    edit: impl Fn(&mut serde_json::Map<String, Value>, &[String]),
) {
    for (path, names) in fields {
        if let Some(Value::Object(object)) = lookup_mut(event, path) {
            edit(object, names);
        }
    }
}

fn lookup_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        _ => None,
    })
}

fn sampled_in(sample: &SampleConfig, event: &Value) -> bool {
    if sample.percent >= 1.0 {
        return true;
    }
    if sample.percent <= 0.0 {
        return false;
    }

    let key = match lookup(event, &sample.path) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    bucket(&key) < sample.percent
}

/// FNV-1a of `key`, scaled into `[0, 1)`.
fn bucket(key: &str) -> f64 {
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    });
    (hash >> 11) as f64 / (1u64 << 53) as f64
}
