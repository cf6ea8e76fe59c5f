use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("static regex")
    })
}

/// Fill `{{key}}` placeholders in an action's parameter template from collected data.
///
/// A string that is exactly one placeholder is replaced by the collected value
/// itself (keeping numbers and objects intact); placeholders embedded in longer
/// strings are substituted as text. Dotted keys fall back to a path lookup
/// (`caller.name` reads `data["caller"]["name"]`). Returns the rendered value and
/// the keys that had no data.
pub fn render_parameters(template: &Value, data: &HashMap<String, Value>) -> (Value, Vec<String>) {
    let mut missing = Vec::new();
    let rendered = render(template, data, &mut missing);
    missing.sort();
    missing.dedup();
    (rendered, missing)
}

fn render(value: &Value, data: &HashMap<String, Value>, missing: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => render_string(s, data, missing),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, data, missing)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, data, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, data: &HashMap<String, Value>, missing: &mut Vec<String>) -> Value {
    let re = placeholder();

    if let Some(caps) = re.captures(s) {
        if s.trim() == &caps[0] {
            let key = &caps[1];
            return match lookup(data, key) {
                Some(v) => v.clone(),
                None => {
                    missing.push(key.to_string());
                    Value::Null
                }
            };
        }
    } else {
        return Value::String(s.to_string());
    }

    let replaced = re.replace_all(s, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match lookup(data, key) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    Value::String(replaced.into_owned())
}

fn lookup<'a>(data: &'a HashMap<String, Value>, key: &str) -> Option<&'a Value> {
    if let Some(v) = data.get(key) {
        return Some(v);
    }
    let mut parts = key.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
