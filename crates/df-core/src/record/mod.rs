//! Records: schema-less rows flowing between pipeline nodes.
//!
//! A record is a mapping from field name to a tagged-union value
//! (`serde_json::Value`: null, bool, number, string, list, nested map).

pub use serde_json::Value;

/// One row of a dataset.
pub type Record = serde_json::Map<String, Value>;

/// Convert a JSON value into a list of records.
///
/// Accepts an array of objects or a single object. Non-object array
/// elements are wrapped as `{"value": ...}`.
pub fn records_from_value(value: Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items.into_iter().map(into_record).collect(),
        Value::Object(map) => vec![map],
        Value::Null => Vec::new(),
        other => vec![into_record(other)],
    }
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => {
            let mut rec = Record::new();
            rec.insert("value".into(), other);
            rec
        }
    }
}

/// Render a value for interpolation into text (strings unquoted).
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Look up a dotted path (`a.b.c`) inside a record.
pub fn lookup_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = record.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
