//! Prompt templates.
//!
//! Placeholders use `{{ path }}` syntax:
//! - `{{ input.field.sub }}`: a (dotted) field of the current record
//! - `{{ inputs }}`: the records of a reduce group as a JSON array
//! - `{{ reduce_key }}`: the group key of a reduce call
//!
//! Unknown placeholders render as empty text.

use df_core::record::{lookup_path, value_to_text, Record, Value};
use regex::Regex;
use std::sync::OnceLock;

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").ok())
        .as_ref()
}

/// Values a template can refer to.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bindings<'a> {
    pub input: Option<&'a Record>,
    pub inputs: Option<&'a [Record]>,
    pub reduce_key: Option<&'a Value>,
}

impl<'a> Bindings<'a> {
    pub fn record(input: &'a Record) -> Self {
        Self {
            input: Some(input),
            ..Default::default()
        }
    }

    pub fn group(key: &'a Value, inputs: &'a [Record]) -> Self {
        Self {
            input: None,
            inputs: Some(inputs),
            reduce_key: Some(key),
        }
    }
}

pub fn render(template: &str, bindings: &Bindings<'_>) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        resolve(&caps[1], bindings).unwrap_or_default()
    })
    .into_owned()
}

fn resolve(path: &str, b: &Bindings<'_>) -> Option<String> {
    if path == "inputs" {
        return b
            .inputs
            .map(|records| serde_json::to_string(records).unwrap_or_default());
    }
    if path == "reduce_key" {
        return b.reduce_key.map(value_to_text);
    }
    if path == "input" {
        return b
            .input
            .map(|r| serde_json::to_string(r).unwrap_or_default());
    }
    let rest = path.strip_prefix("input.")?;
    b.input.and_then(|r| lookup_path(r, rest)).map(value_to_text)
}

/// Placeholder paths referenced by a template, in order of appearance.
pub fn referenced_fields(template: &str) -> Vec<String> {
    placeholder()
        .map(|re| re.captures_iter(template).map(|c| c[1].to_string()).collect())
        .unwrap_or_default()
}
