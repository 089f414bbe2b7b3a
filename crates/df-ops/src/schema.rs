//! Output schemas for LLM-backed operations.
//!
//! Declared as `output: { schema: { field: type } }` where type is one of
//! `string`, `integer`, `number`, `boolean`, `object`, `any` or `list[T]`
//! (short forms `str`, `int`, `float`, `bool`, `dict`, `list` accepted).

use crate::{OperationError, RegistryError};
use df_core::pipeline::OperationSpec;
use df_core::record::{Record, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Any,
    List(Box<FieldType>),
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(inner) = s.strip_prefix("list[").and_then(|r| r.strip_suffix(']')) {
            return Some(FieldType::List(Box::new(FieldType::parse(inner)?)));
        }
        Some(match s.as_str() {
            "str" | "string" | "text" => FieldType::String,
            "int" | "integer" => FieldType::Integer,
            "float" | "number" => FieldType::Number,
            "bool" | "boolean" => FieldType::Boolean,
            "dict" | "object" => FieldType::Object,
            "list" => FieldType::List(Box::new(FieldType::Any)),
            "any" => FieldType::Any,
            _ => return None,
        })
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::List(inner), Value::Array(items)) => items.iter().all(|v| inner.matches(v)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub fields: Vec<(String, FieldType)>,
}

impl OutputSchema {
    /// Read `output.schema` from an operation's parameters.
    pub fn from_spec(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let schema = spec
            .param("output")
            .and_then(|o| o.get("schema"))
            .and_then(|s| s.as_object())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                RegistryError::invalid(spec, vec!["output.schema".into()], "missing or empty output schema")
            })?;

        let mut fields = Vec::with_capacity(schema.len());
        let mut bad = Vec::new();
        for (name, ty) in schema {
            match ty.as_str().and_then(FieldType::parse) {
                Some(t) => fields.push((name.clone(), t)),
                None => bad.push(format!("output.schema.{name}")),
            }
        }
        if !bad.is_empty() {
            return Err(RegistryError::invalid(spec, bad, "unsupported field type"));
        }
        Ok(Self { fields })
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Parse a model response into the declared fields, rejecting missing or
    /// mistyped values. Undeclared keys are dropped.
    pub fn parse_response(&self, text: &str) -> Result<Record, OperationError> {
        let object = extract_json_object(text).ok_or_else(|| {
            OperationError::Validation(format!("response is not a JSON object: {}", preview(text)))
        })?;

        let mut out = Record::new();
        let mut problems = Vec::new();
        for (name, ty) in &self.fields {
            match object.get(name) {
                Some(v) if ty.matches(v) => {
                    out.insert(name.clone(), v.clone());
                }
                Some(_) => problems.push(format!("{name} has wrong type")),
                None => problems.push(format!("{name} missing")),
            }
        }
        if !problems.is_empty() {
            return Err(OperationError::Validation(problems.join("; ")));
        }
        Ok(out)
    }

    /// Instruction appended to prompts describing the expected JSON.
    pub fn instruction(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(n, t)| format!("\"{n}\": {}", type_label(t)))
            .collect();
        format!("Respond with a JSON object of the form {{{}}}.", fields.join(", "))
    }
}

fn type_label(t: &FieldType) -> String {
    match t {
        FieldType::String => "string".into(),
        FieldType::Integer => "integer".into(),
        FieldType::Number => "number".into(),
        FieldType::Boolean => "boolean".into(),
        FieldType::Object => "object".into(),
        FieldType::Any => "any".into(),
        FieldType::List(inner) => format!("list[{}]", type_label(inner)),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

/// Find the JSON object in a response, tolerating code fences and prose.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
