//! Built-in operators.
//!
//! Structural (no LLM): `scan`, `uppercase`, `split`, `unnest`, `sample`,
//! `equijoin`, `rank`. LLM-backed: `map`, `filter`, `reduce`.

pub mod join;
pub mod semantic;
pub mod split;
pub mod structural;

use crate::registry::OperationRegistry;
use crate::{Operation, RegistryError};
use df_core::pipeline::OperationSpec;
use df_core::record::Value;
use std::sync::Arc;

macro_rules! register {
    ($registry:expr, $name:literal, $ty:ty) => {
        $registry.register($name, |spec: &OperationSpec| {
            Ok(Arc::new(<$ty>::new(spec)?) as Arc<dyn Operation>)
        });
    };
}

pub fn register_all(registry: &mut OperationRegistry) {
    register!(registry, "scan", structural::Scan);
    register!(registry, "uppercase", structural::Uppercase);
    register!(registry, "sample", structural::Sample);
    register!(registry, "rank", structural::Rank);
    register!(registry, "split", split::Split);
    register!(registry, "unnest", split::Unnest);
    register!(registry, "equijoin", join::Equijoin);
    register!(registry, "map", semantic::Map);
    register!(registry, "filter", semantic::Filter);
    register!(registry, "reduce", semantic::Reduce);
}

// ---------------------------------------------------------------------------
// Parameter validation
// ---------------------------------------------------------------------------

/// Collects every missing or malformed field before reporting, so one
/// `InvalidOperationConfig` names all of them.
pub(crate) struct Params<'a> {
    spec: &'a OperationSpec,
    missing: Vec<String>,
    invalid: Vec<String>,
}

impl<'a> Params<'a> {
    pub(crate) fn new(spec: &'a OperationSpec) -> Self {
        Self {
            spec,
            missing: Vec::new(),
            invalid: Vec::new(),
        }
    }

    pub(crate) fn required_str(&mut self, key: &str) -> String {
        match self.spec.param(key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(_) => {
                self.invalid.push(key.to_string());
                String::new()
            }
            None => {
                self.missing.push(key.to_string());
                String::new()
            }
        }
    }

    pub(crate) fn optional_str(&mut self, key: &str) -> Option<String> {
        match self.spec.param(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                self.invalid.push(key.to_string());
                None
            }
        }
    }

    pub(crate) fn required_u64(&mut self, key: &str) -> u64 {
        match self.spec.param(key) {
            Some(v) => v.as_u64().unwrap_or_else(|| {
                self.invalid.push(key.to_string());
                0
            }),
            None => {
                self.missing.push(key.to_string());
                0
            }
        }
    }

    pub(crate) fn optional_u64(&mut self, key: &str) -> Option<u64> {
        match self.spec.param(key) {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = v.as_u64();
                if n.is_none() {
                    self.invalid.push(key.to_string());
                }
                n
            }
        }
    }

    pub(crate) fn optional_bool(&mut self, key: &str) -> Option<bool> {
        match self.spec.param(key) {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                self.invalid.push(key.to_string());
                None
            }
        }
    }

    /// A string or list of strings.
    pub(crate) fn required_str_list(&mut self, key: &str) -> Vec<String> {
        match self.spec.param(key) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) if !items.is_empty() => {
                let keys: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if keys.len() != items.len() {
                    self.invalid.push(key.to_string());
                }
                keys
            }
            Some(_) => {
                self.invalid.push(key.to_string());
                Vec::new()
            }
            None => {
                self.missing.push(key.to_string());
                Vec::new()
            }
        }
    }

    pub(crate) fn reject(&mut self, key: &str) {
        self.invalid.push(key.to_string());
    }

    pub(crate) fn finish(self) -> Result<(), RegistryError> {
        if !self.missing.is_empty() {
            let mut fields = self.missing;
            fields.extend(self.invalid);
            return Err(RegistryError::invalid(self.spec, fields, "missing required parameters"));
        }
        if !self.invalid.is_empty() {
            return Err(RegistryError::invalid(self.spec, self.invalid, "malformed parameters"));
        }
        Ok(())
    }
}
