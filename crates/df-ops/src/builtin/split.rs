//! Fan-out operators: `split` chunks a text field, `unnest` expands a list field.

use super::Params;
use crate::{OpContext, Operation, OperationError, OperationInput, RegistryError};
use async_trait::async_trait;
use df_core::pipeline::OperationSpec;
use df_core::record::{value_to_text, Record, Value};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// split
// ---------------------------------------------------------------------------

/// Splits `split_key` into character chunks of `chunk_size` with `overlap`.
///
/// Each chunk becomes a copy of its record carrying `<split_key>_chunk`,
/// `<name>_chunk_num` (1-based) and `<name>_id`, a content-derived id shared
/// by all chunks of the same record.
#[derive(Debug)]
pub struct Split {
    spec: OperationSpec,
    split_key: String,
    chunk_size: usize,
    overlap: usize,
}

impl Split {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let split_key = p.required_str("split_key");
        let chunk_size = p.required_u64("chunk_size") as usize;
        let overlap = p.optional_u64("overlap").unwrap_or(0) as usize;
        p.finish()?;
        if chunk_size == 0 {
            return Err(RegistryError::invalid(spec, vec!["chunk_size".into()], "chunk_size must be positive"));
        }
        if overlap >= chunk_size {
            return Err(RegistryError::invalid(
                spec,
                vec!["overlap".into()],
                "overlap must be smaller than chunk_size",
            ));
        }
        Ok(Self {
            spec: spec.clone(),
            split_key,
            chunk_size,
            overlap,
        })
    }

    fn chunks(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return vec![String::new()];
        }
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end >= chars.len() {
                break;
            }
            start = end - self.overlap;
        }
        chunks
    }
}

fn record_id(record: &Record) -> String {
    let bytes = serde_json::to_vec(record).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}

#[async_trait]
impl Operation for Split {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let chunk_field = format!("{}_chunk", self.split_key);
        let num_field = format!("{}_chunk_num", self.spec.name);
        let id_field = format!("{}_id", self.spec.name);

        let mut out = Vec::new();
        for (index, record) in input.into_records().into_iter().enumerate() {
            let text = match record.get(&self.split_key) {
                Some(v) => value_to_text(v),
                None => {
                    return Err(OperationError::ExecutionFailed(format!(
                        "record {index} has no field '{}'",
                        self.split_key
                    )))
                }
            };
            let id = record_id(&record);
            for (n, chunk) in self.chunks(&text).into_iter().enumerate() {
                let mut piece = record.clone();
                piece.insert(chunk_field.clone(), Value::String(chunk));
                piece.insert(num_field.clone(), Value::from(n as u64 + 1));
                piece.insert(id_field.clone(), Value::String(id.clone()));
                out.push(piece);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// unnest
// ---------------------------------------------------------------------------

/// Emits one record per element of the list at `unnest_key`.
///
/// With `expand: true`, object elements are merged into the record instead of
/// replacing the key. Records with an empty list are dropped unless
/// `keep_empty` is set (the key becomes null).
#[derive(Debug)]
pub struct Unnest {
    spec: OperationSpec,
    unnest_key: String,
    expand: bool,
    keep_empty: bool,
}

impl Unnest {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let unnest_key = p.required_str("unnest_key");
        let expand = p.optional_bool("expand").unwrap_or(false);
        let keep_empty = p.optional_bool("keep_empty").unwrap_or(false);
        p.finish()?;
        Ok(Self {
            spec: spec.clone(),
            unnest_key,
            expand,
            keep_empty,
        })
    }
}

#[async_trait]
impl Operation for Unnest {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let mut out = Vec::new();
        for (index, record) in input.into_records().into_iter().enumerate() {
            let items = match record.get(&self.unnest_key) {
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    return Err(OperationError::ExecutionFailed(format!(
                        "record {index}: field '{}' is not a list",
                        self.unnest_key
                    )))
                }
                None => Vec::new(),
            };
            if items.is_empty() {
                if self.keep_empty {
                    let mut kept = record;
                    kept.insert(self.unnest_key.clone(), Value::Null);
                    out.push(kept);
                }
                continue;
            }
            for item in items {
                let mut row = record.clone();
                match item {
                    Value::Object(fields) if self.expand => {
                        row.remove(&self.unnest_key);
                        row.extend(fields);
                    }
                    other => {
                        row.insert(self.unnest_key.clone(), other);
                    }
                }
                out.push(row);
            }
        }
        Ok(out)
    }
}
