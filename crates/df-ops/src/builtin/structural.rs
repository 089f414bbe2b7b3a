//! Record-shaping operators that never call a model.

use super::Params;
use crate::{OpContext, Operation, OperationError, OperationInput, RegistryError};
use async_trait::async_trait;
use df_core::pipeline::OperationSpec;
use df_core::record::{lookup_path, Record, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

// ---------------------------------------------------------------------------
// scan
// ---------------------------------------------------------------------------

/// Source operator: emits its dataset's records (optionally the first `limit`).
#[derive(Debug)]
pub struct Scan {
    spec: OperationSpec,
    dataset: String,
    limit: Option<usize>,
}

impl Scan {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let dataset = p.required_str("dataset");
        let limit = p.optional_u64("limit").map(|n| n as usize);
        p.finish()?;
        Ok(Self {
            spec: spec.clone(),
            dataset,
            limit,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

#[async_trait]
impl Operation for Scan {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let mut records = input.into_records();
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// uppercase
// ---------------------------------------------------------------------------

/// Upper-cases one string field, or every top-level string field.
#[derive(Debug)]
pub struct Uppercase {
    spec: OperationSpec,
    field: Option<String>,
}

impl Uppercase {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let field = p.optional_str("field");
        p.finish()?;
        Ok(Self {
            spec: spec.clone(),
            field,
        })
    }
}

#[async_trait]
impl Operation for Uppercase {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let mut records = input.into_records();
        for record in &mut records {
            match &self.field {
                Some(field) => {
                    if let Some(Value::String(s)) = record.get_mut(field) {
                        *s = s.to_uppercase();
                    }
                }
                None => {
                    for value in record.values_mut() {
                        if let Value::String(s) = value {
                            *s = s.to_uppercase();
                        }
                    }
                }
            }
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// sample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleMethod {
    First,
    Random,
}

/// Keeps `samples` records: a prefix, or a seeded pseudo-random subset kept
/// in input order. The seed is part of the config and therefore of the
/// cache key.
#[derive(Debug)]
pub struct Sample {
    spec: OperationSpec,
    samples: usize,
    method: SampleMethod,
    seed: u64,
}

impl Sample {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let samples = p.required_u64("samples") as usize;
        let method = match p.optional_str("method").as_deref() {
            None | Some("first") => SampleMethod::First,
            Some("random") => SampleMethod::Random,
            Some(_) => {
                p.reject("method");
                SampleMethod::First
            }
        };
        let seed = p.optional_u64("seed").unwrap_or(0);
        p.finish()?;
        Ok(Self {
            spec: spec.clone(),
            samples,
            method,
            seed,
        })
    }

    fn score(&self, index: usize) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update((index as u64).to_le_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

#[async_trait]
impl Operation for Sample {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let mut records = input.into_records();
        if records.len() <= self.samples {
            return Ok(records);
        }
        match self.method {
            SampleMethod::First => {
                records.truncate(self.samples);
                Ok(records)
            }
            SampleMethod::Random => {
                let mut order: Vec<(usize, [u8; 32])> =
                    (0..records.len()).map(|i| (i, self.score(i))).collect();
                order.sort_by(|a, b| a.1.cmp(&b.1));
                let mut keep: Vec<usize> = order.into_iter().take(self.samples).map(|(i, _)| i).collect();
                keep.sort_unstable();
                let mut keep = keep.into_iter().peekable();
                Ok(records
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, r)| {
                        if keep.peek() == Some(&i) {
                            keep.next();
                            Some(r)
                        } else {
                            None
                        }
                    })
                    .collect())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// rank
// ---------------------------------------------------------------------------

/// Stable sort by a (dotted) field; records lacking it go last. Adds `_rank`
/// (1-based).
#[derive(Debug)]
pub struct Rank {
    spec: OperationSpec,
    rank_key: String,
    descending: bool,
}

impl Rank {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let rank_key = p.required_str("rank_key");
        let descending = match p.optional_str("direction").as_deref() {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(_) => {
                p.reject("direction");
                false
            }
        };
        p.finish()?;
        Ok(Self {
            spec: spec.clone(),
            rank_key,
            descending,
        })
    }
}

fn type_order(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by kind, then by content.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_order(a)
            .cmp(&type_order(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

#[async_trait]
impl Operation for Rank {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    async fn execute(&self, input: OperationInput, _ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let mut records = input.into_records();
        records.sort_by(|a, b| {
            match (lookup_path(a, &self.rank_key), lookup_path(b, &self.rank_key)) {
                (Some(x), Some(y)) => {
                    let ord = compare_values(x, y);
                    if self.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        for (i, record) in records.iter_mut().enumerate() {
            record.insert("_rank".into(), Value::from(i as u64 + 1));
        }
        Ok(records)
    }
}
