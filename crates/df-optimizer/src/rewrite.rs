//! Candidate rewrites for one operation.
//!
//! Two sources: a structural decomposition of multi-field `map` operations
//! into one map per output field, and proposals from a rewrite model.

use crate::OptimizerError;
use df_core::pipeline::OperationSpec;
use df_core::record::{Record, Value};
use df_ops::schema::{extract_json_object, OutputSchema};
use df_ops::{CompletionRequest, OpContext, OperationRegistry};
use serde::Serialize;
use std::collections::HashSet;

/// A replacement chain for one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub label: String,
    pub rationale: String,
    pub ops: Vec<OperationSpec>,
}

/// Split a `map` with several output fields into a chain of single-field
/// maps. `drop_keys` applies only at the end of the chain.
pub fn decompose_by_field(spec: &OperationSpec) -> Option<Candidate> {
    if spec.op_type != "map" {
        return None;
    }
    let schema = OutputSchema::from_spec(spec).ok()?;
    if schema.fields.len() < 2 {
        return None;
    }
    let prompt = spec.param_str("prompt")?;
    let raw_schema = spec.param("output")?.get("schema")?.as_object()?;

    let last = schema.fields.len() - 1;
    let ops = schema
        .fields
        .iter()
        .enumerate()
        .map(|(i, (field, _))| {
            let mut op = spec.clone();
            op.name = format!("{}_{}", spec.name, field);
            op.optimize = false;
            op.params.insert(
                "prompt".into(),
                Value::String(format!("{prompt}\n\nFocus only on producing `{field}`.")),
            );
            let mut only = serde_json::Map::new();
            if let Some(ty) = raw_schema.get(field) {
                only.insert(field.clone(), ty.clone());
            }
            op.params
                .insert("output".into(), serde_json::json!({ "schema": only }));
            if i != last {
                op.params.remove("drop_keys");
            }
            op
        })
        .collect();

    Some(Candidate {
        label: "decompose-by-field".into(),
        rationale: format!(
            "ask for one of {} output fields per call",
            schema.fields.len()
        ),
        ops,
    })
}

/// Prompt asking the rewrite model for alternative chains.
pub fn rewrite_prompt(spec: &OperationSpec, sample: &[Record], max: usize) -> String {
    let spec_json = serde_json::to_string_pretty(spec).unwrap_or_default();
    let sample_json = serde_json::to_string_pretty(&sample.iter().take(3).collect::<Vec<_>>()).unwrap_or_default();
    format!(
        "Propose up to {max} rewrites of the following data-processing operation. \
         A rewrite is a chain of simpler operations with the same overall effect, \
         e.g. splitting one complex prompt into several focused prompts.\n\n\
         Operation:\n{spec_json}\n\nSample input records:\n{sample_json}\n\n\
         Each operation in a chain is an object with \"name\", \"type\" and the \
         parameters its type needs. Respond with a JSON object of the form \
         {{\"candidates\": [{{\"rationale\": string, \"operations\": [object]}}]}}."
    )
}

/// Parse a rewrite model response into valid candidates.
///
/// Chains whose operations fail to deserialize or to construct are dropped.
/// Proposed operations never carry `optimize`, inherit the original's model
/// when they have a prompt but no model, and get unique names.
pub fn parse_proposals(text: &str, original: &OperationSpec, registry: &OperationRegistry) -> Vec<Candidate> {
    let Some(object) = extract_json_object(text) else {
        tracing::warn!(operation = %original.name, "rewrite response is not a JSON object");
        return Vec::new();
    };
    let Some(Value::Array(proposals)) = object.get("candidates") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (i, proposal) in proposals.iter().enumerate() {
        let rationale = proposal
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ops: Vec<OperationSpec> = match proposal
            .get("operations")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(ops)) => ops,
            Some(Err(err)) => {
                tracing::warn!(operation = %original.name, candidate = i, error = %err, "dropping malformed rewrite");
                continue;
            }
            None => continue,
        };
        if ops.is_empty() {
            continue;
        }
        let ops = normalize(ops, original, i);
        if let Some(bad) = ops.iter().find_map(|op| registry.resolve_spec(op).err()) {
            tracing::warn!(operation = %original.name, candidate = i, error = %bad, "dropping invalid rewrite");
            continue;
        }
        if ops.iter().any(|op| op.op_type == "equijoin" || op.op_type == "scan") {
            continue;
        }
        out.push(Candidate {
            label: format!("model-rewrite-{}", i + 1),
            rationale,
            ops,
        });
    }
    out
}

fn normalize(ops: Vec<OperationSpec>, original: &OperationSpec, candidate: usize) -> Vec<OperationSpec> {
    let model = original.param("model").cloned();
    let mut seen = HashSet::new();
    ops.into_iter()
        .enumerate()
        .map(|(j, mut op)| {
            op.optimize = false;
            if op.name.is_empty() || op.name == original.name || !seen.insert(op.name.clone()) {
                op.name = format!("{}_r{}_{}", original.name, candidate + 1, j + 1);
                seen.insert(op.name.clone());
            }
            if op.param("prompt").is_some() && op.param("model").is_none() {
                if let Some(model) = &model {
                    op.params.insert("model".into(), model.clone());
                }
            }
            op
        })
        .collect()
}

/// Every candidate for `spec`, decomposition first, capped at `max`.
pub async fn candidates(
    spec: &OperationSpec,
    sample: &[Record],
    rewrite_model: Option<&str>,
    ctx: &OpContext,
    registry: &OperationRegistry,
    max: usize,
) -> Result<Vec<Candidate>, OptimizerError> {
    let mut all: Vec<Candidate> = decompose_by_field(spec).into_iter().collect();
    if let Some(model) = rewrite_model {
        if all.len() < max {
            let request = CompletionRequest::new(model, rewrite_prompt(spec, sample, max - all.len())).json();
            let response = ctx.complete(request).await?;
            all.extend(parse_proposals(&response.text, spec, registry));
        }
    }
    all.truncate(max);
    Ok(all)
}
