//! Validators score an operation's output on a sample.
//!
//! [`HeuristicValidator`] checks that declared output fields are present and
//! non-empty. [`LlmJudge`] asks a judge model to grade the outputs.

use crate::OptimizerError;
use async_trait::async_trait;
use df_core::pipeline::OperationSpec;
use df_core::record::{Record, Value};
use df_ops::schema::{FieldType, OutputSchema};
use df_ops::{CompletionRequest, OpContext};
use serde::Serialize;

/// Quality of one output sample, in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    pub value: f64,
    pub rationale: String,
}

/// Verdict on whether an operation is worth optimizing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub should_optimize: bool,
    pub rationale: String,
    /// Prompt sent to a judge model, if one was used.
    pub validator_prompt: Option<String>,
}

#[async_trait]
pub trait Validator: Send + Sync + std::fmt::Debug {
    /// Score `output`, produced from `input`, against what `target` asks for.
    async fn score(
        &self,
        target: &OperationSpec,
        input: &[Record],
        output: &[Record],
        ctx: &OpContext,
    ) -> Result<Score, OptimizerError>;

    async fn assess(
        &self,
        target: &OperationSpec,
        input: &[Record],
        output: &[Record],
        ctx: &OpContext,
    ) -> Result<Assessment, OptimizerError>;
}

// ---------------------------------------------------------------------------
// Heuristic
// ---------------------------------------------------------------------------

/// Scores by the share of declared output fields that came back non-empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicValidator;

/// Below this score an operation is flagged for optimization.
const HEURISTIC_THRESHOLD: f64 = 0.999;

impl HeuristicValidator {
    pub fn completeness(target: &OperationSpec, input: &[Record], output: &[Record]) -> f64 {
        if output.is_empty() {
            return if input.is_empty() { 1.0 } else { 0.0 };
        }
        let fields: Vec<String> = OutputSchema::from_spec(target)
            .map(|s| s.field_names().into_iter().map(String::from).collect())
            .unwrap_or_default();

        let filled = if fields.is_empty() {
            1.0
        } else {
            let per_record: f64 = output
                .iter()
                .map(|r| {
                    let present = fields.iter().filter(|f| r.get(f.as_str()).is_some_and(is_filled)).count();
                    present as f64 / fields.len() as f64
                })
                .sum();
            per_record / output.len() as f64
        };

        // A record-wise map should keep the record count.
        if target.op_type == "map" && !input.is_empty() {
            let (a, b) = (input.len() as f64, output.len() as f64);
            filled * (a.min(b) / a.max(b))
        } else {
            filled
        }
    }
}

fn is_filled(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

#[async_trait]
impl Validator for HeuristicValidator {
    async fn score(
        &self,
        target: &OperationSpec,
        input: &[Record],
        output: &[Record],
        _ctx: &OpContext,
    ) -> Result<Score, OptimizerError> {
        let value = Self::completeness(target, input, output);
        Ok(Score {
            value,
            rationale: format!(
                "{:.0}% of declared output fields filled across {} records",
                value * 100.0,
                output.len()
            ),
        })
    }

    async fn assess(
        &self,
        target: &OperationSpec,
        input: &[Record],
        output: &[Record],
        ctx: &OpContext,
    ) -> Result<Assessment, OptimizerError> {
        let score = self.score(target, input, output, ctx).await?;
        Ok(Assessment {
            should_optimize: score.value < HEURISTIC_THRESHOLD,
            rationale: score.rationale,
            validator_prompt: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Model-graded
// ---------------------------------------------------------------------------

/// Grades outputs with a judge model.
#[derive(Debug, Clone)]
pub struct LlmJudge {
    model: String,
}

impl LlmJudge {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }

    fn context(target: &OperationSpec, input: &[Record], output: &[Record]) -> String {
        let pairs: Vec<Value> = input
            .iter()
            .zip(output.iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(i, o)| serde_json::json!({"input": i, "output": o}))
            .collect();
        format!(
            "Operation ({}):\n{}\n\nSample inputs and outputs:\n{}",
            target.op_type,
            target.param_str("prompt").unwrap_or("(no prompt)"),
            serde_json::to_string_pretty(&pairs).unwrap_or_default()
        )
    }

    async fn ask(&self, prompt: String, schema: &OutputSchema, ctx: &OpContext) -> Result<Record, OptimizerError> {
        let text = format!("{prompt}\n\n{}", schema.instruction());
        let response = ctx.complete(CompletionRequest::new(self.model.clone(), text).json()).await?;
        Ok(schema.parse_response(&response.text)?)
    }
}

#[async_trait]
impl Validator for LlmJudge {
    async fn score(
        &self,
        target: &OperationSpec,
        input: &[Record],
        output: &[Record],
        ctx: &OpContext,
    ) -> Result<Score, OptimizerError> {
        let schema = OutputSchema {
            fields: vec![
                ("score".into(), FieldType::Number),
                ("rationale".into(), FieldType::String),
            ],
        };
        let prompt = format!(
            "You are grading the output of a data-processing operation.\n\n{}\n\n\
             Rate from 0 to 1 how completely and accurately the outputs do what the operation asks.",
            Self::context(target, input, output)
        );
        let verdict = self.ask(prompt, &schema, ctx).await?;
        let value = verdict.get("score").and_then(Value::as_f64).unwrap_or(0.0);
        Ok(Score {
            value: value.clamp(0.0, 1.0),
            rationale: verdict
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn assess(
        &self,
        target: &OperationSpec,
        input: &[Record],
        output: &[Record],
        ctx: &OpContext,
    ) -> Result<Assessment, OptimizerError> {
        let schema = OutputSchema {
            fields: vec![
                ("should_optimize".into(), FieldType::Boolean),
                ("rationale".into(), FieldType::String),
            ],
        };
        let prompt = format!(
            "You are reviewing a data-processing operation.\n\n{}\n\n\
             Decide whether the operation should be rewritten into simpler steps \
             because its outputs are incomplete, inconsistent or wrong.",
            Self::context(target, input, output)
        );
        let verdict = self.ask(prompt.clone(), &schema, ctx).await?;
        Ok(Assessment {
            should_optimize: verdict
                .get("should_optimize")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            rationale: verdict
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            validator_prompt: Some(prompt),
        })
    }
}
