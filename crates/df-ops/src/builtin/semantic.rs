//! LLM-backed operators: `map`, `filter`, `reduce`.
//!
//! All three render a prompt template, ask for a JSON object matching the
//! declared output schema and reject responses that do not match it.

use super::Params;
use crate::llm::CompletionRequest;
use crate::schema::{FieldType, OutputSchema};
use crate::template::{render, Bindings};
use crate::{OpContext, Operation, OperationError, OperationInput, RegistryError};
use async_trait::async_trait;
use df_core::pipeline::OperationSpec;
use df_core::record::{lookup_path, Record, Value};

/// Settings shared by the semantic operators.
#[derive(Debug, Clone)]
struct PromptConfig {
    prompt: String,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    schema: OutputSchema,
}

impl PromptConfig {
    /// `None` when any field is unusable; the problems are recorded in `p`.
    fn parse(spec: &OperationSpec, p: &mut Params<'_>) -> Option<Self> {
        let prompt = p.required_str("prompt");
        let model = p.required_str("model");
        let system_prompt = p.optional_str("system_prompt");
        let temperature = match spec.param("temperature") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_f64() {
                Some(t) => Some(t as f32),
                None => {
                    p.reject("temperature");
                    None
                }
            },
        };
        let schema = match OutputSchema::from_spec(spec) {
            Ok(schema) => Some(schema),
            Err(RegistryError::InvalidOperationConfig { fields, .. }) => {
                for field in fields {
                    p.reject(&field);
                }
                None
            }
            Err(_) => None,
        };
        if prompt.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            prompt,
            model,
            system_prompt,
            temperature,
            schema: schema?,
        })
    }

    fn request(&self, bindings: &Bindings<'_>) -> CompletionRequest {
        let text = format!("{}\n\n{}", render(&self.prompt, bindings), self.schema.instruction());
        let mut req = CompletionRequest::new(self.model.clone(), text).json();
        req.system = self.system_prompt.clone();
        req.temperature = self.temperature;
        req
    }

    async fn ask(&self, ctx: &OpContext, bindings: &Bindings<'_>) -> Result<Record, OperationError> {
        let response = ctx.complete(self.request(bindings)).await?;
        self.schema.parse_response(&response.text)
    }
}

/// Parse the prompt settings, reporting every bad field together.
fn build(spec: &OperationSpec, mut p: Params<'_>) -> Result<PromptConfig, RegistryError> {
    let parsed = PromptConfig::parse(spec, &mut p);
    p.finish()?;
    parsed.ok_or_else(|| RegistryError::invalid(spec, vec!["prompt".into()], "empty prompt"))
}

// ---------------------------------------------------------------------------
// map
// ---------------------------------------------------------------------------

/// One call per record; schema fields are merged into the record.
/// `drop_keys` removes input fields from the output.
#[derive(Debug)]
pub struct Map {
    spec: OperationSpec,
    config: PromptConfig,
    drop_keys: Vec<String>,
}

impl Map {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let drop_keys = match spec.param("drop_keys") {
            None => Vec::new(),
            Some(_) => p.required_str_list("drop_keys"),
        };
        let config = build(spec, p)?;
        Ok(Self {
            spec: spec.clone(),
            config,
            drop_keys,
        })
    }

    async fn process(&self, mut record: Record, ctx: &OpContext) -> Result<Record, OperationError> {
        let produced = self.config.ask(ctx, &Bindings::record(&record)).await?;
        for key in &self.drop_keys {
            record.remove(key);
        }
        record.extend(produced);
        Ok(record)
    }
}

#[async_trait]
impl Operation for Map {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn is_llm_backed(&self) -> bool {
        true
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn execute(&self, input: OperationInput, ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        ctx.map_ordered(input.into_records(), |record| self.process(record, ctx))
            .await
    }
}

// ---------------------------------------------------------------------------
// filter
// ---------------------------------------------------------------------------

/// One call per record; keeps records whose single boolean output is true.
#[derive(Debug)]
pub struct Filter {
    spec: OperationSpec,
    config: PromptConfig,
    verdict_field: String,
}

impl Filter {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let config = build(spec, Params::new(spec))?;
        let verdict_field = match config.schema.fields.as_slice() {
            [(name, FieldType::Boolean)] => name.clone(),
            _ => {
                return Err(RegistryError::invalid(
                    spec,
                    vec!["output.schema".into()],
                    "filter needs exactly one boolean output field",
                ))
            }
        };
        Ok(Self {
            spec: spec.clone(),
            config,
            verdict_field,
        })
    }

    async fn judge(&self, record: Record, ctx: &OpContext) -> Result<Option<Record>, OperationError> {
        let verdict = self.config.ask(ctx, &Bindings::record(&record)).await?;
        let keep = verdict
            .get(&self.verdict_field)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(keep.then_some(record))
    }
}

#[async_trait]
impl Operation for Filter {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn is_llm_backed(&self) -> bool {
        true
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn execute(&self, input: OperationInput, ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let verdicts = ctx
            .map_ordered(input.into_records(), |record| self.judge(record, ctx))
            .await?;
        Ok(verdicts.into_iter().flatten().collect())
    }
}

// ---------------------------------------------------------------------------
// reduce
// ---------------------------------------------------------------------------

const REDUCE_ALL: &str = "_all";

/// Groups records by `reduce_key` (one field, several, or `_all`) and makes
/// one call per group. Output records carry the key fields plus the schema
/// fields, in order of each group's first appearance.
#[derive(Debug)]
pub struct Reduce {
    spec: OperationSpec,
    config: PromptConfig,
    keys: Vec<String>,
}

impl Reduce {
    pub fn new(spec: &OperationSpec) -> Result<Self, RegistryError> {
        let mut p = Params::new(spec);
        let keys = p.required_str_list("reduce_key");
        let config = build(spec, p)?;
        Ok(Self {
            spec: spec.clone(),
            config,
            keys,
        })
    }

    fn groups(&self, records: Vec<Record>) -> Vec<(Vec<Value>, Vec<Record>)> {
        if self.keys.iter().any(|k| k == REDUCE_ALL) {
            return vec![(Vec::new(), records)];
        }
        let mut groups: Vec<(Vec<Value>, Vec<Record>)> = Vec::new();
        let mut position: std::collections::HashMap<String, usize> = Default::default();
        for record in records {
            let key: Vec<Value> = self
                .keys
                .iter()
                .map(|k| lookup_path(&record, k).cloned().unwrap_or(Value::Null))
                .collect();
            let id = Value::Array(key.clone()).to_string();
            match position.get(&id) {
                Some(&i) => groups[i].1.push(record),
                None => {
                    position.insert(id, groups.len());
                    groups.push((key, vec![record]));
                }
            }
        }
        groups
    }

    async fn reduce_group(
        &self,
        key: Vec<Value>,
        members: Vec<Record>,
        ctx: &OpContext,
    ) -> Result<Record, OperationError> {
        let key_value = match key.as_slice() {
            [] => Value::String(REDUCE_ALL.into()),
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        };
        let produced = self
            .config
            .ask(ctx, &Bindings::group(&key_value, &members))
            .await?;
        let mut out = Record::new();
        for (name, value) in self.keys.iter().zip(key) {
            out.insert(name.clone(), value);
        }
        out.extend(produced);
        Ok(out)
    }
}

#[async_trait]
impl Operation for Reduce {
    fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    fn is_llm_backed(&self) -> bool {
        true
    }

    async fn execute(&self, input: OperationInput, ctx: &OpContext) -> Result<Vec<Record>, OperationError> {
        let groups = self.groups(input.into_records());
        tracing::debug!(op = %self.spec.name, groups = groups.len(), "reducing");
        ctx.map_ordered(groups, |(key, members)| self.reduce_group(key, members, ctx))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::test_support::records;
    use crate::llm::DirectDispatch;
    use crate::mock::ScriptedLlm;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(llm: ScriptedLlm) -> (OpContext, Arc<ScriptedLlm>) {
        let llm = Arc::new(llm);
        let ctx = OpContext::new("step/op", Arc::new(DirectDispatch::new(llm.clone())));
        (ctx, llm)
    }

    fn map_spec() -> OperationSpec {
        OperationSpec::new("extract", "map")
            .with_param("prompt", "Classify: {{ input.text }}")
            .with_param("model", "mock-1")
            .with_param("output", json!({"schema": {"label": "string"}}))
    }

    #[test]
    fn map_reports_all_missing_fields() {
        let spec = OperationSpec::new("m", "map");
        match Map::new(&spec).unwrap_err() {
            RegistryError::InvalidOperationConfig { fields, .. } => {
                assert_eq!(fields, vec!["prompt", "model", "output.schema"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let spec = OperationSpec::new("m", "map").with_param("output", json!({"schema": {"a": "str"}}));
        match Map::new(&spec).unwrap_err() {
            RegistryError::InvalidOperationConfig { fields, .. } => {
                assert_eq!(fields, vec!["prompt", "model"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn map_merges_output_in_order() {
        let (ctx, llm) = ctx(ScriptedLlm::new()
            .when("Classify: apple", r#"{"label": "fruit"}"#)
            .when("Classify: carrot", r#"{"label": "vegetable"}"#));
        let op = Map::new(&map_spec()).unwrap();
        let out = op
            .execute(
                OperationInput::single(records(json!([{"text": "apple"}, {"text": "carrot"}]))),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, records(json!([
            {"text": "apple", "label": "fruit"},
            {"text": "carrot", "label": "vegetable"}
        ])));
        assert_eq!(llm.calls(), 2);
        assert!(op.is_llm_backed());
    }

    #[tokio::test]
    async fn map_schema_violation_is_permanent() {
        let (ctx, _) = ctx(ScriptedLlm::new().otherwise(r#"{"other": 1}"#));
        let err = Map::new(&map_spec())
            .unwrap()
            .execute(OperationInput::single(records(json!([{"text": "x"}]))), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Validation(_)));
    }

    #[tokio::test]
    async fn filter_keeps_true_verdicts() {
        let spec = OperationSpec::new("f", "filter")
            .with_param("prompt", "Is {{ input.n }} even?")
            .with_param("model", "mock-1")
            .with_param("output", json!({"schema": {"keep": "boolean"}}));
        let (ctx, _) = ctx(ScriptedLlm::new().respond_with(|req| {
            let even = ["0", "2", "4"].iter().any(|d| req.prompt.contains(&format!("Is {d} even")));
            Ok(json!({ "keep": even }).to_string())
        }));
        let out = Filter::new(&spec)
            .unwrap()
            .execute(OperationInput::single(records(json!([{"n": 1}, {"n": 2}, {"n": 4}]))), &ctx)
            .await
            .unwrap();
        assert_eq!(out, records(json!([{"n": 2}, {"n": 4}])));
    }

    #[test]
    fn filter_needs_one_boolean() {
        let spec = OperationSpec::new("f", "filter")
            .with_param("prompt", "p")
            .with_param("model", "m")
            .with_param("output", json!({"schema": {"keep": "string"}}));
        assert!(Filter::new(&spec).is_err());
    }

    #[tokio::test]
    async fn reduce_groups_by_first_appearance() {
        let spec = OperationSpec::new("r", "reduce")
            .with_param("reduce_key", "team")
            .with_param("prompt", "Summarize {{ reduce_key }}: {{ inputs }}")
            .with_param("model", "mock-1")
            .with_param("output", json!({"schema": {"count": "int"}}));
        let (ctx, llm) = ctx(ScriptedLlm::new()
            .when("Summarize red", r#"{"count": 2}"#)
            .when("Summarize blue", r#"{"count": 1}"#));
        let out = Reduce::new(&spec)
            .unwrap()
            .execute(
                OperationInput::single(records(json!([
                    {"team": "red", "x": 1}, {"team": "blue", "x": 2}, {"team": "red", "x": 3}
                ]))),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, records(json!([{"team": "red", "count": 2}, {"team": "blue", "count": 1}])));
        assert_eq!(llm.calls(), 2);
    }
}
