//! Dataset loader: resolves a named dataset to records and applies its
//! parsing chain.
//!
//! File datasets are JSON arrays or JSON lines. Parsing transforms are pure
//! `Record -> one-or-many Record` functions looked up by name; any failure
//! aborts the whole load.

use crate::EngineError;
use df_core::pipeline::{DatasetKind, DatasetSpec, ParsingStep};
use df_core::record::{records_from_value, value_to_text, Record, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A parsing transform: `(record, step params) -> records`.
pub type ParseTransform =
    Arc<dyn Fn(&Record, &serde_json::Map<String, Value>) -> Result<Vec<Record>, String> + Send + Sync>;

#[derive(Clone)]
pub struct DatasetLoader {
    transforms: HashMap<String, ParseTransform>,
    /// Relative dataset paths resolve against this directory.
    base_dir: Option<PathBuf>,
}

impl fmt::Debug for DatasetLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("DatasetLoader")
            .field("transforms", &names)
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

impl Default for DatasetLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetLoader {
    /// Loader with the built-in transforms registered.
    pub fn new() -> Self {
        let mut loader = Self {
            transforms: HashMap::new(),
            base_dir: None,
        };
        loader.register("txt_to_string", Arc::new(txt_to_string));
        loader.register("split_lines", Arc::new(split_lines));
        loader.register("parse_json", Arc::new(parse_json));
        loader.register("trim", Arc::new(trim));
        loader
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn register(&mut self, name: impl Into<String>, transform: ParseTransform) {
        self.transforms.insert(name.into(), transform);
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        match &self.base_dir {
            Some(base) if p.is_relative() => base.join(p),
            _ => p.to_path_buf(),
        }
    }

    /// Load `name`, apply its parsing chain, then keep at most `sample_size`.
    pub async fn load(
        &self,
        name: &str,
        spec: &DatasetSpec,
        sample_size: Option<usize>,
    ) -> Result<Vec<Record>, EngineError> {
        let load_err = |message: String| EngineError::Load {
            dataset: name.to_string(),
            message,
        };

        let raw = match spec.kind {
            DatasetKind::Memory => spec
                .records
                .clone()
                .ok_or_else(|| load_err("memory dataset has no records".into()))?,
            DatasetKind::File => {
                let path = spec
                    .path
                    .as_deref()
                    .ok_or_else(|| load_err("file dataset has no path".into()))?;
                let path = self.resolve_path(path);
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| load_err(format!("cannot read {}: {e}", path.display())))?;
                parse_records(&text).map_err(load_err)?
            }
        };

        let mut records = if spec.parsing.is_empty() {
            raw
        } else {
            // Transforms are synchronous and may read files.
            let loader = self.clone();
            let chain = spec.parsing.clone();
            tokio::task::spawn_blocking(move || loader.apply_to_all(&raw, &chain))
                .await
                .map_err(|e| load_err(format!("parsing task failed: {e}")))?
                .map_err(|(index, transform, message)| EngineError::ParseTransform {
                    dataset: name.to_string(),
                    transform,
                    index,
                    message,
                })?
        };
        if let Some(n) = sample_size {
            records.truncate(n);
        }
        tracing::debug!(dataset = name, records = records.len(), "dataset loaded");
        Ok(records)
    }

    /// Apply `chain` to every record. On failure returns the record index,
    /// the transform name and the reason.
    fn apply_to_all(&self, raw: &[Record], chain: &[ParsingStep]) -> Result<Vec<Record>, (usize, String, String)> {
        let mut records = Vec::with_capacity(raw.len());
        for (index, record) in raw.iter().enumerate() {
            let parsed = self
                .apply_parsing_chain(record, chain)
                .map_err(|(transform, message)| (index, transform, message))?;
            records.extend(parsed);
        }
        Ok(records)
    }

    /// Apply `chain` in declared order. On failure returns the transform name
    /// and the reason.
    pub fn apply_parsing_chain(
        &self,
        record: &Record,
        chain: &[ParsingStep],
    ) -> Result<Vec<Record>, (String, String)> {
        let mut current = vec![record.clone()];
        for step in chain {
            let transform = self
                .transforms
                .get(&step.function)
                .ok_or_else(|| (step.function.clone(), "unknown parsing transform".to_string()))?;
            let mut next = Vec::with_capacity(current.len());
            for r in &current {
                next.extend(transform(r, &step.params).map_err(|e| (step.function.clone(), e))?);
            }
            current = next;
        }
        Ok(current)
    }
}

/// JSON array (or single object) first, JSON lines otherwise.
fn parse_records(text: &str) -> Result<Vec<Record>, String> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Ok(records_from_value(value));
        }
    }
    let mut out = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| format!("line {}: {e}", line_no + 1))?;
        out.extend(records_from_value(value));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Built-in transforms
// ---------------------------------------------------------------------------

fn param<'a>(params: &'a serde_json::Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Replace the path at `input_key` (default `path`) with the file's text at
/// `output_key` (default `text`).
fn txt_to_string(record: &Record, params: &serde_json::Map<String, Value>) -> Result<Vec<Record>, String> {
    let input_key = param(params, "input_key", "path");
    let output_key = param(params, "output_key", "text");
    let path = record
        .get(input_key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("field '{input_key}' missing or not a string"))?;
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    let mut out = record.clone();
    out.insert(output_key.to_string(), Value::String(text));
    Ok(vec![out])
}

/// One record per non-empty line of `input_key` (default `text`).
fn split_lines(record: &Record, params: &serde_json::Map<String, Value>) -> Result<Vec<Record>, String> {
    let input_key = param(params, "input_key", "text");
    let output_key = param(params, "output_key", input_key);
    let text = record
        .get(input_key)
        .map(value_to_text)
        .ok_or_else(|| format!("field '{input_key}' missing"))?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut out = record.clone();
            out.insert(output_key.to_string(), Value::String(line.to_string()));
            out
        })
        .collect())
}

/// Parse the string at `input_key` as JSON. Objects merge into the record
/// unless `output_key` is given.
fn parse_json(record: &Record, params: &serde_json::Map<String, Value>) -> Result<Vec<Record>, String> {
    let input_key = param(params, "input_key", "text");
    let raw = record
        .get(input_key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("field '{input_key}' missing or not a string"))?;
    let parsed: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let mut out = record.clone();
    match (params.get("output_key").and_then(Value::as_str), parsed) {
        (Some(key), value) => {
            out.insert(key.to_string(), value);
        }
        (None, Value::Object(fields)) => {
            out.remove(input_key);
            out.extend(fields);
        }
        (None, value) => {
            out.insert(input_key.to_string(), value);
        }
    }
    Ok(vec![out])
}

/// Trim whitespace from `input_key`, or every top-level string.
fn trim(record: &Record, params: &serde_json::Map<String, Value>) -> Result<Vec<Record>, String> {
    let mut out = record.clone();
    match params.get("input_key").and_then(Value::as_str) {
        Some(key) => {
            if let Some(Value::String(s)) = out.get_mut(key) {
                *s = s.trim().to_string();
            }
        }
        None => {
            for v in out.values_mut() {
                if let Value::String(s) = v {
                    *s = s.trim().to_string();
                }
            }
        }
    }
    Ok(vec![out])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn step(function: &str, params: Value) -> ParsingStep {
        ParsingStep {
            function: function.into(),
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn loads_json_array_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"text": "a"}}, {{"text": "b"}}]"#).unwrap();
        let spec = DatasetSpec::file(file.path().to_string_lossy());
        let records = DatasetLoader::new().load("docs", &spec, None).await.unwrap();
        assert_eq!(records, records_from_value(json!([{"text": "a"}, {"text": "b"}])));
    }

    #[tokio::test]
    async fn loads_json_lines_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("d.jsonl"), "{\"n\": 1}\n\n{\"n\": 2}\n").unwrap();
        let loader = DatasetLoader::new().with_base_dir(dir.path());
        let records = loader.load("d", &DatasetSpec::file("d.jsonl"), Some(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["n"], 1);
    }

    #[tokio::test]
    async fn missing_file_is_load_error() {
        let err = DatasetLoader::new()
            .load("docs", &DatasetSpec::file("/definitely/not/here.json"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Load { ref dataset, .. } if dataset == "docs"));
    }

    #[tokio::test]
    async fn chain_applies_in_order_and_fans_out() {
        let mut spec = DatasetSpec::memory(records_from_value(json!([{"text": " x \n y "}])));
        spec.parsing = vec![step("split_lines", json!({})), step("trim", json!({"input_key": "text"}))];
        let records = DatasetLoader::new().load("m", &spec, None).await.unwrap();
        let texts: Vec<&str> = records.iter().filter_map(|r| r["text"].as_str()).collect();
        assert_eq!(texts, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn failing_transform_aborts_with_index() {
        let mut spec = DatasetSpec::memory(records_from_value(json!([
            {"text": "{\"a\": 1}"},
            {"text": "not json"}
        ])));
        spec.parsing = vec![step("parse_json", json!({}))];
        let err = DatasetLoader::new().load("m", &spec, None).await.unwrap_err();
        match err {
            EngineError::ParseTransform { transform, index, .. } => {
                assert_eq!(transform, "parse_json");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_transform() {
        let mut loader = DatasetLoader::new();
        loader.register(
            "tag",
            Arc::new(|r: &Record, _p: &serde_json::Map<String, Value>| {
                let mut out = r.clone();
                out.insert("tagged".into(), Value::Bool(true));
                Ok(vec![out])
            }),
        );
        let mut spec = DatasetSpec::memory(records_from_value(json!([{"a": 1}])));
        spec.parsing = vec![step("tag", json!({}))];
        let records = loader.load("m", &spec, None).await.unwrap();
        assert_eq!(records[0]["tagged"], true);
    }

    #[tokio::test]
    async fn parsing_chain_runs_off_the_async_thread() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "body").unwrap();
        let caller = std::thread::current().id();
        let mut loader = DatasetLoader::new();
        loader.register(
            "same_thread",
            Arc::new(move |r: &Record, _p: &serde_json::Map<String, Value>| {
                let mut out = r.clone();
                out.insert("same_thread".into(), Value::Bool(std::thread::current().id() == caller));
                Ok(vec![out])
            }),
        );
        let path = file.path().to_string_lossy().to_string();
        let mut spec = DatasetSpec::memory(records_from_value(json!([{"path": path}])));
        spec.parsing = vec![step("txt_to_string", json!({})), step("same_thread", json!({}))];
        let records = loader.load("m", &spec, None).await.unwrap();
        assert_eq!(records[0]["text"], "body");
        assert_eq!(records[0]["same_thread"], false);
    }
}
