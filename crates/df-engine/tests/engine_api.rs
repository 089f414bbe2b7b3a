//! The engine surface end to end: load, run, history, cancel, optimize.

use df_core::record::records_from_value;
use df_core::trace::{ExecutionStatus, ProgressEvent};
use df_engine::{CollectingSink, Engine, EngineError, NullSink, RunQuery};
use df_ops::mock::ScriptedLlm;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn engine() -> anyhow::Result<(tempfile::TempDir, Engine)> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(dir.path().join("home"))?;
    Ok((dir, engine))
}

fn uppercase(namespace: &str) -> serde_json::Value {
    json!({
        "name": "shout",
        "datasets": {"docs": {"type": "memory", "records": [{"text": "a"}, {"text": "b"}]}},
        "operations": [{"name": "shout", "type": "uppercase", "field": "text"}],
        "pipeline": {"steps": [{"name": "s", "input": "docs", "operations": ["shout"]}]},
        "settings": {"namespace": namespace}
    })
}

#[tokio::test]
async fn run_records_history_and_reuses_cache() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    let pipeline = engine.load_pipeline_value(uppercase("team-a"))?;
    let sink = Arc::new(CollectingSink::new());

    let first = engine.run(&pipeline, sink.clone()).await?;
    assert_eq!(first.records, records_from_value(json!([{"text": "A"}, {"text": "B"}])));
    assert!(!first.cache_hit);
    assert_eq!(first.total_cost_usd, 0.0);

    let second = engine.run(&pipeline, Arc::new(NullSink)).await?;
    assert!(second.cache_hit);
    assert_eq!(second.records, first.records);

    let events = sink.events();
    assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { run_id }) if *run_id == first.run_id));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFinished { status: ExecutionStatus::Completed, .. })
    ));

    let runs = engine.history(&RunQuery::namespace("team-a"))?;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Completed));
    let record = engine.run_record(second.run_id)?;
    assert!(record.cache_hits >= 1);
    let reports = engine.node_reports(first.run_id)?;
    assert!(reports.iter().any(|r| r.node == "s/shout" && r.status == ExecutionStatus::Completed));
    assert_eq!(engine.history_summary("team-a")?.completed, 2);
    Ok(())
}

#[test]
fn build_errors_surface_at_load() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    let err = engine
        .load_pipeline_value(json!({
            "datasets": {"docs": {"type": "memory", "records": []}},
            "operations": [{"name": "shout", "type": "uppercase"}],
            "pipeline": {"steps": [{"name": "a", "input": "ghost", "operations": ["shout"]}]}
        }))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownStepReference { .. }));

    let err = engine.load_pipeline_value(uppercase("../escape")).unwrap_err();
    assert!(matches!(err, EngineError::InvalidPipeline(_)));
    Ok(())
}

#[tokio::test]
async fn cancel_stops_an_inflight_run() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    let llm = Arc::new(
        ScriptedLlm::new()
            .otherwise(r#"{"summary": "ok"}"#)
            .with_delay(Duration::from_secs(5)),
    );
    let engine = Arc::new(engine.with_llm(llm));
    let pipeline = engine.load_pipeline_value(json!({
        "default_model": "mock",
        "datasets": {"docs": {"type": "memory", "records": [{"text": "slow"}]}},
        "operations": [{"name": "summarize", "type": "map", "prompt": "Summarize {{ input.text }}",
                        "output": {"schema": {"summary": "string"}}}],
        "pipeline": {"steps": [{"name": "s", "input": "docs", "operations": ["summarize"]}]}
    }))?;

    let run_id = Uuid::new_v4();
    let task = {
        let engine = engine.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move { engine.run_with_id(&pipeline, Arc::new(NullSink), run_id).await })
    };
    while !engine.active_runs().contains(&run_id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(engine.cancel(run_id));

    let result = tokio::time::timeout(Duration::from_secs(2), task).await??;
    assert_eq!(result.unwrap_err(), EngineError::Cancelled);
    assert!(!engine.cancel(run_id));
    assert!(engine.active_runs().is_empty());
    assert_eq!(engine.run_record(run_id)?.status, ExecutionStatus::Cancelled);
    Ok(())
}

#[test]
fn cancelling_unknown_run_is_false() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    assert!(!engine.cancel(Uuid::new_v4()));
    Ok(())
}

#[tokio::test]
async fn clear_cache_forces_reexecution() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    let pipeline = engine.load_pipeline_value(uppercase("scratch"))?;
    engine.run(&pipeline, Arc::new(NullSink)).await?;

    let plan = engine.plan(&pipeline).await?;
    assert!(plan.entries.iter().all(|e| e.cached));

    let cached = engine.cache_stats("scratch")?.entries;
    assert!(cached > 0);
    assert_eq!(engine.clear_cache("scratch")? as u64, cached);
    assert_eq!(engine.cache_stats("scratch")?.entries, 0);
    let rerun = engine.run(&pipeline, Arc::new(NullSink)).await?;
    assert!(!rerun.cache_hit);
    Ok(())
}

#[tokio::test]
async fn failed_run_is_recorded_with_its_error() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    let engine = engine.with_llm(Arc::new(ScriptedLlm::new().otherwise("not json at all")));
    let pipeline = engine.load_pipeline_value(json!({
        "default_model": "mock",
        "datasets": {"docs": {"type": "memory", "records": [{"text": "x"}]}},
        "operations": [{"name": "classify", "type": "map", "prompt": "Classify {{ input.text }}",
                        "output": {"schema": {"label": "string"}}}],
        "pipeline": {"steps": [{"name": "s", "input": "docs", "operations": ["classify"]}]}
    }))?;

    let err = engine.run(&pipeline, Arc::new(NullSink)).await.unwrap_err();
    assert!(matches!(err, EngineError::NodeExecution { ref node, .. } if node == "s/classify"));

    let failed = engine.history(&RunQuery::namespace("default").with_status(ExecutionStatus::Failed))?;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("s/classify"));
    Ok(())
}

#[tokio::test]
async fn optimized_pipeline_runs() -> anyhow::Result<()> {
    let (_dir, engine) = engine()?;
    let llm = Arc::new(
        ScriptedLlm::new()
            .when("Focus only on producing `title`", r#"{"title": "Invoice"}"#)
            .when("Focus only on producing `total`", r#"{"total": 12.5}"#)
            .when("Extract title and total", r#"{"title": "", "total": 12.5}"#),
    );
    let engine = engine.with_llm(llm);
    let pipeline = engine.load_pipeline_value(json!({
        "name": "invoices",
        "default_model": "mock",
        "datasets": {"docs": {"type": "memory", "records": [{"text": "one"}, {"text": "two"}]}},
        "operations": [{"name": "extract", "type": "map", "optimize": true,
                        "prompt": "Extract title and total from {{ input.text }}",
                        "output": {"schema": {"title": "string", "total": "number"}}}],
        "pipeline": {"steps": [{"name": "s", "input": "docs", "operations": ["extract"]}]},
        "settings": {"namespace": "billing", "optimizer": {"sample_size": 2}}
    }))?;

    let optimized = engine.optimize(&pipeline, Arc::new(NullSink)).await?;
    assert_eq!(optimized.rewrites.len(), 1);
    assert!(optimized.warnings.is_empty());
    assert!(optimized.pipeline.config().operation("extract_title").is_some());

    let out = engine.run(&optimized.pipeline, Arc::new(NullSink)).await?;
    assert_eq!(
        out.records,
        records_from_value(json!([
            {"text": "one", "title": "Invoice", "total": 12.5},
            {"text": "two", "title": "Invoice", "total": 12.5}
        ]))
    );
    Ok(())
}

#[tokio::test]
async fn yaml_file_resolves_datasets_next_to_it() -> anyhow::Result<()> {
    let (dir, engine) = engine()?;
    std::fs::write(dir.path().join("docs.json"), r#"[{"text": "hi"}]"#)?;
    let path = dir.path().join("pipeline.yaml");
    std::fs::write(
        &path,
        "name: from-file\n\
         datasets:\n  docs:\n    type: file\n    path: docs.json\n\
         operations:\n  - name: shout\n    type: uppercase\n    field: text\n\
         pipeline:\n  steps:\n    - name: s\n      input: docs\n      operations: [shout]\n",
    )?;

    let pipeline = engine.load_pipeline_file(&path).await?;
    assert_eq!(pipeline.name(), "from-file");
    let out = engine.run(&pipeline, Arc::new(NullSink)).await?;
    assert_eq!(out.records, records_from_value(json!([{"text": "HI"}])));
    Ok(())
}
