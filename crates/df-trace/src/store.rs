//! SQLite-backed run history.

use crate::query::{NamespaceSummary, RunQuery};
use crate::TraceError;
use chrono::{DateTime, SecondsFormat, Utc};
use df_core::trace::{ExecutionStatus, NodeReport, RunRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Run history backed by a single SQLite database.
/// Uses Mutex<Connection> for thread safety (rusqlite::Connection is !Sync).
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore").finish_non_exhaustive()
    }
}

const RUN_COLUMNS: &str = "run_id, pipeline_name, namespace, started_at, completed_at, status,
     total_nodes, completed_nodes, failed_nodes, cache_hits, total_cost_usd, error";

impl RunStore {
    /// Open (or create) the history database at the given path.
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TraceError::Database(e.to_string()))?;
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, TraceError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, TraceError> {
        self.conn
            .lock()
            .map_err(|_| TraceError::Database("Lock poisoned".into()))
    }

    fn initialize_schema(&self) -> Result<(), TraceError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL,
                total_nodes INTEGER NOT NULL DEFAULT 0,
                completed_nodes INTEGER NOT NULL DEFAULT 0,
                failed_nodes INTEGER NOT NULL DEFAULT 0,
                cache_hits INTEGER NOT NULL DEFAULT 0,
                total_cost_usd REAL NOT NULL DEFAULT 0,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS node_reports (
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                node TEXT NOT NULL,
                op_type TEXT NOT NULL,
                status TEXT NOT NULL,
                fingerprint TEXT,
                records_out INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                started_at TEXT NOT NULL,
                duration_ms INTEGER,
                error TEXT,
                PRIMARY KEY (run_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_namespace
                ON runs(namespace, started_at);",
        )?;
        Ok(())
    }

    /// Insert or replace a run together with its node reports.
    ///
    /// A run is recorded once when it starts and again when it finishes; the
    /// second write replaces the first.
    pub fn record_run(&self, run: &RunRecord, nodes: &[NodeReport]) -> Result<(), TraceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let run_id = run.run_id.to_string();
        tx.execute(
            "INSERT OR REPLACE INTO runs (
                run_id, pipeline_name, namespace, started_at, completed_at, status,
                total_nodes, completed_nodes, failed_nodes, cache_hits, total_cost_usd, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run_id,
                run.pipeline_name,
                run.namespace,
                timestamp(&run.started_at),
                run.completed_at.as_ref().map(timestamp),
                run.status.as_str(),
                run.total_nodes,
                run.completed_nodes,
                run.failed_nodes,
                run.cache_hits,
                run.total_cost_usd,
                run.error,
            ],
        )?;
        tx.execute("DELETE FROM node_reports WHERE run_id = ?1", params![run_id])?;
        for (seq, node) in nodes.iter().enumerate() {
            tx.execute(
                "INSERT INTO node_reports (
                    run_id, seq, node, op_type, status, fingerprint,
                    records_out, cost_usd, started_at, duration_ms, error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run_id,
                    seq as i64,
                    node.node,
                    node.op_type,
                    node.status.as_str(),
                    node.fingerprint,
                    node.records_out as i64,
                    node.cost_usd,
                    timestamp(&node.started_at),
                    node.duration_ms,
                    node.error,
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(run_id = %run.run_id, status = run.status.as_str(), nodes = nodes.len(), "run recorded");
        Ok(())
    }

    pub fn get_run(&self, run_id: Uuid) -> Result<RunRecord, TraceError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id.to_string()],
                RawRunRow::from_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.into_record(),
            None => Err(TraceError::RunNotFound(run_id.to_string())),
        }
    }

    /// Node reports of one run, in the order they were produced.
    pub fn node_reports(&self, run_id: Uuid) -> Result<Vec<NodeReport>, TraceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node, op_type, status, fingerprint, records_out, cost_usd,
                    started_at, duration_ms, error
             FROM node_reports WHERE run_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut reports = Vec::new();
        for row in rows {
            let (node, op_type, status, fingerprint, records_out, cost_usd, started_at, duration_ms, error) = row?;
            reports.push(NodeReport {
                node,
                op_type,
                status: parse_status("node_reports", &status)?,
                fingerprint,
                records_out: records_out.max(0) as usize,
                cost_usd,
                started_at: parse_time("node_reports", &started_at)?,
                duration_ms,
                error,
            });
        }
        Ok(reports)
    }

    /// Runs matching `query`, most recent first.
    pub fn list_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>, TraceError> {
        let (filter, values) = query.to_sql();
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs{filter}"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), RawRunRow::from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_record()?);
        }
        Ok(runs)
    }

    /// Per-status counts for one namespace.
    pub fn summary(&self, namespace: &str) -> Result<NamespaceSummary, TraceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(total_cost_usd), 0), MAX(started_at)
             FROM runs WHERE namespace = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut summary = NamespaceSummary {
            namespace: namespace.to_string(),
            ..Default::default()
        };
        for row in rows {
            let (status, count, cost, last) = row?;
            let count = count.max(0) as u32;
            summary.total += count;
            summary.total_cost_usd += cost;
            match parse_status("runs", &status)? {
                ExecutionStatus::Running | ExecutionStatus::Pending => summary.running += count,
                ExecutionStatus::Completed | ExecutionStatus::CacheHit => summary.completed += count,
                ExecutionStatus::Failed => summary.failed += count,
                ExecutionStatus::Cancelled => summary.cancelled += count,
            }
            if let Some(last) = last {
                let last = parse_time("runs", &last)?;
                if summary.last_run_at.map_or(true, |prev| last > prev) {
                    summary.last_run_at = Some(last);
                }
            }
        }
        Ok(summary)
    }

    /// Mark runs still `running` from a previous process as failed.
    /// Returns how many rows changed.
    pub fn fail_abandoned(&self) -> Result<usize, TraceError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'failed', completed_at = ?1,
                 error = COALESCE(error, 'interrupted before completion')
             WHERE status = 'running'",
            params![timestamp(&Utc::now())],
        )?;
        if changed > 0 {
            tracing::warn!(runs = changed, "marked abandoned runs as failed");
        }
        Ok(changed)
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    // Fixed precision keeps lexical and chronological order identical.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(table: &'static str, s: &str) -> Result<DateTime<Utc>, TraceError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TraceError::CorruptRow {
            table,
            message: format!("timestamp '{s}': {e}"),
        })
}

fn parse_status(table: &'static str, s: &str) -> Result<ExecutionStatus, TraceError> {
    ExecutionStatus::parse(s).ok_or_else(|| TraceError::CorruptRow {
        table,
        message: format!("unknown status '{s}'"),
    })
}

/// Internal row struct for `runs` queries.
struct RawRunRow {
    run_id: String,
    pipeline_name: String,
    namespace: String,
    started_at: String,
    completed_at: Option<String>,
    status: String,
    total_nodes: u32,
    completed_nodes: u32,
    failed_nodes: u32,
    cache_hits: u32,
    total_cost_usd: f64,
    error: Option<String>,
}

impl RawRunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            pipeline_name: row.get(1)?,
            namespace: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            status: row.get(5)?,
            total_nodes: row.get(6)?,
            completed_nodes: row.get(7)?,
            failed_nodes: row.get(8)?,
            cache_hits: row.get(9)?,
            total_cost_usd: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<RunRecord, TraceError> {
        Ok(RunRecord {
            run_id: self.run_id.parse().map_err(|e: uuid::Error| TraceError::CorruptRow {
                table: "runs",
                message: format!("run_id: {e}"),
            })?,
            pipeline_name: self.pipeline_name,
            namespace: self.namespace,
            started_at: parse_time("runs", &self.started_at)?,
            completed_at: self
                .completed_at
                .map(|s| parse_time("runs", &s))
                .transpose()?,
            status: parse_status("runs", &self.status)?,
            total_nodes: self.total_nodes,
            completed_nodes: self.completed_nodes,
            failed_nodes: self.failed_nodes,
            cache_hits: self.cache_hits,
            total_cost_usd: self.total_cost_usd,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn report(node: &str, status: ExecutionStatus) -> NodeReport {
        NodeReport {
            node: node.into(),
            op_type: "map".into(),
            status,
            fingerprint: Some("ab".repeat(32)),
            records_out: 2,
            cost_usd: 0.01,
            started_at: Utc::now(),
            duration_ms: Some(12),
            error: None,
        }
    }

    fn finished(ns: &str, status: ExecutionStatus, age_minutes: i64) -> RunRecord {
        let mut run = RunRecord::started(Uuid::new_v4(), "pipe", ns);
        run.started_at = Utc::now() - Duration::minutes(age_minutes);
        run.finish(status, &[report("s/a", ExecutionStatus::Completed)], 0.5);
        run
    }

    #[test]
    fn record_and_reload_run() {
        let store = RunStore::in_memory().unwrap();
        let mut run = RunRecord::started(Uuid::new_v4(), "invoices", "default");
        store.record_run(&run, &[]).unwrap();
        assert_eq!(store.get_run(run.run_id).unwrap().status, ExecutionStatus::Running);

        let nodes = vec![
            report("extract/summarize", ExecutionStatus::CacheHit),
            report("score/grade", ExecutionStatus::Completed),
        ];
        run.finish(ExecutionStatus::Completed, &nodes, 0.02);
        store.record_run(&run, &nodes).unwrap();

        let loaded = store.get_run(run.run_id).unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.cache_hits, 1);
        assert_eq!(loaded.pipeline_name, "invoices");
        assert!(loaded.completed_at.is_some());

        let reports = store.node_reports(run.run_id).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].node, "extract/summarize");
        assert_eq!(reports[1].status, ExecutionStatus::Completed);
    }

    #[test]
    fn missing_run_is_reported() {
        let store = RunStore::in_memory().unwrap();
        assert!(matches!(
            store.get_run(Uuid::new_v4()),
            Err(TraceError::RunNotFound(_))
        ));
    }

    #[test]
    fn list_filters_by_namespace_and_status() {
        let store = RunStore::in_memory().unwrap();
        let old = finished("a", ExecutionStatus::Completed, 10);
        let new = finished("a", ExecutionStatus::Failed, 1);
        let other = finished("b", ExecutionStatus::Completed, 5);
        for run in [&old, &new, &other] {
            store.record_run(run, &[]).unwrap();
        }

        let all_a = store.list_runs(&RunQuery::namespace("a")).unwrap();
        assert_eq!(all_a.len(), 2);
        assert_eq!(all_a[0].run_id, new.run_id);

        let failed = store
            .list_runs(&RunQuery::namespace("a").with_status(ExecutionStatus::Failed))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].run_id, new.run_id);

        assert_eq!(store.list_runs(&RunQuery::default().with_limit(1)).unwrap().len(), 1);
    }

    #[test]
    fn summary_counts_by_status() {
        let store = RunStore::in_memory().unwrap();
        store.record_run(&finished("ns", ExecutionStatus::Completed, 3), &[]).unwrap();
        store.record_run(&finished("ns", ExecutionStatus::Completed, 2), &[]).unwrap();
        store.record_run(&finished("ns", ExecutionStatus::Cancelled, 1), &[]).unwrap();
        store
            .record_run(&RunRecord::started(Uuid::new_v4(), "pipe", "ns"), &[])
            .unwrap();

        let summary = store.summary("ns").unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.last_run_at.is_some());

        assert_eq!(store.summary("empty").unwrap().total, 0);
    }

    #[test]
    fn abandoned_runs_become_failed() {
        let store = RunStore::in_memory().unwrap();
        let run = RunRecord::started(Uuid::new_v4(), "pipe", "ns");
        store.record_run(&run, &[]).unwrap();
        assert_eq!(store.fail_abandoned().unwrap(), 1);
        let loaded = store.get_run(run.run_id).unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("interrupted before completion"));
        assert_eq!(store.fail_abandoned().unwrap(), 0);
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let run = finished("ns", ExecutionStatus::Completed, 0);
        RunStore::open(&path).unwrap().record_run(&run, &[]).unwrap();
        let reopened = RunStore::open(&path).unwrap();
        assert_eq!(reopened.get_run(run.run_id).unwrap().total_cost_usd, 0.5);
    }
}
