//! Run history queries: filters for listing runs and the per-namespace rollup.

use chrono::{DateTime, Utc};
use df_core::trace::ExecutionStatus;
use serde::Serialize;

/// Filter for [`crate::RunStore::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub namespace: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<u32>,
}

impl RunQuery {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// WHERE clause and bound parameters, most recent first.
    pub(crate) fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(ns) = &self.namespace {
            params.push(ns.clone());
            clauses.push(format!("namespace = ?{}", params.len()));
        }
        if let Some(status) = self.status {
            params.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", params.len()));
        }
        let mut sql = String::new();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC");
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        (sql, params)
    }
}

/// Counts of runs in one namespace by final status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NamespaceSummary {
    pub namespace: String,
    pub total: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub total_cost_usd: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_lists_everything() {
        let (sql, params) = RunQuery::default().to_sql();
        assert_eq!(sql, " ORDER BY started_at DESC");
        assert!(params.is_empty());
    }

    #[test]
    fn filters_are_numbered_in_order() {
        let (sql, params) = RunQuery::namespace("team-a")
            .with_status(ExecutionStatus::Failed)
            .with_limit(5)
            .to_sql();
        assert_eq!(
            sql,
            " WHERE namespace = ?1 AND status = ?2 ORDER BY started_at DESC LIMIT 5"
        );
        assert_eq!(params, vec!["team-a".to_string(), "failed".to_string()]);
    }
}
