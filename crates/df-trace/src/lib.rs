//! df-trace: run history backed by SQLite.
//!
//! Every run leaves one row in `runs` plus one row per node it touched in
//! `node_reports`, so past runs can be listed and summarized per namespace.

pub mod query;
pub mod store;

pub use query::{NamespaceSummary, RunQuery};
pub use store::RunStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

impl From<rusqlite::Error> for TraceError {
    fn from(err: rusqlite::Error) -> Self {
        TraceError::Database(err.to_string())
    }
}
