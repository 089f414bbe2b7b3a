//! Partial re-execution: which nodes a run would execute, without running it.
//!
//! The pull starts at the terminal and stops at every node whose fingerprint
//! is cached, so a node executes only when it is missing from the cache and
//! every path to it from the terminal runs through missing nodes.

use crate::dag::{Dag, NodeId};
use crate::executor::Executor;
use crate::EngineError;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    pub node: String,
    pub fingerprint: String,
    /// Fingerprint present in the cache store.
    pub cached: bool,
    /// Executing this node dispatches model calls.
    pub llm_backed: bool,
    /// In the dirty set of the requested target.
    pub will_execute: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    /// Nodes the terminal depends on, in dependency order.
    pub entries: Vec<PlanEntry>,
    /// Names of nodes that would execute.
    pub dirty: Vec<String>,
}

impl RunPlan {
    pub fn entry(&self, node: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.node == node)
    }

    /// Executing nodes that will call a model.
    pub fn llm_nodes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.will_execute && e.llm_backed)
            .map(|e| e.node.as_str())
    }
}

/// Plan the pull of `executor`'s terminal node.
///
/// Every node the terminal depends on is reported. A cached node shadows its
/// ancestors, so ancestors reached only through cached nodes do not execute
/// even when they are missing from the cache.
pub async fn plan(executor: &Executor) -> Result<RunPlan, EngineError> {
    let dag = executor.dag();
    let needed = dag.ancestors(dag.terminal());

    let mut fingerprints = Vec::with_capacity(needed.len());
    let mut missing = HashSet::new();
    for &id in &needed {
        let fp = executor.fingerprint(id).await?;
        if !executor.cache().contains(&fp)? {
            missing.insert(id);
        }
        fingerprints.push((id, fp));
    }

    let executes = pulled_misses(dag, &missing);
    let entries: Vec<PlanEntry> = fingerprints
        .into_iter()
        .map(|(id, fingerprint)| PlanEntry {
            node: dag.node(id).name.clone(),
            cached: !missing.contains(&id),
            llm_backed: dag.node(id).op.is_llm_backed(),
            will_execute: executes.contains(&id),
            fingerprint,
        })
        .collect();
    let dirty = entries
        .iter()
        .filter(|e| e.will_execute)
        .map(|e| e.node.clone())
        .collect();
    Ok(RunPlan { entries, dirty })
}

/// Missing nodes the pull reaches: walk from the terminal, descending only
/// through missing nodes.
fn pulled_misses(dag: &Dag, missing: &HashSet<NodeId>) -> HashSet<NodeId> {
    let mut visited = HashSet::new();
    let mut executes = HashSet::new();
    let mut stack = vec![dag.terminal()];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) || !missing.contains(&id) {
            continue;
        }
        executes.insert(id);
        stack.extend(dag.node(id).upstream.iter().map(|e| e.node));
    }
    executes
}
