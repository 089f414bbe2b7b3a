//! Input sampling for a node under optimization.

use crate::OptimizerError;
use df_core::pipeline::PipelineConfig;
use df_core::record::Record;
use df_runner::{Executor, NodeId};

/// Copy of `config` whose datasets are truncated to at most `n` records.
pub fn sampled_config(config: &PipelineConfig, n: usize) -> PipelineConfig {
    let mut sampled = config.clone();
    let n = n.max(1);
    sampled.settings.sample_size = Some(sampled.settings.sample_size.map_or(n, |s| s.min(n)));
    sampled
}

/// The first `n` records `id` would read. Upstream nodes are pulled (and
/// cached) through `executor`; `id` itself never runs.
pub async fn sample_input(executor: &Executor, id: NodeId, n: usize) -> Result<Vec<Record>, OptimizerError> {
    let node = executor.dag().node(id);
    let input = executor.node_input(id).await?;
    if input.upstreams.len() != 1 {
        return Err(OptimizerError::Unsupported {
            node: node.name.clone(),
            reason: format!("reads {} inputs", input.upstreams.len()),
        });
    }
    let mut records = input.into_records();
    records.truncate(n.max(1));
    if records.is_empty() {
        return Err(OptimizerError::EmptySample(node.name.clone()));
    }
    Ok(records)
}
