//! Run registry: cancel handles of in-flight runs, keyed by run id.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<Uuid, CancellationToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `run_id` and return its token. Registering an id twice hands
    /// out the same token.
    pub fn register(&self, run_id: Uuid) -> CancellationToken {
        self.runs
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Register `run_id` until the returned guard drops.
    pub fn guard(&self, run_id: Uuid) -> (CancellationToken, RunGuard) {
        let token = self.register(run_id);
        (
            token,
            RunGuard {
                registry: self.clone(),
                run_id,
            },
        )
    }

    /// Signal cancellation. False when the run is unknown or already finished.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(%run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, run_id: Uuid) -> bool {
        self.runs.remove(&run_id).is_some()
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.runs.contains_key(&run_id)
    }

    pub fn active(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }
}

/// Unregisters its run on drop, whichever way the run ends.
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.run_id);
    }
}
