//! Shared execution context for one run.
//!
//! Everything the scheduler, step executor, and resume subsystem share:
//! the loaded manifest and pipeline, the store, the event emitter, the
//! workspace manager, adapter instances, the deliverable tracker, the
//! global worker-slot semaphore, and the run's cancellation token.

use crate::adapter::Adapter;
use crate::deliverables::DeliverableTracker;
use crate::emitter::EventEmitter;
use crate::storage::Storage;
use crate::workspace::WorkspaceManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wave_core::{Manifest, Pipeline, ProgressEvent};

/// Per-run execution context. Cheap to share via `Arc`.
pub struct RunContext {
    pub run_id: String,
    pub input: String,
    pub manifest: Manifest,
    pub pipeline: Pipeline,
    pub storage: Arc<Storage>,
    pub emitter: EventEmitter,
    pub workspaces: WorkspaceManager,
    pub deliverables: Arc<DeliverableTracker>,
    pub adapters: HashMap<String, Arc<dyn Adapter>>,
    /// Single cancellation context for the whole run.
    pub cancel: CancellationToken,
    /// Global worker-slot cap; every step or fan-out worker holds one
    /// permit while its adapter is live.
    pub worker_slots: Arc<Semaphore>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline.name)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Emit to all sinks (throttled) and persist lifecycle events.
    /// `stream_activity` events are not persisted: the log stays bounded
    /// and the throttled stream already reaches subscribers.
    pub async fn emit_event(&self, event: &ProgressEvent) {
        self.emitter.emit(event);
        if event.kind.is_terminal() {
            if let Err(e) = self.storage.append_event(event).await {
                warn!(run_id = %self.run_id, error = %e, "failed to persist event");
            }
        }
    }

    /// Adapter instance for a persona's adapter reference.
    pub fn adapter_for(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    /// Per-step timeout: step override or the runtime default.
    pub fn step_timeout(&self, step_timeout_minutes: Option<u64>) -> Duration {
        let minutes = step_timeout_minutes
            .unwrap_or(self.manifest.runtime.default_timeout_minutes)
            .max(1);
        Duration::from_secs(minutes * 60)
    }

    /// Curated subprocess environment: explicit passthrough variables plus
    /// PATH and HOME so the CLI can start at all.
    pub fn curated_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for var in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.to_string(), value);
            }
        }
        for var in &self.manifest.runtime.env_passthrough {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.clone(), value);
            }
        }
        env
    }
}
