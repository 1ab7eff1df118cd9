//! Relay / compaction hook.
//!
//! When configured, the executor checks the run's token footprint after
//! each step completion. Crossing the threshold injects a summarizer step
//! into the DAG that compacts prior artifacts into a checkpoint artifact.
//! The injected step is a normal step record: events, store rows, and
//! artifact invariants all apply to it unchanged.

use tracing::info;
use wave_core::pipeline::{ExecSpec, InjectArtifact, OutputArtifact, Step};
use wave_core::types::{ArtifactSource, ArtifactType};
use wave_core::RelaySpec;

/// Name of the checkpoint artifact the summarizer produces.
pub const CHECKPOINT_ARTIFACT: &str = "checkpoint";

/// Tracks token footprint against the relay threshold.
#[derive(Debug, Clone)]
pub struct RelayMonitor {
    spec: RelaySpec,
    checkpoints_taken: u32,
}

impl RelayMonitor {
    pub fn new(spec: RelaySpec) -> Self {
        Self {
            spec,
            checkpoints_taken: 0,
        }
    }

    /// Token count at which compaction triggers.
    pub fn threshold_tokens(&self) -> u64 {
        self.spec.context_window * u64::from(self.spec.token_threshold_percent) / 100
    }

    /// Check whether the footprint crossed the threshold.
    pub fn should_compact(&self, total_tokens: u64) -> bool {
        self.spec.strategy == "summarize_to_checkpoint"
            && total_tokens >= self.threshold_tokens()
    }

    /// Build the summarizer step to inject. `sources` lists
    /// `(step_id, artifact_name)` pairs for every artifact produced so far.
    pub fn checkpoint_step(&mut self, sources: &[(String, String)]) -> Step {
        self.checkpoints_taken += 1;
        let id = format!("relay_checkpoint_{}", self.checkpoints_taken);
        info!(step_id = %id, sources = sources.len(), "injecting compaction step");

        let inject_artifacts: Vec<InjectArtifact> = sources
            .iter()
            .map(|(step_id, name)| InjectArtifact {
                source_step: step_id.clone(),
                artifact_name: name.clone(),
                alias: Some(format!("{step_id}_{name}")),
            })
            .collect();

        let aliases: Vec<String> = inject_artifacts
            .iter()
            .map(|i| format!("artifacts/{}", i.alias()))
            .collect();

        Step {
            id,
            persona: self.spec.summarizer_persona.clone(),
            dependencies: sources.iter().map(|(step, _)| step.clone()).collect(),
            optional: false,
            memory: wave_core::pipeline::MemoryPolicy::Fresh,
            inject_artifacts,
            workspace: None,
            exec: ExecSpec {
                prompt: Some(format!(
                    "Summarize the following artifacts into a single checkpoint that \
                     preserves every decision, interface, and open item needed by later \
                     steps. Write the summary to output/checkpoint.md. Artifacts: {}",
                    aliases.join(", ")
                )),
                source_path: None,
            },
            output_artifacts: vec![OutputArtifact {
                name: CHECKPOINT_ARTIFACT.to_string(),
                path: "output/checkpoint.md".to_string(),
                artifact_type: ArtifactType::Markdown,
                required: true,
                source: ArtifactSource::File,
                schema: None,
            }],
            contract: None,
            on_failure: wave_core::pipeline::OnFailure::Fail,
            strategy: None,
            concurrency: None,
            timeout_minutes: None,
            validation: Vec::new(),
            requires: None,
            release: None,
        }
    }
}
