//! DAG scheduling and run execution.
//!
//! Walks the pipeline's dependency graph with a bounded worker pool. Steps
//! become ready when every dependency reached a satisfying terminal state;
//! steps whose injected artifact sources failed-optional or were skipped
//! are skipped transitively. A required step failure cancels the run
//! context and drains in-flight workers.

use crate::context::RunContext;
use crate::executor::{self, ArtifactIndex, StepOutcome};
use crate::recovery::RecoveryBlock;
use crate::relay::RelayMonitor;
use crate::storage::StorageError;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};
use wave_core::pipeline::{OnFailure, PipelineError, Step};
use wave_core::{ProgressEvent, Run, RunStatus, StepEventKind, StepState, StepStatus};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("pipeline validation failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Details of the step failure that ended a run.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub step_id: String,
    pub persona: String,
    pub message: String,
    pub recovery: RecoveryBlock,
}

/// Terminal summary of one run.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub total_tokens: u64,
    pub failure: Option<RunFailure>,
}

/// Pre-seeded state handed over by the resume subsystem.
#[derive(Debug, Default)]
pub struct ResumeSeed {
    pub statuses: HashMap<String, StepStatus>,
    pub artifact_index: ArtifactIndex,
}

/// Executes one run of a pipeline.
#[derive(Debug)]
pub struct Scheduler {
    ctx: Arc<RunContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Run the pipeline to a terminal run status. `seed` carries resume
    /// state; fresh runs pass None.
    pub async fn execute(&self, seed: Option<ResumeSeed>) -> Result<RunResult> {
        let ctx = &self.ctx;
        ctx.pipeline.validate()?;

        let seed = seed.unwrap_or_default();
        let resuming = !seed.statuses.is_empty();
        let mut statuses: HashMap<String, StepStatus> = ctx
            .pipeline
            .steps
            .iter()
            .map(|s| {
                let status = seed
                    .statuses
                    .get(&s.id)
                    .copied()
                    .unwrap_or(StepStatus::NotStarted);
                (s.id.clone(), status)
            })
            .collect();
        let mut artifact_index: ArtifactIndex = seed.artifact_index;

        if resuming {
            ctx.storage
                .update_run_status(&ctx.run_id, RunStatus::Running)
                .await?;
        } else {
            let run = Run {
                id: ctx.run_id.clone(),
                pipeline: ctx.pipeline.name.clone(),
                input: ctx.input.clone(),
                status: RunStatus::Pending,
                started_at: Utc::now(),
                completed_at: None,
                total_tokens: 0,
                error: None,
            };
            ctx.storage.insert_run(&run).await?;
            for step in &ctx.pipeline.steps {
                ctx.storage
                    .upsert_step_state(&StepState::new(&ctx.run_id, &step.id))
                    .await?;
            }
            ctx.storage
                .update_run_status(&ctx.run_id, RunStatus::Running)
                .await?;
        }

        info!(run_id = %ctx.run_id, pipeline = %ctx.pipeline.name, "run started");

        // Release pipelines never run release-excluded steps. Validation
        // already guarantees nothing included references them.
        if ctx.pipeline.release {
            for step in &ctx.pipeline.steps {
                if step.excluded_from_release()
                    && statuses.get(&step.id) == Some(&StepStatus::NotStarted)
                {
                    statuses.insert(step.id.clone(), StepStatus::Skipped);
                    self.mark_skipped(step, "excluded from release pipelines")
                        .await?;
                }
            }
        }

        // Local step list: the base pipeline plus any relay-injected steps.
        let mut steps: Vec<Step> = ctx.pipeline.steps.clone();
        let mut relay = ctx
            .manifest
            .runtime
            .relay
            .clone()
            .map(RelayMonitor::new);
        let mut compaction_watermark: u64 = 0;

        let mut join_set: JoinSet<(String, StepOutcome)> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut total_tokens: u64 = 0;
        let mut failure: Option<RunFailure> = None;
        let mut internal_cancel = false;

        loop {
            // Schedule everything that became ready, unless the run is
            // already winding down.
            if failure.is_none() && !ctx.cancel.is_cancelled() {
                self.schedule_ready(
                    &steps,
                    &mut statuses,
                    &mut in_flight,
                    &artifact_index,
                    &mut join_set,
                )
                .await?;
            }

            if in_flight.is_empty() {
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (step_id, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "step task aborted");
                    internal_cancel = true;
                    ctx.cancel.cancel();
                    break;
                }
            };
            in_flight.remove(&step_id);
            let Some(step) = steps.iter().find(|s| s.id == step_id).cloned() else {
                continue;
            };

            match outcome {
                StepOutcome::Completed {
                    tokens, artifacts, ..
                } => {
                    statuses.insert(step_id.clone(), StepStatus::Completed);
                    total_tokens += tokens.total();
                    for (name, path) in artifacts {
                        artifact_index.insert((step_id.clone(), name), path);
                    }

                    // Relay: cross the threshold once per watermark window.
                    if let Some(monitor) = relay.as_mut() {
                        if monitor.should_compact(total_tokens - compaction_watermark) {
                            compaction_watermark = total_tokens;
                            let sources: Vec<(String, String)> = artifact_index
                                .keys()
                                .filter(|(s, _)| {
                                    statuses.get(s) == Some(&StepStatus::Completed)
                                })
                                .cloned()
                                .collect();
                            if !sources.is_empty() {
                                let checkpoint = monitor.checkpoint_step(&sources);
                                statuses
                                    .insert(checkpoint.id.clone(), StepStatus::NotStarted);
                                ctx.storage
                                    .upsert_step_state(&StepState::new(
                                        &ctx.run_id,
                                        &checkpoint.id,
                                    ))
                                    .await?;
                                steps.push(checkpoint);
                            }
                        }
                    }
                }
                StepOutcome::Failed {
                    message,
                    recovery,
                    cancelled,
                    ..
                } => {
                    if step.optional || step.on_failure == OnFailure::Skip {
                        statuses.insert(step_id.clone(), StepStatus::FailedOptional);
                        info!(step_id = %step_id, "optional step failed, run continues");
                    } else {
                        statuses.insert(step_id.clone(), StepStatus::Failed);
                        if failure.is_none() {
                            failure = Some(RunFailure {
                                step_id: step_id.clone(),
                                persona: step.persona.clone(),
                                message,
                                recovery,
                            });
                        }
                        if !cancelled {
                            internal_cancel = true;
                        }
                        // Required failure: stop pulling and drain in-flight.
                        ctx.cancel.cancel();
                    }
                }
            }
        }

        // Anything still in-flight was cancelled above; drain the set.
        while join_set.join_next().await.is_some() {}

        let user_cancelled = ctx.cancel.is_cancelled() && !internal_cancel;
        let status = if user_cancelled {
            RunStatus::Cancelled
        } else if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let error_summary = failure
            .as_ref()
            .map(|f| format!("step {} failed: {}", f.step_id, f.message));
        ctx.storage
            .seal_run(&ctx.run_id, status, total_tokens, error_summary.as_deref())
            .await?;

        info!(run_id = %ctx.run_id, status = status.as_str(), total_tokens, "run sealed");

        Ok(RunResult {
            run_id: ctx.run_id.clone(),
            status,
            total_tokens,
            failure,
        })
    }

    /// Move ready steps into the worker pool, skipping tainted ones.
    async fn schedule_ready(
        &self,
        steps: &[Step],
        statuses: &mut HashMap<String, StepStatus>,
        in_flight: &mut HashSet<String>,
        artifact_index: &ArtifactIndex,
        join_set: &mut JoinSet<(String, StepOutcome)>,
    ) -> Result<()> {
        // Loop until a pass adds nothing: skipping a step can taint
        // another one transitively.
        loop {
            let mut changed = false;

            for step in steps {
                if statuses.get(&step.id) != Some(&StepStatus::NotStarted)
                    || in_flight.contains(&step.id)
                {
                    continue;
                }

                let deps_satisfied = step.dependencies.iter().all(|dep| {
                    statuses
                        .get(dep)
                        .is_some_and(StepStatus::satisfies_dependency)
                });
                if !deps_satisfied {
                    continue;
                }

                let tainted = step.inject_artifacts.iter().any(|inject| {
                    statuses
                        .get(&inject.source_step)
                        .is_some_and(StepStatus::taints_consumers)
                });
                if tainted {
                    statuses.insert(step.id.clone(), StepStatus::Skipped);
                    self.mark_skipped(step, "upstream artifact source failed or was skipped")
                        .await?;
                    changed = true;
                    continue;
                }

                in_flight.insert(step.id.clone());
                changed = true;

                let ctx = Arc::clone(&self.ctx);
                let step = step.clone();
                let artifact_index = artifact_index.clone();
                let needs_own_permit =
                    step.matrix().is_none() && step.concurrency.is_none();
                join_set.spawn(async move {
                    // Fan-out steps manage per-worker permits themselves.
                    let _permit = if needs_own_permit {
                        ctx.worker_slots.acquire().await.ok()
                    } else {
                        None
                    };
                    let outcome = executor::execute_step(&ctx, &step, &artifact_index).await;
                    (step.id.clone(), outcome)
                });
            }

            if !changed {
                return Ok(());
            }
        }
    }

    /// Persist and announce a skipped step (no work done).
    async fn mark_skipped(&self, step: &Step, reason: &str) -> Result<()> {
        let ctx = &self.ctx;
        info!(step_id = %step.id, reason = %reason, "step skipped");

        let mut state = StepState::new(&ctx.run_id, &step.id);
        state.status = StepStatus::Skipped;
        state.completed_at = Some(Utc::now());
        ctx.storage.upsert_step_state(&state).await?;

        let event = ProgressEvent::new(
            &ctx.run_id,
            &step.id,
            StepEventKind::Skipped,
            &step.persona,
            "none",
        )
        .with_message(format!("skipped: {reason}"));
        ctx.emit_event(&event).await;
        Ok(())
    }
}
