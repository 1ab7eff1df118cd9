//! Resume: re-entering a prior run's DAG at a given step.
//!
//! Rebuilds the execution context from the store and the artifact
//! filesystem: prior step states seed the scheduler, synthetic `completed`
//! events let display backends mark finished steps, and artifact paths are
//! reconstructed by scanning each completed step's workspace for its
//! declared outputs.

use crate::context::RunContext;
use crate::executor::ArtifactIndex;
use crate::scheduler::ResumeSeed;
use crate::storage::StorageError;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use wave_core::{ProgressEvent, StepEventKind, StepState, StepStatus};

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("step {0} is not part of pipeline {1}")]
    UnknownStep(String, String),
    #[error("cannot resume from {step}: dependency {dependency} is {status}")]
    DependencyNotSatisfied {
        step: String,
        dependency: String,
        status: String,
    },
    #[error(
        "cannot resume: artifact {artifact} of step {step} is missing from {path} \
         (workspace files were removed)"
    )]
    MissingArtifact {
        step: String,
        artifact: String,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ResumeError>;

/// Build a scheduler seed that re-runs `from_step` and everything
/// downstream of it, keeping every other step's prior state.
pub async fn build_seed(ctx: &Arc<RunContext>, from_step: &str) -> Result<ResumeSeed> {
    if ctx.storage.get_run(&ctx.run_id).await.is_err() {
        return Err(ResumeError::RunNotFound(ctx.run_id.clone()));
    }
    if ctx.pipeline.step(from_step).is_none() {
        return Err(ResumeError::UnknownStep(
            from_step.to_string(),
            ctx.pipeline.name.clone(),
        ));
    }

    let prior: HashMap<String, StepState> = ctx
        .storage
        .list_step_states(&ctx.run_id)
        .await?
        .into_iter()
        .map(|s| (s.step_id.clone(), s))
        .collect();

    // Everything at or below the resume point runs again; interrupted
    // states elsewhere run again too.
    let mut rerun: HashSet<String> = ctx.pipeline.downstream_of(from_step);
    rerun.insert(from_step.to_string());
    for step in &ctx.pipeline.steps {
        let prior_status = prior.get(&step.id).map(|s| s.status);
        if !rerun.contains(&step.id)
            && !prior_status.is_some_and(|s| s.is_terminal())
        {
            rerun.insert(step.id.clone());
        }
    }

    // The resume point's dependencies must already be satisfied.
    if let Some(step) = ctx.pipeline.step(from_step) {
        for dep in &step.dependencies {
            if rerun.contains(dep) {
                continue;
            }
            let status = prior.get(dep).map_or(StepStatus::NotStarted, |s| s.status);
            if !status.satisfies_dependency() {
                return Err(ResumeError::DependencyNotSatisfied {
                    step: from_step.to_string(),
                    dependency: dep.clone(),
                    status: status.as_str().to_string(),
                });
            }
        }
    }

    let mut statuses: HashMap<String, StepStatus> = HashMap::new();
    let mut artifact_index: ArtifactIndex = HashMap::new();

    for step in &ctx.pipeline.steps {
        if rerun.contains(&step.id) {
            statuses.insert(step.id.clone(), StepStatus::NotStarted);
            ctx.storage
                .upsert_step_state(&StepState::new(&ctx.run_id, &step.id))
                .await?;
            continue;
        }

        let status = prior.get(&step.id).map_or(StepStatus::NotStarted, |s| s.status);
        statuses.insert(step.id.clone(), status);

        if status != StepStatus::Completed {
            continue;
        }

        // Reconstruct artifact paths from the prior workspace.
        let step_dir = ctx.workspaces.step_dir(&ctx.run_id, &step.id, None);
        for output in &step.output_artifacts {
            let path = step_dir.join(&output.path);
            if path.exists() {
                artifact_index.insert((step.id.clone(), output.name.clone()), path);
            } else if output.required {
                return Err(ResumeError::MissingArtifact {
                    step: step.id.clone(),
                    artifact: output.name.clone(),
                    path,
                });
            }
        }
        let fanout_report = step_dir.join("matrix_result.json");
        if fanout_report.exists() {
            artifact_index.insert(
                (step.id.clone(), "matrix_result".to_string()),
                fanout_report,
            );
        }

        // Synthetic completed event so display backends mark the step
        // done. Sinks only: the store already holds the original event.
        let event = ProgressEvent::new(
            &ctx.run_id,
            &step.id,
            StepEventKind::Completed,
            &step.persona,
            "resume",
        )
        .with_message("completed in a previous run");
        ctx.emitter.emit(&event);
        debug!(step_id = %step.id, "synthetic completed event emitted");
    }

    info!(
        run_id = %ctx.run_id,
        from_step,
        rerun = rerun.len(),
        artifacts = artifact_index.len(),
        "resume seed built"
    );

    Ok(ResumeSeed {
        statuses,
        artifact_index,
    })
}
