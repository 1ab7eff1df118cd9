//! Per-step execution.
//!
//! One step attempt is: provision the workspace, inject upstream
//! artifacts, expand the prompt, drive the adapter, materialize declared
//! outputs, and gate the handover through the contract. The retry loop
//! rebuilds the workspace and feeds the previous failure back into the
//! prompt as a recovery hint. Matrix and concurrency fan-outs run the same
//! attempt machinery once per worker and aggregate the results.

use crate::adapter::{self, AdapterError, AdapterInvocation, StreamCallback};
use crate::context::RunContext;
use crate::contract;
use crate::recovery::{self, RecoveryBlock};
use crate::workspace::WorkspaceError;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use wave_core::pipeline::{OnFailure, Step, ValidationRule, WorkspaceSpec};
use wave_core::{
    ArtifactRecord, ArtifactSource, Id, Persona, ProgressEvent, StepEventKind, StepState,
    StepStatus, TemplateContext, TokenUsage,
};

/// `(step_id, artifact_name)` -> absolute artifact path. Seeded by resume,
/// extended as steps complete.
pub type ArtifactIndex = HashMap<(String, String), PathBuf>;

/// Terminal result of a step (all workers, all retries).
#[derive(Debug)]
pub enum StepOutcome {
    Completed {
        tokens: TokenUsage,
        /// Declared artifact name -> materialized path.
        artifacts: Vec<(String, PathBuf)>,
        retry_count: u32,
    },
    Failed {
        message: String,
        recovery: RecoveryBlock,
        /// True when the failure came from cancellation rather than the
        /// step itself.
        cancelled: bool,
        retry_count: u32,
    },
}

/// Identity of one fan-out worker.
#[derive(Debug, Clone)]
struct WorkerBinding {
    index: usize,
    /// Matrix item bound to `{{ task }}`, if any.
    task: Option<String>,
}

#[derive(Debug)]
struct WorkerSuccess {
    tokens: TokenUsage,
    artifacts: Vec<(String, PathBuf)>,
    retry_count: u32,
}

#[derive(Debug)]
struct WorkerFailure {
    message: String,
    recovery: RecoveryBlock,
    cancelled: bool,
    retry_count: u32,
}

/// One attempt's failure, before the retry decision.
struct AttemptFailure {
    message: String,
    recovery: RecoveryBlock,
    /// Appended to the next attempt's prompt.
    hint: String,
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct WorkerReport {
    worker: usize,
    status: &'static str,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    artifacts: Vec<String>,
}

/// Aggregate of a matrix or concurrency fan-out.
#[derive(Debug, Serialize)]
struct FanoutReport {
    step_id: String,
    workers: usize,
    succeeded: usize,
    failed: usize,
    outcomes: Vec<WorkerReport>,
}

/// Execute a step to its terminal state. Dispatches to fan-out execution
/// for matrix/concurrency steps.
pub async fn execute_step(
    ctx: &Arc<RunContext>,
    step: &Step,
    artifact_index: &ArtifactIndex,
) -> StepOutcome {
    let Some(persona) = ctx.manifest.persona(&step.persona).cloned() else {
        return StepOutcome::Failed {
            message: format!("unknown persona: {}", step.persona),
            recovery: RecoveryBlock::unknown(&format!(
                "step {} references persona '{}' which the manifest does not declare",
                step.id, step.persona
            )),
            cancelled: false,
            retry_count: 0,
        };
    };

    mark_running(ctx, step, &persona).await;

    let outcome = if step.matrix().is_some() || step.concurrency.is_some() {
        execute_fanout(ctx, step, &persona, artifact_index).await
    } else {
        let result = run_worker(ctx, step, &persona, artifact_index, None).await;
        match result {
            Ok(success) => StepOutcome::Completed {
                tokens: success.tokens,
                artifacts: success.artifacts,
                retry_count: success.retry_count,
            },
            Err(failure) => StepOutcome::Failed {
                message: failure.message,
                recovery: failure.recovery,
                cancelled: failure.cancelled,
                retry_count: failure.retry_count,
            },
        }
    };

    finalize_step(ctx, step, &persona, &outcome).await;
    outcome
}

async fn mark_running(ctx: &Arc<RunContext>, step: &Step, persona: &Persona) {
    let mut state = StepState::new(&ctx.run_id, &step.id);
    state.status = StepStatus::Running;
    state.started_at = Some(Utc::now());
    if let Err(e) = ctx.storage.upsert_step_state(&state).await {
        warn!(step_id = %step.id, error = %e, "failed to persist running state");
    }

    let mut event = ProgressEvent::new(
        &ctx.run_id,
        &step.id,
        StepEventKind::Running,
        &step.persona,
        adapter_kind_name(ctx, persona),
    );
    event.model = persona.model.clone();
    ctx.emit_event(&event).await;
}

async fn finalize_step(
    ctx: &Arc<RunContext>,
    step: &Step,
    persona: &Persona,
    outcome: &StepOutcome,
) {
    let adapter_name = adapter_kind_name(ctx, persona);
    let mut state = StepState::new(&ctx.run_id, &step.id);
    state.started_at = ctx
        .storage
        .get_step_state(&ctx.run_id, &step.id)
        .await
        .ok()
        .and_then(|s| s.started_at);
    state.completed_at = Some(Utc::now());
    state.workspace_path = Some(
        ctx.workspaces
            .step_dir(&ctx.run_id, &step.id, None)
            .to_string_lossy()
            .to_string(),
    );

    match outcome {
        StepOutcome::Completed {
            tokens,
            retry_count,
            ..
        } => {
            state.status = StepStatus::Completed;
            state.tokens = *tokens;
            state.retry_count = *retry_count;

            let event = ProgressEvent::new(
                &ctx.run_id,
                &step.id,
                StepEventKind::Completed,
                &step.persona,
                adapter_name,
            )
            .with_tokens_delta(tokens.total());
            ctx.emit_event(&event).await;
        }
        StepOutcome::Failed {
            message,
            retry_count,
            ..
        } => {
            let (status, kind) = if step.optional || step.on_failure == OnFailure::Skip {
                (StepStatus::FailedOptional, StepEventKind::FailedOptional)
            } else {
                (StepStatus::Failed, StepEventKind::Failed)
            };
            state.status = status;
            state.retry_count = *retry_count;
            state.error = Some(message.clone());

            let event = ProgressEvent::new(
                &ctx.run_id,
                &step.id,
                kind,
                &step.persona,
                adapter_name,
            )
            .with_message(message.clone());
            ctx.emit_event(&event).await;
        }
    }

    if let Err(e) = ctx.storage.upsert_step_state(&state).await {
        warn!(step_id = %step.id, error = %e, "failed to persist terminal state");
    }
}

fn adapter_kind_name(ctx: &Arc<RunContext>, persona: &Persona) -> String {
    ctx.adapter_for(&persona.adapter)
        .map_or_else(|| persona.adapter.clone(), |a| a.kind().to_string())
}

/// Run one worker (the whole retry loop for that worker instance).
async fn run_worker(
    ctx: &Arc<RunContext>,
    step: &Step,
    persona: &Persona,
    artifact_index: &ArtifactIndex,
    worker: Option<WorkerBinding>,
) -> Result<WorkerSuccess, WorkerFailure> {
    let max_retries = step.contract.as_ref().map_or(0, |c| c.max_retries);
    let retry_allowed = step.on_failure == OnFailure::Retry;
    let worker_index = worker.as_ref().map(|w| w.index);
    let spec = step.workspace.clone().unwrap_or_default();

    let mut hint: Option<String> = None;
    let mut attempt: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(WorkerFailure {
                message: "cancelled".to_string(),
                recovery: recovery::from_adapter(
                    &AdapterError::Cancelled,
                    &ctx.workspaces.step_dir(&ctx.run_id, &step.id, worker_index),
                ),
                cancelled: true,
                retry_count: attempt,
            });
        }

        let workspace = match prepare_workspace(ctx, step, &spec, worker_index, attempt) {
            Ok(dir) => dir,
            Err(e) => {
                // Workspace and worktree failures are not retryable.
                return Err(WorkerFailure {
                    message: format!("workspace setup failed: {e}"),
                    recovery: RecoveryBlock::unknown(&format!(
                        "workspace setup for step {} failed: {e}",
                        step.id
                    )),
                    cancelled: false,
                    retry_count: attempt,
                });
            }
        };

        match attempt_step(
            ctx,
            step,
            persona,
            artifact_index,
            &workspace,
            worker.as_ref(),
            hint.as_deref(),
        )
        .await
        {
            Ok(success) => {
                return Ok(WorkerSuccess {
                    tokens: success.tokens,
                    artifacts: success.artifacts,
                    retry_count: attempt,
                });
            }
            Err(failure) => {
                let retries_remaining = retry_allowed && attempt < max_retries;
                if failure.cancelled || !retries_remaining {
                    return Err(WorkerFailure {
                        message: failure.message,
                        recovery: failure.recovery,
                        cancelled: failure.cancelled,
                        retry_count: attempt,
                    });
                }

                attempt += 1;
                info!(
                    step_id = %step.id,
                    attempt,
                    max_retries,
                    "step attempt failed, retrying"
                );
                let event = ProgressEvent::new(
                    &ctx.run_id,
                    &step.id,
                    StepEventKind::Retrying,
                    &step.persona,
                    adapter_kind_name(ctx, persona),
                )
                .with_message(failure.message.clone());
                ctx.emit_event(&event).await;

                let mut state = StepState::new(&ctx.run_id, &step.id);
                state.status = StepStatus::Retrying;
                state.retry_count = attempt;
                state.error = Some(failure.message.clone());
                if let Err(e) = ctx.storage.upsert_step_state(&state).await {
                    warn!(step_id = %step.id, error = %e, "failed to persist retry state");
                }

                hint = Some(failure.hint);
            }
        }
    }
}

fn prepare_workspace(
    ctx: &Arc<RunContext>,
    step: &Step,
    spec: &WorkspaceSpec,
    worker: Option<usize>,
    attempt: u32,
) -> Result<PathBuf, WorkspaceError> {
    let workspace = if attempt == 0 {
        ctx.workspaces
            .provision(&ctx.run_id, &step.id, worker, spec)?
    } else {
        // Retries always start from a rebuilt workspace; worktree steps
        // keep the branch and reset the tree.
        ctx.workspaces.rebuild(&ctx.run_id, &step.id, worker, spec)?
    };

    // Skill command files ride along into every workspace.
    for skill_name in &ctx.pipeline.all_requirements().skills {
        if let Some(glob) = ctx
            .manifest
            .skills
            .get(skill_name)
            .and_then(|s| s.commands_glob.as_ref())
        {
            if let Err(e) = ctx.workspaces.install_skill_commands(&workspace, glob) {
                warn!(skill = %skill_name, error = %e, "skill command install failed");
            }
        }
    }

    Ok(workspace)
}

struct AttemptSuccess {
    tokens: TokenUsage,
    artifacts: Vec<(String, PathBuf)>,
}

/// One attempt: inject, expand, invoke, materialize, validate.
async fn attempt_step(
    ctx: &Arc<RunContext>,
    step: &Step,
    persona: &Persona,
    artifact_index: &ArtifactIndex,
    workspace: &Path,
    worker: Option<&WorkerBinding>,
    hint: Option<&str>,
) -> Result<AttemptSuccess, AttemptFailure> {
    // 1. Inject upstream artifacts under artifacts/<alias>.
    let mut injected: HashMap<String, String> = HashMap::new();
    for inject in &step.inject_artifacts {
        let key = (inject.source_step.clone(), inject.artifact_name.clone());
        let Some(source_path) = artifact_index.get(&key) else {
            return Err(plain_failure(format!(
                "artifact {}/{} not available for injection",
                inject.source_step, inject.artifact_name
            )));
        };
        let relative = format!("artifacts/{}", inject.alias());
        let target = workspace.join(&relative);
        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(plain_failure(format!("artifact injection failed: {e}")));
            }
        }
        if let Err(e) = std::fs::copy(source_path, &target) {
            return Err(plain_failure(format!(
                "artifact injection of {} failed: {e}",
                inject.alias()
            )));
        }
        injected.insert(inject.alias().to_string(), relative);
    }

    // 2. Build the effective prompt. Template expansion happens after
    //    injection so artifact placeholders resolve to real paths.
    let base_prompt = match &step.exec.prompt {
        Some(prompt) => prompt.clone(),
        None => match &step.exec.source_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    return Err(plain_failure(format!(
                        "failed to read prompt source {}: {e}",
                        path.display()
                    )));
                }
            },
            None => String::new(),
        },
    };

    let template_ctx = TemplateContext {
        input: ctx.input.clone(),
        task: worker.and_then(|w| w.task.clone()),
        artifacts: injected,
        timestamp: None,
    };
    let mut prompt = wave_core::expand(&base_prompt, &template_ctx);
    if let Some(hint) = hint {
        prompt.push_str("\n\nRecovery hint from the previous attempt: ");
        prompt.push_str(hint);
    }

    // 3. Invoke the adapter with a throttled progress callback.
    let Some(adapter) = ctx.adapter_for(&persona.adapter) else {
        return Err(plain_failure(format!(
            "unknown adapter: {}",
            persona.adapter
        )));
    };

    let invocation_step_id = match worker {
        Some(binding) => format!("{}#worker_{}", step.id, binding.index),
        None => step.id.clone(),
    };

    let on_stream: StreamCallback = {
        let ctx = Arc::clone(ctx);
        let step_id = step.id.clone();
        let persona_name = step.persona.clone();
        let adapter_name = adapter.kind().to_string();
        Arc::new(move |stream_event| {
            let target =
                adapter::extract_tool_target(&stream_event.tool_name, &stream_event.tool_input);
            let event = ProgressEvent::new(
                &ctx.run_id,
                &step_id,
                StepEventKind::StreamActivity,
                &persona_name,
                &adapter_name,
            )
            .with_tool(stream_event.tool_name, target);
            // Sync fan-out only; stream events are never persisted.
            ctx.emitter.emit(&event);
        })
    };

    let mut invocation = AdapterInvocation::new(invocation_step_id, workspace.to_path_buf(), prompt);
    invocation.system_prompt = resolve_system_prompt(persona);
    invocation.model = persona.model.clone();
    invocation.allowed_tools = persona.permissions.allowed_tools.clone();
    invocation.deny = persona.permissions.deny.clone();
    invocation.hooks = persona.hooks.clone();
    invocation.allowed_domains = persona
        .sandbox
        .as_ref()
        .map(|s| s.allowed_domains.clone())
        .unwrap_or_default();
    invocation.env = ctx.curated_env();
    invocation.output_paths = step
        .output_artifacts
        .iter()
        .map(|a| a.path.clone())
        .collect();
    invocation.timeout = Some(ctx.step_timeout(step.timeout_minutes));
    invocation.cancel = ctx.cancel.child_token();
    invocation.on_stream = Some(on_stream);

    let result = match adapter.run(invocation).await {
        Ok(result) => result,
        Err(error) => {
            let cancelled = matches!(error, AdapterError::Cancelled);
            let recovery = recovery::from_adapter(&error, workspace);
            return Err(AttemptFailure {
                message: error.to_string(),
                hint: format!("The previous attempt failed: {error}"),
                recovery,
                cancelled,
            });
        }
    };

    // 4. Materialize declared output artifacts. Persona-written files are
    //    trusted; the fallbacks exist for steps that only talk.
    let mut artifacts = Vec::new();
    for output in &step.output_artifacts {
        let resolved = match ctx.workspaces.resolve_in_workspace(workspace, &output.path) {
            Ok(path) => path,
            Err(e) => return Err(plain_failure(format!("bad artifact path: {e}"))),
        };

        if !resolved.exists() {
            let content = match output.source {
                ArtifactSource::Stdout => result.stdout.clone(),
                ArtifactSource::File => result.result_content.clone(),
            };
            if let Some(parent) = resolved.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(plain_failure(format!("artifact write failed: {e}")));
                }
            }
            if let Err(e) = std::fs::write(&resolved, content) {
                return Err(plain_failure(format!(
                    "artifact {} write failed: {e}",
                    output.name
                )));
            }
        }

        let stored_name = match worker {
            Some(binding) => format!("{}.worker_{}", output.name, binding.index),
            None => output.name.clone(),
        };
        let record = ArtifactRecord {
            id: Id::new(),
            run_id: ctx.run_id.clone(),
            step_id: step.id.clone(),
            name: stored_name,
            path: resolved.to_string_lossy().to_string(),
            artifact_type: output.artifact_type,
            required: output.required,
            checksum: file_checksum(&resolved),
        };
        if let Err(e) = ctx.storage.upsert_artifact(&record).await {
            warn!(artifact = %output.name, error = %e, "failed to persist artifact");
        }
        ctx.deliverables
            .record_file(&step.id, &record.path);
        artifacts.push((output.name.clone(), resolved));
    }

    // 5. Post-execution validation rules, then the handover contract.
    for rule in &step.validation {
        let ValidationRule::FileExists { path } = rule;
        let resolved = workspace.join(path);
        if !resolved.exists() {
            return Err(plain_failure(format!(
                "validation failed: expected file {path} does not exist"
            )));
        }
    }

    if let Some(contract_spec) = &step.contract {
        let (artifact_path, artifact_required) =
            contract_source(contract_spec, step, &artifacts);
        let outcome = match contract::validate(
            contract_spec,
            workspace,
            artifact_path.as_deref(),
            artifact_required,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => return Err(plain_failure(format!("contract check failed to run: {e}"))),
        };

        if !outcome.passed {
            let hint = outcome.hint();
            let recovery = recovery::from_contract(&outcome, workspace);
            return Err(AttemptFailure {
                message: "contract validation failed".to_string(),
                hint,
                recovery,
                cancelled: false,
            });
        }
    }

    debug!(step_id = %step.id, artifacts = artifacts.len(), "attempt succeeded");
    Ok(AttemptSuccess {
        tokens: result.tokens,
        artifacts,
    })
}

/// Resolve which artifact a schema contract validates.
fn contract_source(
    contract_spec: &wave_core::pipeline::Contract,
    step: &Step,
    artifacts: &[(String, PathBuf)],
) -> (Option<PathBuf>, bool) {
    let source_name = contract_spec
        .source
        .as_deref()
        .or_else(|| step.output_artifacts.first().map(|a| a.name.as_str()));
    let Some(name) = source_name else {
        return (None, true);
    };
    let path = artifacts
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, p)| p.clone());
    let required = step
        .output_artifacts
        .iter()
        .find(|a| a.name == name)
        .is_none_or(|a| a.required);
    (path, required)
}

/// Persona system prompt: the file wins over inline text when both are set.
fn resolve_system_prompt(persona: &Persona) -> Option<String> {
    if let Some(file) = &persona.system_prompt.file {
        match std::fs::read_to_string(file) {
            Ok(content) => return Some(content),
            Err(e) => {
                warn!(path = %file.display(), error = %e, "system prompt file unreadable");
            }
        }
    }
    persona.system_prompt.inline.clone()
}

fn plain_failure(message: String) -> AttemptFailure {
    AttemptFailure {
        recovery: RecoveryBlock::unknown(&message),
        hint: format!("The previous attempt failed: {message}"),
        message,
        cancelled: false,
    }
}

fn file_checksum(path: &Path) -> Option<String> {
    let content = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Some(format!("{:x}", hasher.finalize()))
}

// --- Fan-out execution ---

/// Matrix and concurrency steps: N workers through the same attempt
/// machinery, aggregated into a fan-out report artifact.
async fn execute_fanout(
    ctx: &Arc<RunContext>,
    step: &Step,
    persona: &Persona,
    artifact_index: &ArtifactIndex,
) -> StepOutcome {
    let bindings = match fanout_bindings(step, artifact_index) {
        Ok(bindings) => bindings,
        Err(message) => {
            return StepOutcome::Failed {
                recovery: RecoveryBlock::unknown(&message),
                message,
                cancelled: false,
                retry_count: 0,
            };
        }
    };

    let fan_cap = step
        .matrix()
        .map_or_else(|| bindings.len().max(1), |m| m.max_concurrency.max(1));
    let fan_slots = Arc::new(tokio::sync::Semaphore::new(fan_cap));

    let task_by_worker: HashMap<usize, Option<String>> = bindings
        .iter()
        .map(|b| (b.index, b.task.clone()))
        .collect();

    let mut join_set: JoinSet<(usize, Result<WorkerSuccess, WorkerFailure>)> = JoinSet::new();
    for binding in bindings {
        let ctx = Arc::clone(ctx);
        let step = step.clone();
        let persona = persona.clone();
        let artifact_index = artifact_index.clone();
        let fan_slots = Arc::clone(&fan_slots);
        join_set.spawn(async move {
            // Fan-out cap first, then a global worker slot. Both released
            // when the worker finishes.
            let _fan_permit = fan_slots.acquire().await.ok();
            let _global_permit = ctx.worker_slots.acquire().await.ok();
            let index = binding.index;
            let result = run_worker(&ctx, &step, &persona, &artifact_index, Some(binding)).await;
            (index, result)
        });
    }

    let mut reports: Vec<WorkerReport> = Vec::new();
    let mut merged_artifacts: Vec<(String, PathBuf)> = Vec::new();
    let mut tokens = TokenUsage::default();
    let mut first_failure: Option<WorkerFailure> = None;
    let mut max_retry = 0;

    while let Some(joined) = join_set.join_next().await {
        let Ok((index, result)) = joined else {
            continue;
        };
        match result {
            Ok(success) => {
                tokens.add(&success.tokens);
                max_retry = max_retry.max(success.retry_count);
                reports.push(WorkerReport {
                    worker: index,
                    status: "completed",
                    retry_count: success.retry_count,
                    task: task_by_worker.get(&index).cloned().flatten(),
                    error: None,
                    artifacts: success
                        .artifacts
                        .iter()
                        .map(|(_, p)| p.to_string_lossy().to_string())
                        .collect(),
                });
                for (name, path) in success.artifacts {
                    merged_artifacts.push((format!("{name}.worker_{index}"), path));
                }
            }
            Err(failure) => {
                max_retry = max_retry.max(failure.retry_count);
                reports.push(WorkerReport {
                    worker: index,
                    status: "failed",
                    retry_count: failure.retry_count,
                    task: task_by_worker.get(&index).cloned().flatten(),
                    error: Some(failure.message.clone()),
                    artifacts: Vec::new(),
                });
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
        }
    }

    reports.sort_by_key(|r| r.worker);
    let succeeded = reports.iter().filter(|r| r.status == "completed").count();
    let failed = reports.len() - succeeded;

    let report = FanoutReport {
        step_id: step.id.clone(),
        workers: reports.len(),
        succeeded,
        failed,
        outcomes: reports,
    };

    // The aggregate is itself an artifact so downstream steps can inject it.
    let report_path = ctx
        .workspaces
        .step_dir(&ctx.run_id, &step.id, None)
        .join("matrix_result.json");
    if let Ok(json) = serde_json::to_string_pretty(&report) {
        if let Some(parent) = report_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        if std::fs::write(&report_path, json).is_ok() {
            let record = ArtifactRecord {
                id: Id::new(),
                run_id: ctx.run_id.clone(),
                step_id: step.id.clone(),
                name: "matrix_result".to_string(),
                path: report_path.to_string_lossy().to_string(),
                artifact_type: wave_core::ArtifactType::Json,
                required: false,
                checksum: file_checksum(&report_path),
            };
            if let Err(e) = ctx.storage.upsert_artifact(&record).await {
                warn!(error = %e, "failed to persist fan-out report artifact");
            }
            merged_artifacts.push(("matrix_result".to_string(), report_path));
        }
    }

    match first_failure {
        None => StepOutcome::Completed {
            tokens,
            artifacts: merged_artifacts,
            retry_count: max_retry,
        },
        Some(failure) => StepOutcome::Failed {
            message: format!(
                "{failed} of {} workers failed; first failure: {}",
                report.workers, failure.message
            ),
            recovery: failure.recovery,
            cancelled: failure.cancelled,
            retry_count: max_retry,
        },
    }
}

/// Compute the worker bindings for a fan-out step.
fn fanout_bindings(
    step: &Step,
    artifact_index: &ArtifactIndex,
) -> Result<Vec<WorkerBinding>, String> {
    if let Some(matrix) = step.matrix() {
        let inject = step
            .inject_artifacts
            .iter()
            .find(|i| i.alias() == matrix.items.artifact)
            .ok_or_else(|| {
                format!(
                    "matrix items artifact '{}' is not injected into step {}",
                    matrix.items.artifact, step.id
                )
            })?;
        let key = (inject.source_step.clone(), inject.artifact_name.clone());
        let path = artifact_index
            .get(&key)
            .ok_or_else(|| format!("matrix items artifact {}/{} not available", key.0, key.1))?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read matrix items artifact: {e}"))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| format!("matrix items artifact is not JSON: {e}"))?;
        let items = value
            .get(&matrix.items.key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                format!(
                    "matrix items key '{}' is not a JSON array in {}",
                    matrix.items.key,
                    path.display()
                )
            })?;

        Ok(items
            .iter()
            .enumerate()
            .map(|(index, item)| WorkerBinding {
                index,
                task: Some(match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            })
            .collect())
    } else {
        let count = step.concurrency.unwrap_or(1).max(1);
        Ok((0..count)
            .map(|index| WorkerBinding { index, task: None })
            .collect())
    }
}
