//! wave - pipeline orchestration CLI.
//!
//! Thin command surface over the engine: load manifest and pipeline
//! documents, run preflight, execute or resume runs, and query the state
//! store. Exit codes: 0 success, 1 failure, 2 preflight, 3 contract
//! validation, 4 cancelled.

mod output;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use eyre::{bail, eyre, WrapErr};
use output::{exit_code_for, render_result, JsonSink, OutputMode, TextSink};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wave_core::{generate_run_id, Manifest, Pipeline, RunStatus, StepStatus};
use wave_engine::adapter::DEFAULT_KILL_GRACE;
use wave_engine::audit::AuditLogger;
use wave_engine::{
    CliAdapter, DeliverableTracker, EventEmitter, EventSink, MockAdapter, RunContext, RunResult,
    Scheduler, Storage, WorkspaceManager,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Pipeline orchestration for model-CLI personas.
#[derive(Parser)]
#[command(name = "wave")]
#[command(about = "Run multi-step AI pipelines under contract and permission controls")]
#[command(version)]
struct Cli {
    /// State directory (default: .wave)
    #[arg(long, global = true, env = "WAVE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Verbose engine logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a pipeline
    Run {
        /// Pipeline name (file under .wave/pipelines/)
        pipeline: String,
        /// Input string bound to {{ input }}
        input: String,
        /// Resume the latest run of this pipeline from a step
        #[arg(long)]
        from_step: Option<String>,
        /// Kill subprocesses immediately on cancel (no grace period)
        #[arg(long)]
        force: bool,
        /// Override the default step timeout in minutes
        #[arg(long)]
        timeout: Option<u64>,
        /// Use the mock adapter for every persona
        #[arg(long)]
        mock: bool,
        /// Validate and preflight only, then exit
        #[arg(long)]
        dry_run: bool,
        /// Output mode
        #[arg(long, value_enum, default_value_t = OutputMode::Auto)]
        output: OutputMode,
    },

    /// Resume a prior run from its first unfinished step
    Resume {
        run_id: String,
        #[arg(long, value_enum, default_value_t = OutputMode::Auto)]
        output: OutputMode,
        #[arg(long)]
        mock: bool,
    },

    /// Mark a run cancelled in the store
    Cancel {
        run_id: Option<String>,
        /// Accepted for compatibility; the store update is immediate
        /// either way.
        #[arg(long)]
        force: bool,
    },

    /// Show a run's status and step states
    Status { run_id: Option<String> },

    /// Print a run's event log
    Logs {
        run_id: Option<String>,
        /// Poll for new events until interrupted
        #[arg(long)]
        follow: bool,
        /// Only the last N events
        #[arg(long)]
        tail: Option<usize>,
        /// Only events newer than a duration (e.g. 30m, 2h, 1d)
        #[arg(long)]
        since: Option<String>,
        /// Only events for one step
        #[arg(long)]
        step: Option<String>,
        /// Only failure events
        #[arg(long)]
        errors: bool,
    },

    /// List a run's artifacts
    Artifacts {
        run_id: Option<String>,
        #[arg(long)]
        step: Option<String>,
        /// Copy artifact files into a directory
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// List known entities
    List {
        #[arg(value_enum)]
        what: ListTarget,
        #[arg(long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },

    /// Validate pipeline documents without running anything
    Validate {
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Delete old runs and their workspaces
    Clean {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        pipeline: Option<String>,
        /// Only runs older than a duration (e.g. 7d)
        #[arg(long)]
        older_than: Option<String>,
        /// Only runs with this status
        #[arg(long)]
        status: Option<String>,
        /// Keep the most recent N runs per pipeline
        #[arg(long)]
        keep_last: Option<usize>,
    },

    /// Manage store schema migrations
    Migrate {
        #[arg(value_enum)]
        action: MigrateAction,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListTarget {
    Runs,
    Pipelines,
    Personas,
    Adapters,
    Contracts,
    Skills,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MigrateAction {
    Status,
    Up,
    Down,
    Validate,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wave=debug,wave_engine=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let state_dir = cli.state_dir.clone().unwrap_or_else(|| PathBuf::from(".wave"));
    let code = dispatch(cli.command, &state_dir).await?;
    std::process::exit(code);
}

async fn dispatch(command: Command, state_dir: &Path) -> eyre::Result<i32> {
    match command {
        Command::Run {
            pipeline,
            input,
            from_step,
            force,
            timeout,
            mock,
            dry_run,
            output,
        } => {
            run_command(
                state_dir, &pipeline, &input, from_step, force, timeout, mock, dry_run, output,
            )
            .await
        }
        Command::Resume {
            run_id,
            output,
            mock,
        } => resume_command(state_dir, &run_id, mock, output).await,
        Command::Cancel { run_id, force: _ } => cancel_command(state_dir, run_id).await,
        Command::Status { run_id } => status_command(state_dir, run_id).await,
        Command::Logs {
            run_id,
            follow,
            tail,
            since,
            step,
            errors,
        } => logs_command(state_dir, run_id, follow, tail, since, step, errors).await,
        Command::Artifacts {
            run_id,
            step,
            export,
        } => artifacts_command(state_dir, run_id, step, export).await,
        Command::List { what, format } => list_command(state_dir, what, format).await,
        Command::Validate { pipeline } => validate_command(state_dir, pipeline),
        Command::Clean {
            all,
            pipeline,
            older_than,
            status,
            keep_last,
        } => clean_command(state_dir, all, pipeline, older_than, status, keep_last).await,
        Command::Migrate { action } => migrate_command(state_dir, action).await,
    }
}

// --- Document loading (thin: the shapes live in wave-core) ---

fn load_manifest(state_dir: &Path) -> eyre::Result<Manifest> {
    let path = state_dir.join("manifest.yaml");
    if !path.exists() {
        return Ok(Manifest::default());
    }
    let text = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn load_pipeline(state_dir: &Path, name: &str) -> eyre::Result<Pipeline> {
    let dir = state_dir.join("pipelines");
    for candidate in [
        dir.join(format!("{name}.yaml")),
        dir.join(format!("{name}.yml")),
    ] {
        if candidate.exists() {
            let text = std::fs::read_to_string(&candidate)
                .wrap_err_with(|| format!("reading {}", candidate.display()))?;
            return serde_yaml::from_str(&text)
                .wrap_err_with(|| format!("parsing {}", candidate.display()));
        }
    }
    bail!("pipeline '{name}' not found under {}", dir.display())
}

fn list_pipelines(state_dir: &Path) -> Vec<(String, eyre::Result<Pipeline>)> {
    let dir = state_dir.join("pipelines");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut pipelines = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if ext != "yaml" && ext != "yml" {
            continue;
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let parsed = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading {}", path.display()))
            .and_then(|text| {
                serde_yaml::from_str(&text)
                    .wrap_err_with(|| format!("parsing {}", path.display()))
            });
        pipelines.push((name, parsed));
    }
    pipelines.sort_by(|a, b| a.0.cmp(&b.0));
    pipelines
}

async fn open_storage(state_dir: &Path) -> eyre::Result<Arc<Storage>> {
    let storage = Storage::open(&state_dir.join("state.db")).await?;
    storage.migrate().await?;
    Ok(Arc::new(storage))
}

/// Resolve a run id argument, defaulting to the most recent run.
async fn resolve_run_id(storage: &Storage, run_id: Option<String>) -> eyre::Result<String> {
    if let Some(id) = run_id {
        return Ok(id);
    }
    storage
        .list_runs(None)
        .await?
        .first()
        .map(|r| r.id.clone())
        .ok_or_else(|| eyre!("no runs recorded yet"))
}

// --- Context assembly ---

fn build_adapters(
    manifest: &Manifest,
    mock: bool,
    force: bool,
) -> HashMap<String, Arc<dyn wave_engine::Adapter>> {
    let mut adapters: HashMap<String, Arc<dyn wave_engine::Adapter>> = HashMap::new();
    for (name, spec) in &manifest.adapters {
        let adapter: Arc<dyn wave_engine::Adapter> = if mock
            || spec.kind == wave_core::AdapterKind::Mock
        {
            Arc::new(MockAdapter::new())
        } else {
            let command = spec.command.clone().unwrap_or_else(|| name.clone());
            let grace = if force {
                Duration::ZERO
            } else {
                DEFAULT_KILL_GRACE
            };
            Arc::new(CliAdapter::new(command, spec.args.clone()).with_kill_grace(grace))
        };
        adapters.insert(name.clone(), adapter);
    }
    // Personas may reference a "mock" adapter that the manifest does not
    // spell out; --mock runs always have one.
    if mock {
        adapters
            .entry("mock".to_string())
            .or_insert_with(|| Arc::new(MockAdapter::new()));
    }
    adapters
}

#[allow(clippy::too_many_arguments)]
fn build_context(
    state_dir: &Path,
    manifest: Manifest,
    pipeline: Pipeline,
    storage: Arc<Storage>,
    run_id: String,
    input: String,
    mock: bool,
    force: bool,
    mode: OutputMode,
) -> eyre::Result<Arc<RunContext>> {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    match mode {
        OutputMode::Json => sinks.push(Arc::new(JsonSink)),
        OutputMode::Text => sinks.push(Arc::new(TextSink)),
        OutputMode::Quiet | OutputMode::Auto => {}
    }
    if manifest.runtime.audit.enabled {
        let trace_dir = manifest
            .runtime
            .audit
            .dir
            .clone()
            .unwrap_or_else(|| state_dir.join("traces"));
        match AuditLogger::init(&trace_dir) {
            Ok(logger) => {
                logger.log(&run_id, &format!("run created for pipeline {}", pipeline.name));
                // The global logger is 'static, so it doubles as a sink.
                struct GlobalAuditSink;
                impl EventSink for GlobalAuditSink {
                    fn on_event(&self, event: &wave_core::ProgressEvent) {
                        if let Some(logger) = AuditLogger::global() {
                            logger.on_event(event);
                        }
                    }
                }
                sinks.push(Arc::new(GlobalAuditSink));
            }
            Err(e) => tracing::warn!(error = %e, "audit trace disabled"),
        }
    }

    let workspace_root = manifest.runtime.workspace_root.clone();
    let workers = manifest.runtime.effective_workers();
    let adapters = build_adapters(&manifest, mock, force);

    Ok(Arc::new(RunContext {
        run_id,
        input,
        manifest,
        pipeline,
        storage,
        emitter: EventEmitter::new(sinks),
        workspaces: WorkspaceManager::new(workspace_root),
        deliverables: Arc::new(DeliverableTracker::new()),
        adapters,
        cancel: CancellationToken::new(),
        worker_slots: Arc::new(Semaphore::new(workers)),
    }))
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

// --- Commands ---

#[allow(clippy::too_many_arguments)]
async fn run_command(
    state_dir: &Path,
    pipeline_name: &str,
    input: &str,
    from_step: Option<String>,
    force: bool,
    timeout: Option<u64>,
    mock: bool,
    dry_run: bool,
    output: OutputMode,
) -> eyre::Result<i32> {
    let mode = output.resolved();
    let mut manifest = load_manifest(state_dir)?;
    if let Some(minutes) = timeout {
        manifest.runtime.default_timeout_minutes = minutes;
    }
    let pipeline = load_pipeline(state_dir, pipeline_name)?;

    if pipeline.disabled {
        bail!("pipeline '{pipeline_name}' is disabled");
    }
    if let Err(e) = pipeline.validate() {
        eprintln!("pipeline validation failed: {e}");
        return Ok(1);
    }

    // Preflight gates everything; no run id exists until it passes.
    let cancel = CancellationToken::new();
    let requirements = pipeline.all_requirements();
    if let Err(e) = wave_engine::preflight::run(&requirements, &manifest.skills, &cancel).await {
        let block = wave_engine::recovery::from_preflight(&e, &manifest.skills);
        eprintln!("preflight failed ({}):", block.class.as_str());
        for hint in &block.hints {
            eprintln!("  - {hint}");
        }
        return Ok(2);
    }
    if dry_run {
        println!("pipeline '{pipeline_name}' validated; preflight passed");
        return Ok(0);
    }

    let storage = open_storage(state_dir).await?;

    // --from-step re-enters the latest run of this pipeline.
    if let Some(step) = from_step {
        let latest = storage
            .list_runs(Some(&pipeline.name))
            .await?
            .first()
            .map(|r| r.id.clone())
            .ok_or_else(|| eyre!("no prior run of '{pipeline_name}' to resume"))?;
        return resume_run(state_dir, manifest, pipeline, storage, latest, &step, mock, mode)
            .await;
    }

    let run_id = generate_run_id(
        &pipeline.name,
        manifest.runtime.pipeline_id_hash_length,
    );
    let ctx = build_context(
        state_dir,
        manifest,
        pipeline,
        storage,
        run_id,
        input.to_string(),
        mock,
        force,
        mode,
    )?;
    spawn_ctrl_c_handler(ctx.cancel.clone());

    let result = Scheduler::new(Arc::clone(&ctx)).execute(None).await?;
    finish(mode, &result)
}

async fn resume_command(
    state_dir: &Path,
    run_id: &str,
    mock: bool,
    output: OutputMode,
) -> eyre::Result<i32> {
    let mode = output.resolved();
    let manifest = load_manifest(state_dir)?;
    let storage = open_storage(state_dir).await?;
    let run = storage.get_run(run_id).await?;
    let pipeline = load_pipeline(state_dir, &run.pipeline)?;

    // Hosts change between runs; preflight again before re-entering.
    let requirements = pipeline.all_requirements();
    let cancel = CancellationToken::new();
    if let Err(e) = wave_engine::preflight::run(&requirements, &manifest.skills, &cancel).await {
        let block = wave_engine::recovery::from_preflight(&e, &manifest.skills);
        eprintln!("preflight failed ({}):", block.class.as_str());
        for hint in &block.hints {
            eprintln!("  - {hint}");
        }
        return Ok(2);
    }

    // First unfinished step in topological order.
    let states: HashMap<String, StepStatus> = storage
        .list_step_states(run_id)
        .await?
        .into_iter()
        .map(|s| (s.step_id.clone(), s.status))
        .collect();
    let from_step = pipeline
        .topo_order()
        .map_err(|e| eyre!("pipeline no longer valid: {e}"))?
        .into_iter()
        .find(|id| {
            states
                .get(id)
                .is_none_or(|s| !s.satisfies_dependency())
        })
        .ok_or_else(|| eyre!("run {run_id} has no unfinished steps"))?;

    resume_run(
        state_dir, manifest, pipeline, storage, run_id.to_string(), &from_step, mock, mode,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn resume_run(
    state_dir: &Path,
    manifest: Manifest,
    pipeline: Pipeline,
    storage: Arc<Storage>,
    run_id: String,
    from_step: &str,
    mock: bool,
    mode: OutputMode,
) -> eyre::Result<i32> {
    let run = storage.get_run(&run_id).await?;
    let ctx = build_context(
        state_dir,
        manifest,
        pipeline,
        storage,
        run_id,
        run.input,
        mock,
        false,
        mode,
    )?;
    spawn_ctrl_c_handler(ctx.cancel.clone());

    let seed = wave_engine::resume::build_seed(&ctx, from_step)
        .await
        .wrap_err("cannot resume")?;
    let result = Scheduler::new(Arc::clone(&ctx)).execute(Some(seed)).await?;
    finish(mode, &result)
}

fn finish(mode: OutputMode, result: &RunResult) -> eyre::Result<i32> {
    render_result(mode, result);
    Ok(exit_code_for(result))
}

async fn cancel_command(state_dir: &Path, run_id: Option<String>) -> eyre::Result<i32> {
    let storage = open_storage(state_dir).await?;
    let run_id = resolve_run_id(&storage, run_id).await?;
    let run = storage.get_run(&run_id).await?;
    if run.status.is_terminal() {
        println!("run {run_id} is already {}", run.status.as_str());
        return Ok(0);
    }
    storage
        .seal_run(&run_id, RunStatus::Cancelled, run.total_tokens, Some("cancelled by user"))
        .await?;
    println!("run {run_id} marked cancelled");
    Ok(0)
}

async fn status_command(state_dir: &Path, run_id: Option<String>) -> eyre::Result<i32> {
    let storage = open_storage(state_dir).await?;
    let run_id = resolve_run_id(&storage, run_id).await?;
    let run = storage.get_run(&run_id).await?;

    println!("run:       {}", run.id);
    println!("pipeline:  {}", run.pipeline);
    println!("status:    {}", run.status.as_str());
    println!("started:   {}", run.started_at.to_rfc3339());
    if let Some(completed) = run.completed_at {
        println!("completed: {}", completed.to_rfc3339());
    }
    println!("tokens:    {}", run.total_tokens);
    if let Some(error) = &run.error {
        println!("error:     {error}");
    }

    println!();
    for state in storage.list_step_states(&run_id).await? {
        let retries = if state.retry_count > 0 {
            format!(" (retries: {})", state.retry_count)
        } else {
            String::new()
        };
        let error = state
            .error
            .as_deref()
            .map(|e| format!(" - {e}"))
            .unwrap_or_default();
        println!(
            "  {:24} {:16}{}{}",
            state.step_id,
            state.status.as_str(),
            retries,
            error
        );
    }
    Ok(0)
}

fn parse_duration_arg(text: &str) -> eyre::Result<chrono::Duration> {
    let text = text.trim();
    let (value, unit) = text.split_at(text.len().saturating_sub(1));
    let value: i64 = value.parse().wrap_err("invalid duration value")?;
    match unit {
        "m" => Ok(chrono::Duration::minutes(value)),
        "h" => Ok(chrono::Duration::hours(value)),
        "d" => Ok(chrono::Duration::days(value)),
        _ => bail!("invalid duration '{text}': use Nm, Nh, or Nd"),
    }
}

async fn logs_command(
    state_dir: &Path,
    run_id: Option<String>,
    follow: bool,
    tail: Option<usize>,
    since: Option<String>,
    step: Option<String>,
    errors: bool,
) -> eyre::Result<i32> {
    let storage = open_storage(state_dir).await?;
    let run_id = resolve_run_id(&storage, run_id).await?;
    let cutoff = since
        .map(|s| parse_duration_arg(&s))
        .transpose()?
        .map(|d| Utc::now() - d);

    let mut last_seen = None;
    loop {
        let events = match &step {
            Some(step) => storage.list_events_for_step(&run_id, step).await?,
            None => storage.list_events(&run_id).await?,
        };
        let mut filtered: Vec<_> = events
            .into_iter()
            .filter(|e| cutoff.is_none_or(|c| e.timestamp >= c))
            .filter(|e| {
                !errors
                    || matches!(
                        e.kind,
                        wave_core::StepEventKind::Failed
                            | wave_core::StepEventKind::FailedOptional
                            | wave_core::StepEventKind::Retrying
                    )
            })
            .filter(|e| last_seen.is_none_or(|t| e.timestamp > t))
            .collect();
        if let (Some(n), None) = (tail, last_seen.as_ref()) {
            let start = filtered.len().saturating_sub(n);
            filtered.drain(..start);
        }

        for event in &filtered {
            let message = event.message.as_deref().unwrap_or("");
            println!(
                "{} [{}] {} {}",
                event.timestamp.to_rfc3339(),
                event.step_id,
                event.kind.as_str(),
                message
            );
            last_seen = Some(event.timestamp);
        }

        if !follow {
            break;
        }
        let run = storage.get_run(&run_id).await?;
        if run.status.is_terminal() && filtered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Ok(0)
}

async fn artifacts_command(
    state_dir: &Path,
    run_id: Option<String>,
    step: Option<String>,
    export: Option<PathBuf>,
) -> eyre::Result<i32> {
    let storage = open_storage(state_dir).await?;
    let run_id = resolve_run_id(&storage, run_id).await?;
    let artifacts = match &step {
        Some(step) => storage.list_artifacts_for_step(&run_id, step).await?,
        None => storage.list_artifacts(&run_id).await?,
    };

    if artifacts.is_empty() {
        println!("no artifacts recorded for {run_id}");
        return Ok(0);
    }

    for artifact in &artifacts {
        println!(
            "{:16} {:24} {:8} {}",
            artifact.step_id,
            artifact.name,
            artifact.artifact_type.as_str(),
            artifact.path
        );
        if let Some(dir) = &export {
            let source = Path::new(&artifact.path);
            if source.exists() {
                let target_dir = dir.join(&artifact.step_id);
                std::fs::create_dir_all(&target_dir)?;
                let file_name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| artifact.name.clone());
                std::fs::copy(source, target_dir.join(file_name))?;
            } else {
                eprintln!("  missing on disk: {}", artifact.path);
            }
        }
    }
    Ok(0)
}

async fn list_command(
    state_dir: &Path,
    what: ListTarget,
    format: ListFormat,
) -> eyre::Result<i32> {
    let manifest = load_manifest(state_dir)?;

    let rows: Vec<serde_json::Value> = match what {
        ListTarget::Runs => {
            let storage = open_storage(state_dir).await?;
            storage
                .list_runs(None)
                .await?
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "pipeline": r.pipeline,
                        "status": r.status.as_str(),
                        "started_at": r.started_at.to_rfc3339(),
                        "tokens": r.total_tokens,
                    })
                })
                .collect()
        }
        ListTarget::Pipelines => list_pipelines(state_dir)
            .into_iter()
            .map(|(name, parsed)| match parsed {
                Ok(p) => serde_json::json!({
                    "name": name,
                    "description": p.description,
                    "steps": p.steps.len(),
                    "release": p.release,
                    "disabled": p.disabled,
                }),
                Err(e) => serde_json::json!({ "name": name, "error": e.to_string() }),
            })
            .collect(),
        ListTarget::Personas => {
            let mut names: Vec<_> = manifest.personas.iter().collect();
            names.sort_by_key(|(name, _)| (*name).clone());
            names
                .into_iter()
                .map(|(name, p)| {
                    serde_json::json!({
                        "name": name,
                        "adapter": p.adapter,
                        "model": p.model,
                        "allowed_tools": p.permissions.allowed_tools.len(),
                    })
                })
                .collect()
        }
        ListTarget::Adapters => {
            let mut names: Vec<_> = manifest.adapters.iter().collect();
            names.sort_by_key(|(name, _)| (*name).clone());
            names
                .into_iter()
                .map(|(name, a)| {
                    serde_json::json!({
                        "name": name,
                        "type": a.kind.as_str(),
                        "command": a.command,
                    })
                })
                .collect()
        }
        ListTarget::Contracts => list_pipelines(state_dir)
            .into_iter()
            .filter_map(|(name, parsed)| parsed.ok().map(|p| (name, p)))
            .flat_map(|(name, p)| {
                p.steps
                    .iter()
                    .filter_map(|s| {
                        s.contract.as_ref().map(|c| {
                            serde_json::json!({
                                "pipeline": name,
                                "step": s.id,
                                "kind": if c.json_schema.is_some() { "json_schema" } else { "command" },
                                "max_retries": c.max_retries,
                            })
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect(),
        ListTarget::Skills => {
            let mut names: Vec<_> = manifest.skills.iter().collect();
            names.sort_by_key(|(name, _)| (*name).clone());
            names
                .into_iter()
                .map(|(name, s)| {
                    serde_json::json!({
                        "name": name,
                        "check": s.check,
                        "install": s.install.is_some(),
                        "commands_glob": s.commands_glob,
                    })
                })
                .collect()
        }
    };

    match format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        ListFormat::Table => {
            for row in rows {
                if let Some(object) = row.as_object() {
                    let line: Vec<String> = object
                        .iter()
                        .map(|(k, v)| format!("{k}={}", render_scalar(v)))
                        .collect();
                    println!("{}", line.join("  "));
                }
            }
        }
    }
    Ok(0)
}

fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn validate_command(state_dir: &Path, pipeline: Option<String>) -> eyre::Result<i32> {
    let targets: Vec<(String, eyre::Result<Pipeline>)> = match pipeline {
        Some(name) => vec![(name.clone(), load_pipeline(state_dir, &name))],
        None => list_pipelines(state_dir),
    };

    if targets.is_empty() {
        println!("no pipelines found");
        return Ok(0);
    }

    let mut failed = false;
    for (name, parsed) in targets {
        match parsed.and_then(|p| p.validate().map_err(eyre::Report::from)) {
            Ok(()) => println!("{name}: ok"),
            Err(e) => {
                failed = true;
                println!("{name}: INVALID - {e}");
            }
        }
    }
    Ok(i32::from(failed))
}

async fn clean_command(
    state_dir: &Path,
    all: bool,
    pipeline: Option<String>,
    older_than: Option<String>,
    status: Option<String>,
    keep_last: Option<usize>,
) -> eyre::Result<i32> {
    if !all && pipeline.is_none() && older_than.is_none() && status.is_none() && keep_last.is_none()
    {
        bail!("refusing to delete everything; pass --all or a filter");
    }

    let manifest = load_manifest(state_dir)?;
    let storage = open_storage(state_dir).await?;
    let cutoff = older_than
        .map(|s| parse_duration_arg(&s))
        .transpose()?
        .map(|d| Utc::now() - d);

    let mut runs = storage.list_runs(pipeline.as_deref()).await?;
    // list_runs returns newest first; keep-last protects the head.
    if let Some(keep) = keep_last {
        runs.drain(..keep.min(runs.len()));
    }

    let mut removed = 0usize;
    for run in runs {
        if let Some(cutoff) = cutoff {
            if run.started_at > cutoff {
                continue;
            }
        }
        if let Some(wanted) = &status {
            if run.status.as_str() != wanted {
                continue;
            }
        }
        if !run.status.is_terminal() {
            continue;
        }

        let workspace = manifest.runtime.workspace_root.join(&run.id);
        if workspace.exists() {
            std::fs::remove_dir_all(&workspace)
                .wrap_err_with(|| format!("removing {}", workspace.display()))?;
        }
        storage.delete_run(&run.id).await?;
        println!("removed {}", run.id);
        removed += 1;
    }

    println!("{removed} run(s) removed");
    Ok(0)
}

async fn migrate_command(state_dir: &Path, action: MigrateAction) -> eyre::Result<i32> {
    match action {
        MigrateAction::Up => {
            let storage = open_storage(state_dir).await?;
            let applied = storage.applied_versions().await?;
            println!(
                "schema at version {} (latest {})",
                applied.last().copied().unwrap_or(0),
                Storage::latest_version()
            );
            Ok(0)
        }
        MigrateAction::Status => {
            let storage = Storage::open(&state_dir.join("state.db")).await?;
            let applied = storage.applied_versions().await.unwrap_or_default();
            println!("applied: {applied:?}");
            println!("latest:  {}", Storage::latest_version());
            Ok(0)
        }
        MigrateAction::Validate => {
            let storage = Storage::open(&state_dir.join("state.db")).await?;
            let applied = storage.applied_versions().await.unwrap_or_default();
            if applied.last().copied().unwrap_or(0) == Storage::latest_version() {
                println!("schema up to date");
                Ok(0)
            } else {
                println!("schema out of date; run `wave migrate up`");
                Ok(1)
            }
        }
        MigrateAction::Down => {
            bail!("down-migrations are not supported; restore from a backup instead")
        }
    }
}
