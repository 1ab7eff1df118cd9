//! End-to-end pipeline execution scenarios against the mock adapter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use wave_core::{
    generate_run_id, Manifest, Pipeline, ProgressEvent, RunStatus, StepEventKind, StepStatus,
    TokenUsage,
};
use wave_engine::adapter::MockOutcome;
use wave_engine::{
    DeliverableTracker, EventEmitter, EventSink, MockAdapter, RecoveryClass, RunContext,
    Scheduler, Storage, WorkspaceManager,
};

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl CollectingSink {
    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn test_manifest() -> Manifest {
    serde_yaml::from_str(
        r#"
adapters:
  mock:
    type: mock
personas:
  builder:
    adapter: mock
  checker:
    adapter: mock
runtime:
  max_concurrent_workers: 5
  default_timeout_minutes: 5
"#,
    )
    .unwrap()
}

struct Harness {
    _dir: TempDir,
    storage: Arc<Storage>,
    adapter: Arc<MockAdapter>,
    sink: Arc<CollectingSink>,
    ctx: Arc<RunContext>,
}

async fn harness_with(
    run_id: &str,
    pipeline: Pipeline,
    input: &str,
    workers: usize,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    storage.migrate().await.unwrap();
    build_harness(dir, storage, run_id, pipeline, input, workers)
}

fn build_harness(
    dir: TempDir,
    storage: Arc<Storage>,
    run_id: &str,
    pipeline: Pipeline,
    input: &str,
    workers: usize,
) -> Harness {
    let adapter = Arc::new(MockAdapter::new());
    let sink = Arc::new(CollectingSink::default());
    let mut adapters: HashMap<String, Arc<dyn wave_engine::Adapter>> = HashMap::new();
    adapters.insert(
        "mock".to_string(),
        Arc::clone(&adapter) as Arc<dyn wave_engine::Adapter>,
    );

    let ctx = Arc::new(RunContext {
        run_id: run_id.to_string(),
        input: input.to_string(),
        manifest: test_manifest(),
        pipeline,
        storage: Arc::clone(&storage),
        emitter: EventEmitter::new(vec![Arc::clone(&sink) as Arc<dyn EventSink>]),
        workspaces: WorkspaceManager::new(dir.path().join("workspaces")),
        deliverables: Arc::new(DeliverableTracker::new()),
        adapters,
        cancel: CancellationToken::new(),
        worker_slots: Arc::new(Semaphore::new(workers)),
    });

    Harness {
        _dir: dir,
        storage,
        adapter,
        sink,
        ctx,
    }
}

fn pipeline_from_yaml(yaml: &str) -> Pipeline {
    serde_yaml::from_str(yaml).unwrap()
}

/// S1: linear handover with a passing schema contract; downstream step sees
/// the injected artifact.
#[tokio::test]
async fn happy_path_two_step_handover() {
    let schema_dir = TempDir::new().unwrap();
    let schema_path = schema_dir.path().join("a.schema.json");
    std::fs::write(
        &schema_path,
        r#"{"type":"object","properties":{"ok":{"const":true}},"required":["ok"]}"#,
    )
    .unwrap();

    let pipeline = pipeline_from_yaml(&format!(
        r#"
name: demo
steps:
  - id: step_a
    persona: builder
    exec:
      prompt: "produce the report for {{{{ input }}}}"
    output_artifacts:
      - name: a
        path: output/a.json
        type: json
    contract:
      json_schema: {}
  - id: step_b
    persona: checker
    dependencies: [step_a]
    inject_artifacts:
      - source_step: step_a
        artifact_name: a
        alias: input_a
    exec:
      prompt: "verify {{{{ artifacts.input_a }}}}"
    output_artifacts:
      - name: verdict
        path: output/verdict.json
        type: json
"#,
        schema_path.display()
    ));

    let h = harness_with("demo-11aa22bb", pipeline, "the release", 5).await;
    h.adapter.script(
        "step_a",
        vec![MockOutcome::ok("wrote a").with_file("output/a.json", r#"{"ok":true}"#)],
    );
    h.adapter.script(
        "step_b",
        vec![MockOutcome::ok("verified").with_file("output/verdict.json", r#"{"pass":true}"#)],
    );

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.failure.is_none());

    // Both steps completed in the store.
    let states = h.storage.list_step_states("demo-11aa22bb").await.unwrap();
    assert!(states.iter().all(|s| s.status == StepStatus::Completed));
    assert!(states.iter().all(|s| s.completed_at.is_some()));

    // B's workspace received the injected artifact.
    let injected = h
        .ctx
        .workspaces
        .step_dir("demo-11aa22bb", "step_b", None)
        .join("artifacts/input_a");
    assert_eq!(
        std::fs::read_to_string(injected).unwrap(),
        r#"{"ok":true}"#
    );

    // One artifact row per declared output.
    let artifacts = h.storage.list_artifacts("demo-11aa22bb").await.unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|a| a.checksum.is_some()));

    // Property: completed events equal completed step rows, both in the
    // store and at the subscriber.
    let events = h.storage.list_events("demo-11aa22bb").await.unwrap();
    let completed_events = events
        .iter()
        .filter(|e| e.kind == StepEventKind::Completed)
        .count();
    assert_eq!(completed_events, 2);
    let seen_completed = h
        .sink
        .events()
        .iter()
        .filter(|e| e.kind == StepEventKind::Completed)
        .count();
    assert_eq!(seen_completed, 2);
}

/// S2: contract failure retried once; second attempt passes.
#[tokio::test]
async fn contract_retry_succeeds_on_second_attempt() {
    let schema_dir = TempDir::new().unwrap();
    let schema_path = schema_dir.path().join("a.schema.json");
    std::fs::write(
        &schema_path,
        r#"{"type":"object","properties":{"ok":{"const":true}},"required":["ok"]}"#,
    )
    .unwrap();

    let pipeline = pipeline_from_yaml(&format!(
        r#"
name: retrydemo
steps:
  - id: step_a
    persona: builder
    exec:
      prompt: "produce it"
    output_artifacts:
      - name: a
        path: output/a.json
        type: json
    contract:
      json_schema: {}
      max_retries: 1
    on_failure: retry
"#,
        schema_path.display()
    ));

    let h = harness_with("retrydemo-0badf00d", pipeline, "x", 5).await;
    h.adapter.script(
        "step_a",
        vec![
            MockOutcome::ok("first").with_file("output/a.json", r#"{"ok":false}"#),
            MockOutcome::ok("second").with_file("output/a.json", r#"{"ok":true}"#),
        ],
    );

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let state = h
        .storage
        .get_step_state("retrydemo-0badf00d", "step_a")
        .await
        .unwrap();
    assert_eq!(state.status, StepStatus::Completed);
    assert_eq!(state.retry_count, 1);

    // A retrying event was emitted between the attempts.
    let events = h.storage.list_events("retrydemo-0badf00d").await.unwrap();
    assert!(events.iter().any(|e| e.kind == StepEventKind::Retrying));
}

/// S3: optional failure propagates skips through artifact consumers only.
#[tokio::test]
async fn optional_failure_skips_consumers_transitively() {
    let pipeline = pipeline_from_yaml(
        r#"
name: optdemo
steps:
  - id: step_a
    persona: builder
    optional: true
    exec:
      prompt: "flaky work"
    output_artifacts:
      - name: a
        path: output/a.json
  - id: step_b
    persona: builder
    dependencies: [step_a]
    inject_artifacts:
      - source_step: step_a
        artifact_name: a
    exec:
      prompt: "needs a"
  - id: step_c
    persona: builder
    dependencies: [step_b]
    inject_artifacts:
      - source_step: step_b
        artifact_name: whatever
    exec:
      prompt: "needs b"
  - id: step_d
    persona: builder
    dependencies: [step_a]
    exec:
      prompt: "independent of a's artifacts"
"#,
    );

    let h = harness_with("optdemo-deadbeef", pipeline, "x", 5).await;
    h.adapter
        .script("step_a", vec![MockOutcome::failing("adapter always fails")]);

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let states: HashMap<String, StepStatus> = h
        .storage
        .list_step_states("optdemo-deadbeef")
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id.clone(), s.status))
        .collect();

    assert_eq!(states["step_a"], StepStatus::FailedOptional);
    assert_eq!(states["step_b"], StepStatus::Skipped);
    assert_eq!(states["step_c"], StepStatus::Skipped);
    // step_d depends on step_a but injects nothing, so it runs.
    assert_eq!(states["step_d"], StepStatus::Completed);
}

/// S4: cancelling mid-run fails the in-flight step and leaves later steps
/// untouched.
#[tokio::test]
async fn cancellation_mid_run() {
    let pipeline = pipeline_from_yaml(
        r#"
name: canceldemo
steps:
  - id: step_1
    persona: builder
    exec:
      prompt: "fast"
  - id: step_2
    persona: builder
    dependencies: [step_1]
    exec:
      prompt: "slow"
  - id: step_3
    persona: builder
    dependencies: [step_2]
    exec:
      prompt: "never reached"
"#,
    );

    let h = harness_with("canceldemo-cafe0001", pipeline, "x", 5).await;
    h.adapter.script(
        "step_2",
        vec![MockOutcome::ok("never").with_delay(Duration::from_secs(60))],
    );

    let cancel = h.ctx.cancel.clone();
    let scheduler = Scheduler::new(Arc::clone(&h.ctx));
    let run_task = tokio::spawn(async move { scheduler.execute(None).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = run_task.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    let failure = result.failure.unwrap();
    assert_eq!(failure.step_id, "step_2");
    assert_eq!(failure.recovery.class, RecoveryClass::Cancelled);

    let states: HashMap<String, StepStatus> = h
        .storage
        .list_step_states("canceldemo-cafe0001")
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id.clone(), s.status))
        .collect();
    assert_eq!(states["step_1"], StepStatus::Completed);
    assert_eq!(states["step_2"], StepStatus::Failed);
    assert_eq!(states["step_3"], StepStatus::NotStarted);
}

/// S5: preflight failure carries the missing tool and maps to the
/// preflight recovery class; no scheduler work happens.
#[tokio::test]
async fn preflight_gate_blocks_run() {
    let requires = wave_core::pipeline::Requires {
        tools: vec!["wave-test-nonexistent-tool".to_string()],
        ..Default::default()
    };
    let skills = HashMap::new();

    let err = wave_engine::preflight::run(&requires, &skills, &CancellationToken::new())
        .await
        .unwrap_err();
    let block = wave_engine::recovery::from_preflight(&err, &skills);

    assert_eq!(block.class, RecoveryClass::Preflight);
    assert!(block
        .hints
        .iter()
        .any(|h| h.contains("wave-test-nonexistent-tool")));

    // The store never saw a run: preflight happens before any run id is
    // persisted.
    let storage = Storage::in_memory().await.unwrap();
    storage.migrate().await.unwrap();
    assert!(storage.list_runs(None).await.unwrap().is_empty());
}

/// S6: resume re-runs the failed step, reusing artifacts from prior
/// workspaces, and emits synthetic completed events for finished steps.
#[tokio::test]
async fn resume_from_failed_step() {
    let yaml = r#"
name: resumedemo
steps:
  - id: step_1
    persona: builder
    exec:
      prompt: "one"
    output_artifacts:
      - name: one
        path: output/one.json
        type: json
  - id: step_2
    persona: builder
    dependencies: [step_1]
    exec:
      prompt: "two"
    output_artifacts:
      - name: two
        path: output/two.json
        type: json
  - id: step_3
    persona: builder
    dependencies: [step_2]
    inject_artifacts:
      - source_step: step_1
        artifact_name: one
      - source_step: step_2
        artifact_name: two
    exec:
      prompt: "three"
    output_artifacts:
      - name: three
        path: output/three.json
        type: json
  - id: step_4
    persona: builder
    dependencies: [step_3]
    exec:
      prompt: "four"
"#;

    let run_id = "resumedemo-5eed5eed";
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    storage.migrate().await.unwrap();

    // First run: steps 1 and 2 complete, step 3 fails.
    {
        let workspace_dir = TempDir::new_in(dir.path()).unwrap();
        let h = build_harness(
            workspace_dir,
            Arc::clone(&storage),
            run_id,
            pipeline_from_yaml(yaml),
            "x",
            5,
        );
        h.adapter.script(
            "step_1",
            vec![MockOutcome::ok("1").with_file("output/one.json", r#"{"n":1}"#)],
        );
        h.adapter.script(
            "step_2",
            vec![MockOutcome::ok("2").with_file("output/two.json", r#"{"n":2}"#)],
        );
        h.adapter
            .script("step_3", vec![MockOutcome::failing("transient crash")]);

        let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        // Keep the workspace tree alive for the resumed run.
        std::mem::forget(h);
    }

    // Resumed run: same store and the original workspace root, step 3 now
    // succeeds.
    let prior_root = {
        let states = storage.list_step_states(run_id).await.unwrap();
        let step1 = states.iter().find(|s| s.step_id == "step_1").unwrap();
        let ws = step1.workspace_path.clone().unwrap();
        std::path::PathBuf::from(ws)
            .parent()
            .unwrap()
            .parent()
            .unwrap()
            .to_path_buf()
    };
    let mut adapters: HashMap<String, Arc<dyn wave_engine::Adapter>> = HashMap::new();
    let adapter = Arc::new(MockAdapter::new());
    adapters.insert(
        "mock".to_string(),
        Arc::clone(&adapter) as Arc<dyn wave_engine::Adapter>,
    );
    adapter.script(
        "step_3",
        vec![MockOutcome::ok("3").with_file("output/three.json", r#"{"n":3}"#)],
    );
    let sink = Arc::new(CollectingSink::default());
    let ctx = Arc::new(RunContext {
        run_id: run_id.to_string(),
        input: "x".to_string(),
        manifest: test_manifest(),
        pipeline: pipeline_from_yaml(yaml),
        storage: Arc::clone(&storage),
        emitter: EventEmitter::new(vec![Arc::clone(&sink) as Arc<dyn EventSink>]),
        workspaces: WorkspaceManager::new(prior_root),
        deliverables: Arc::new(DeliverableTracker::new()),
        adapters,
        cancel: CancellationToken::new(),
        worker_slots: Arc::new(Semaphore::new(5)),
    });

    let seed = wave_engine::resume::build_seed(&ctx, "step_3").await.unwrap();

    // Synthetic completed events for steps 1 and 2 arrive before new work.
    let synthetic: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == StepEventKind::Completed && e.adapter == "resume")
        .collect();
    assert_eq!(synthetic.len(), 2);

    let result = Scheduler::new(Arc::clone(&ctx)).execute(Some(seed)).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    // Prior rows for steps 1 and 2 are intact; step 3 re-ran with the
    // injected artifacts available.
    let states: HashMap<String, StepStatus> = storage
        .list_step_states(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id.clone(), s.status))
        .collect();
    assert_eq!(states["step_1"], StepStatus::Completed);
    assert_eq!(states["step_2"], StepStatus::Completed);
    assert_eq!(states["step_3"], StepStatus::Completed);
    assert_eq!(states["step_4"], StepStatus::Completed);

    let injected = ctx
        .workspaces
        .step_dir(run_id, "step_3", None)
        .join("artifacts/one");
    assert_eq!(std::fs::read_to_string(injected).unwrap(), r#"{"n":1}"#);
}

/// S7: a 20-way matrix under a 5-slot cap never exceeds 5 live adapters.
#[tokio::test]
async fn matrix_fanout_respects_concurrency_cap() {
    let tasks: Vec<String> = (0..20).map(|i| format!("task-{i}")).collect();
    let items_json = serde_json::json!({ "items": tasks }).to_string();

    let pipeline = pipeline_from_yaml(
        r#"
name: matrixdemo
steps:
  - id: seed
    persona: builder
    exec:
      prompt: "emit the task list"
    output_artifacts:
      - name: tasks
        path: output/tasks.json
        type: json
  - id: fan
    persona: builder
    dependencies: [seed]
    inject_artifacts:
      - source_step: seed
        artifact_name: tasks
    exec:
      prompt: "work on {{ task }}"
    output_artifacts:
      - name: result
        path: output/result.json
        type: json
    strategy:
      matrix:
        items:
          artifact: tasks
          key: items
        max_concurrency: 5
"#,
    );

    let h = harness_with("matrixdemo-f0f0f0f0", pipeline, "x", 5).await;
    h.adapter.script(
        "seed",
        vec![MockOutcome::ok("seeded").with_file("output/tasks.json", &items_json)],
    );
    h.adapter.script(
        "fan",
        vec![MockOutcome::ok("worked")
            .with_file("output/result.json", r#"{"done":true}"#)
            .with_delay(Duration::from_millis(30))
            .with_tokens(TokenUsage {
                input: 10,
                output: 5,
                cache_read: 0,
                cache_creation: 0,
            })],
    );

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    // 1 seed invocation + 20 matrix workers.
    assert_eq!(h.adapter.invocations(), 21);
    assert!(
        h.adapter.max_live() <= 5,
        "observed {} live adapters",
        h.adapter.max_live()
    );

    // The aggregate report reflects every worker.
    let report_path = h
        .ctx
        .workspaces
        .step_dir("matrixdemo-f0f0f0f0", "fan", None)
        .join("matrix_result.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
    assert_eq!(report["workers"], 20);
    assert_eq!(report["succeeded"], 20);
    assert_eq!(report["failed"], 0);

    // Matrix workers ran with distinct workspaces.
    let fan_dir = h.ctx.workspaces.step_dir("matrixdemo-f0f0f0f0", "fan", None);
    let worker_dirs = std::fs::read_dir(fan_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("worker_"))
        .count();
    assert_eq!(worker_dirs, 20);
}

/// Step concurrency fan-out: N identical workers, same aggregation shape.
#[tokio::test]
async fn concurrency_fanout_runs_identical_workers() {
    let pipeline = pipeline_from_yaml(
        r#"
name: condemo
steps:
  - id: par
    persona: builder
    exec:
      prompt: "same prompt everywhere"
    output_artifacts:
      - name: out
        path: output/out.txt
    concurrency: 3
"#,
    );

    let h = harness_with("condemo-12341234", pipeline, "x", 5).await;
    h.adapter.script(
        "par",
        vec![MockOutcome::ok("done").with_file("output/out.txt", "content")],
    );

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(h.adapter.invocations(), 3);

    let report_path = h
        .ctx
        .workspaces
        .step_dir("condemo-12341234", "par", None)
        .join("matrix_result.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
    assert_eq!(report["workers"], 3);
    assert_eq!(report["succeeded"], 3);
}

/// Required step failure cancels the run and surfaces a recovery block.
#[tokio::test]
async fn required_failure_fails_run_with_recovery() {
    let pipeline = pipeline_from_yaml(
        r#"
name: faildemo
steps:
  - id: boom
    persona: builder
    exec:
      prompt: "will break"
  - id: after
    persona: builder
    dependencies: [boom]
    exec:
      prompt: "never runs"
"#,
    );

    let h = harness_with("faildemo-00ff00ff", pipeline, "x", 5).await;
    h.adapter
        .script("boom", vec![MockOutcome::failing("segfault in persona")]);

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);

    let failure = result.failure.unwrap();
    assert_eq!(failure.step_id, "boom");
    assert_eq!(failure.recovery.class, RecoveryClass::AdapterExit);
    assert!(failure.recovery.hints.iter().any(|h| h.contains("file://")));

    let run = h.storage.get_run("faildemo-00ff00ff").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("boom"));

    let states: HashMap<String, StepStatus> = h
        .storage
        .list_step_states("faildemo-00ff00ff")
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id.clone(), s.status))
        .collect();
    assert_eq!(states["after"], StepStatus::NotStarted);
}

/// Concurrent runs of the same pipeline get distinct ids and disjoint
/// workspace trees.
#[tokio::test]
async fn concurrent_runs_are_disjoint() {
    let yaml = r#"
name: twin
steps:
  - id: only
    persona: builder
    exec:
      prompt: "write"
    output_artifacts:
      - name: out
        path: output/out.txt
"#;

    let id_a = generate_run_id("twin", 4);
    let id_b = generate_run_id("twin", 4);
    assert_ne!(id_a, id_b);

    let h_a = harness_with(&id_a, pipeline_from_yaml(yaml), "a", 5).await;
    let h_b = harness_with(&id_b, pipeline_from_yaml(yaml), "b", 5).await;
    h_a.adapter.script(
        "only",
        vec![MockOutcome::ok("a").with_file("output/out.txt", "from a")],
    );
    h_b.adapter.script(
        "only",
        vec![MockOutcome::ok("b").with_file("output/out.txt", "from b")],
    );

    let sched_a = Scheduler::new(Arc::clone(&h_a.ctx));
    let sched_b = Scheduler::new(Arc::clone(&h_b.ctx));
    let (ra, rb) = tokio::join!(sched_a.execute(None), sched_b.execute(None));
    assert_eq!(ra.unwrap().status, RunStatus::Completed);
    assert_eq!(rb.unwrap().status, RunStatus::Completed);

    let ws_a = h_a.ctx.workspaces.step_dir(&id_a, "only", None);
    let ws_b = h_b.ctx.workspaces.step_dir(&id_b, "only", None);
    assert_ne!(ws_a, ws_b);
    assert_eq!(
        std::fs::read_to_string(ws_a.join("output/out.txt")).unwrap(),
        "from a"
    );
    assert_eq!(
        std::fs::read_to_string(ws_b.join("output/out.txt")).unwrap(),
        "from b"
    );
}

/// Release pipelines never run release-excluded steps; validation keeps
/// them unreferenced, so the rest of the DAG proceeds normally.
#[tokio::test]
async fn release_pipeline_skips_excluded_steps() {
    let pipeline = pipeline_from_yaml(
        r#"
name: reldemo
release: true
steps:
  - id: ship
    persona: builder
    exec:
      prompt: "cut the release"
    output_artifacts:
      - name: notes
        path: output/notes.md
  - id: experiment
    persona: builder
    release: false
    exec:
      prompt: "dev-only scratch work"
"#,
    );
    assert!(pipeline.validate().is_ok());

    let h = harness_with("reldemo-aabbccdd", pipeline, "v1.2.0", 5).await;
    h.adapter.script(
        "ship",
        vec![MockOutcome::ok("released").with_file("output/notes.md", "# notes")],
    );

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    // Only the included step reached the adapter.
    assert_eq!(h.adapter.invocations(), 1);

    let states: HashMap<String, StepStatus> = h
        .storage
        .list_step_states("reldemo-aabbccdd")
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id.clone(), s.status))
        .collect();
    assert_eq!(states["ship"], StepStatus::Completed);
    assert_eq!(states["experiment"], StepStatus::Skipped);

    // The skip is announced like any other lifecycle event.
    let events = h.storage.list_events("reldemo-aabbccdd").await.unwrap();
    assert!(events.iter().any(|e| {
        e.step_id == "experiment"
            && e.kind == StepEventKind::Skipped
            && e.message
                .as_deref()
                .is_some_and(|m| m.contains("excluded from release"))
    }));
}

/// Artifact fallback: a step that never writes its declared file gets the
/// adapter's result content materialized instead.
#[tokio::test]
async fn artifact_falls_back_to_result_content() {
    let pipeline = pipeline_from_yaml(
        r#"
name: fallbackdemo
steps:
  - id: talker
    persona: builder
    exec:
      prompt: "just talk"
    output_artifacts:
      - name: notes
        path: output/notes.md
        type: markdown
"#,
    );

    let h = harness_with("fallbackdemo-abcd0001", pipeline, "x", 5).await;
    h.adapter
        .script("talker", vec![MockOutcome::ok("the conversational answer")]);

    let result = Scheduler::new(Arc::clone(&h.ctx)).execute(None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let path = h
        .ctx
        .workspaces
        .step_dir("fallbackdemo-abcd0001", "talker", None)
        .join("output/notes.md");
    assert_eq!(
        std::fs::read_to_string(path).unwrap(),
        "the conversational answer"
    );
}
