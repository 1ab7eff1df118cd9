//! Model-CLI subprocess adapters.
//!
//! An adapter turns a persona configuration plus a prompt into an
//! `AdapterResult`. The CLI adapter drives a real model CLI in streaming
//! NDJSON mode; the mock adapter replays scripted outcomes for tests and
//! dry runs. New vendors implement the trait, the executor never branches
//! on adapter identity.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wave_core::TokenUsage;

/// Cap on a single NDJSON line; longer lines are truncated and flagged.
pub const MAX_STREAM_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL on cancellation.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter binary not found: {0}")]
    BinaryNotFound(String),
    #[error("failed to spawn adapter: {0}")]
    Spawn(std::io::Error),
    #[error("adapter exited with code {code}: {detail}")]
    Exit { code: i32, detail: String },
    #[error("adapter timed out after {0} seconds")]
    Timeout(u64),
    #[error("adapter cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no scripted outcome for step {0}")]
    NoScript(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// A tool-use event extracted from the child's NDJSON stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub tool_name: String,
    /// Raw tool input; may be any JSON shape including null.
    pub tool_input: serde_json::Value,
}

/// Callback invoked from the stream reader for each tool-use line.
/// Must be non-blocking; throttling happens downstream.
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Everything an adapter needs for one step attempt.
#[derive(Clone)]
pub struct AdapterInvocation {
    pub step_id: String,
    pub workspace: PathBuf,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub deny: Vec<String>,
    /// Hook settings forwarded verbatim to the CLI's settings surface.
    pub hooks: Option<serde_json::Value>,
    /// Network sandbox allow-list, when the persona declares one.
    pub allowed_domains: Vec<String>,
    /// Curated environment: only explicit passthrough variables plus the
    /// auth tokens the CLI requires.
    pub env: HashMap<String, String>,
    /// Declared output paths; writes to these are auto-granted.
    pub output_paths: Vec<String>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub on_stream: Option<StreamCallback>,
}

impl std::fmt::Debug for AdapterInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterInvocation")
            .field("step_id", &self.step_id)
            .field("workspace", &self.workspace)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AdapterInvocation {
    pub fn new(step_id: impl Into<String>, workspace: PathBuf, prompt: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            workspace,
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            allowed_tools: Vec::new(),
            deny: Vec::new(),
            hooks: None,
            allowed_domains: Vec::new(),
            env: HashMap::new(),
            output_paths: Vec::new(),
            timeout: None,
            cancel: CancellationToken::new(),
            on_stream: None,
        }
    }
}

/// Outcome of one adapter invocation.
#[derive(Debug, Clone, Default)]
pub struct AdapterResult {
    /// Canonical textual result: the `result` line wins, otherwise the
    /// accumulated message content.
    pub result_content: String,
    /// Raw captured stdout, kept for fallback reads.
    pub stdout: String,
    pub tokens: TokenUsage,
    pub exit_code: i32,
    /// Set when at least one stream line exceeded the size cap.
    pub truncated_lines: bool,
}

/// Subprocess driver seam.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn run(&self, invocation: AdapterInvocation) -> Result<AdapterResult>;
}

// --- Streaming NDJSON protocol ---

#[derive(Debug, Deserialize)]
struct UsageCounters {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl UsageCounters {
    fn into_tokens(self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
            cache_read: self.cache_read_input_tokens,
            cache_creation: self.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Message {
        #[serde(default)]
        content: Option<String>,
    },
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<UsageCounters>,
    },
    #[serde(other)]
    Unknown,
}

/// Accumulates the child's NDJSON stream into an `AdapterResult`.
#[derive(Debug, Default)]
struct StreamAccumulator {
    messages: String,
    final_result: Option<String>,
    tokens: TokenUsage,
    truncated: bool,
}

impl StreamAccumulator {
    fn ingest(&mut self, line: &[u8], on_stream: Option<&StreamCallback>) {
        let parsed: StreamLine = match serde_json::from_slice(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Malformed lines never abort the stream.
                debug!(error = %e, "skipping malformed stream line");
                return;
            }
        };

        match parsed {
            StreamLine::Message { content } => {
                if let Some(content) = content {
                    if !self.messages.is_empty() {
                        self.messages.push('\n');
                    }
                    self.messages.push_str(&content);
                }
            }
            StreamLine::ToolUse { name, input } => {
                if let Some(callback) = on_stream {
                    callback(StreamEvent {
                        tool_name: name,
                        tool_input: input,
                    });
                }
            }
            StreamLine::Result { result, usage } => {
                if let Some(result) = result {
                    self.final_result = Some(result);
                }
                if let Some(usage) = usage {
                    self.tokens = usage.into_tokens();
                }
            }
            StreamLine::Unknown => {}
        }
    }

    fn result_content(&self) -> String {
        self.final_result
            .clone()
            .unwrap_or_else(|| self.messages.clone())
    }
}

// --- Tool target extraction ---

/// Ordered fallback fields scanned for a human-readable tool target.
const TARGET_FIELDS: &[&str] = &[
    "file_path",
    "url",
    "pattern",
    "command",
    "query",
    "notebook_path",
];

const BASH_TARGET_MAX: usize = 60;

/// Extract a short display target from a tool input. Total over any input
/// shape: non-objects and empty inputs yield None.
pub fn extract_tool_target(tool_name: &str, input: &serde_json::Value) -> Option<String> {
    let field_str = |field: &str| -> Option<String> {
        input
            .get(field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    };

    match tool_name.to_ascii_lowercase().as_str() {
        "bash" => field_str("command").map(|c| truncate_chars(&c, BASH_TARGET_MAX)),
        "read" | "write" | "edit" | "notebookedit" => {
            field_str("file_path").or_else(|| field_str("notebook_path"))
        }
        "webfetch" | "websearch" => field_str("url").or_else(|| field_str("query")),
        _ => TARGET_FIELDS.iter().find_map(|f| {
            field_str(f).map(|value| {
                if *f == "command" {
                    truncate_chars(&value, BASH_TARGET_MAX)
                } else {
                    value
                }
            })
        }),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// --- CLI adapter ---

/// Drives a real model CLI (claude-style flags) in streaming NDJSON mode.
#[derive(Debug, Clone)]
pub struct CliAdapter {
    command: String,
    base_args: Vec<String>,
    kill_grace: Duration,
}

impl CliAdapter {
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Zero grace means SIGKILL immediately on cancellation (`--force`).
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn build_command(&self, invocation: &AdapterInvocation) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.base_args);
        cmd.args(["--output-format", "stream-json", "--verbose"]);

        if let Some(model) = &invocation.model {
            cmd.args(["--model", model]);
        }
        if let Some(system_prompt) = &invocation.system_prompt {
            cmd.args(["--append-system-prompt", system_prompt]);
        }

        let mut allowed = invocation.allowed_tools.clone();
        // Writes to declared artifact paths are always permitted.
        for path in &invocation.output_paths {
            allowed.push(format!("Write({path})"));
        }
        if !allowed.is_empty() {
            cmd.arg("--allowedTools").arg(allowed.join(","));
        }
        if !invocation.deny.is_empty() {
            cmd.arg("--disallowedTools").arg(invocation.deny.join(","));
        }
        if let Some(hooks) = &invocation.hooks {
            let settings = serde_json::json!({ "hooks": hooks });
            if let Ok(text) = serde_json::to_string(&settings) {
                cmd.arg("--settings").arg(text);
            }
        }

        cmd.arg("-p").arg(&invocation.prompt);

        cmd.current_dir(&invocation.workspace)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !invocation.allowed_domains.is_empty() {
            // Consumed by the sandbox hook installed in the CLI settings.
            cmd.env(
                "WAVE_SANDBOX_ALLOWED_DOMAINS",
                invocation.allowed_domains.join(","),
            );
        }
        cmd
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid came from a child we own; kill with SIGTERM has
            // no memory-safety implications.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if !self.kill_grace.is_zero() {
                let graceful = tokio::time::timeout(self.kill_grace, child.wait()).await;
                if graceful.is_ok() {
                    return;
                }
            }
        }
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill adapter subprocess");
        }
        let _ = child.wait().await;
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn kind(&self) -> &'static str {
        "cli"
    }

    async fn run(&self, invocation: AdapterInvocation) -> Result<AdapterResult> {
        let mut cmd = self.build_command(&invocation);
        debug!(step_id = %invocation.step_id, command = %self.command, "spawning adapter");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AdapterError::BinaryNotFound(self.command.clone())
            } else {
                AdapterError::Spawn(e)
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AdapterError::Spawn(std::io::Error::other("child stdout not captured"))
        })?;
        let stderr = child.stderr.take();

        // Drain stderr concurrently so the child never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut reader = BufReader::new(stdout);
        let mut accumulator = StreamAccumulator::default();
        let mut raw_stdout = String::new();
        let mut line_buf: Vec<u8> = Vec::new();

        let deadline = invocation.timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            line_buf.clear();
            let read = async {
                // Bounded read: stop at newline or the line cap.
                let mut taken = (&mut reader).take(MAX_STREAM_LINE_BYTES as u64 + 1);
                taken.read_until(b'\n', &mut line_buf).await
            };

            let n = if let Some(deadline) = deadline {
                tokio::select! {
                    () = invocation.cancel.cancelled() => {
                        self.terminate(&mut child).await;
                        return Err(AdapterError::Cancelled);
                    }
                    () = tokio::time::sleep_until(deadline) => {
                        self.terminate(&mut child).await;
                        let secs = invocation.timeout.map_or(0, |t| t.as_secs());
                        return Err(AdapterError::Timeout(secs));
                    }
                    n = read => n?,
                }
            } else {
                tokio::select! {
                    () = invocation.cancel.cancelled() => {
                        self.terminate(&mut child).await;
                        return Err(AdapterError::Cancelled);
                    }
                    n = read => n?,
                }
            };

            if n == 0 {
                break;
            }

            if line_buf.len() > MAX_STREAM_LINE_BYTES {
                warn!(
                    step_id = %invocation.step_id,
                    bytes = line_buf.len(),
                    "stream line exceeds cap, truncating"
                );
                line_buf.truncate(MAX_STREAM_LINE_BYTES);
                accumulator.truncated = true;
            }

            let line = line_buf.strip_suffix(b"\n").unwrap_or(&line_buf);
            if line.is_empty() {
                continue;
            }
            raw_stdout.push_str(&String::from_utf8_lossy(line));
            raw_stdout.push('\n');
            accumulator.ingest(line, invocation.on_stream.as_ref());
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        let stderr_text = stderr_task.await.unwrap_or_default();

        if exit_code != 0 {
            let detail = if stderr_text.trim().is_empty() {
                accumulator.result_content()
            } else {
                tail_lines(&stderr_text, 20)
            };
            return Err(AdapterError::Exit {
                code: exit_code,
                detail,
            });
        }

        Ok(AdapterResult {
            result_content: accumulator.result_content(),
            stdout: raw_stdout,
            tokens: accumulator.tokens,
            exit_code,
            truncated_lines: accumulator.truncated,
        })
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

// --- Mock adapter ---

/// A scripted outcome for one mock invocation.
#[derive(Debug, Clone, Default)]
pub struct MockOutcome {
    pub result_content: String,
    /// Workspace-relative files to write before returning.
    pub files: Vec<(String, String)>,
    pub tokens: TokenUsage,
    /// When set, the invocation fails with this message.
    pub fail: Option<String>,
    /// Simulated work duration.
    pub delay: Option<Duration>,
}

impl MockOutcome {
    pub fn ok(result_content: impl Into<String>) -> Self {
        Self {
            result_content: result_content.into(),
            ..Self::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Deterministic in-process adapter for tests and `--mock` runs.
///
/// Outcomes are scripted per step id and consumed in order; the last
/// outcome repeats once the script is exhausted. Steps without a script
/// succeed with a canned result.
#[derive(Debug, Default)]
pub struct MockAdapter {
    scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    invocations: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcomes for a step id.
    pub fn script(&self, step_id: &str, outcomes: Vec<MockOutcome>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(step_id.to_string(), outcomes.into());
        }
    }

    /// Highest number of concurrently live invocations observed.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Total invocations served.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, step_id: &str) -> MockOutcome {
        let Ok(mut scripts) = self.scripts.lock() else {
            return MockOutcome::ok("ok");
        };
        // Worker invocations share the base step's script.
        let base = step_id.split('#').next().unwrap_or(step_id);
        match scripts.get_mut(base) {
            Some(queue) => {
                if queue.len() > 1 {
                    queue.pop_front().unwrap_or_else(|| MockOutcome::ok("ok"))
                } else {
                    queue.front().cloned().unwrap_or_else(|| MockOutcome::ok("ok"))
                }
            }
            None => MockOutcome::ok("ok"),
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, invocation: AdapterInvocation) -> Result<AdapterResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let outcome = self.next_outcome(&invocation.step_id);
        let result = async {
            if let Some(delay) = outcome.delay {
                tokio::select! {
                    () = invocation.cancel.cancelled() => return Err(AdapterError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            } else if invocation.cancel.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }

            if let Some(message) = outcome.fail {
                return Err(AdapterError::Exit {
                    code: 1,
                    detail: message,
                });
            }

            for (path, content) in &outcome.files {
                let target = invocation.workspace.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, content)?;
            }

            if let Some(callback) = &invocation.on_stream {
                callback(StreamEvent {
                    tool_name: "Write".to_string(),
                    tool_input: serde_json::json!({ "file_path": "output" }),
                });
            }

            Ok(AdapterResult {
                result_content: outcome.result_content,
                stdout: String::new(),
                tokens: outcome.tokens,
                exit_code: 0,
                truncated_lines: false,
            })
        }
        .await;

        self.live.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_lines_route_by_type() {
        let mut acc = StreamAccumulator::default();
        let seen: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: StreamCallback = Arc::new(move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        acc.ingest(br#"{"type":"message","content":"thinking"}"#, Some(&callback));
        acc.ingest(
            br#"{"type":"tool_use","name":"Read","input":{"file_path":"src/lib.rs"}}"#,
            Some(&callback),
        );
        acc.ingest(
            br#"{"type":"result","result":"done","usage":{"input_tokens":10,"output_tokens":5}}"#,
            Some(&callback),
        );

        assert_eq!(acc.result_content(), "done");
        assert_eq!(acc.tokens.input, 10);
        assert_eq!(acc.tokens.output, 5);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool_name, "Read");
    }

    #[test]
    fn result_line_overrides_accumulated_messages() {
        let mut acc = StreamAccumulator::default();
        acc.ingest(br#"{"type":"message","content":"partial"}"#, None);
        assert_eq!(acc.result_content(), "partial");

        acc.ingest(br#"{"type":"result","result":"final answer"}"#, None);
        assert_eq!(acc.result_content(), "final answer");
    }

    #[test]
    fn malformed_and_unknown_lines_are_skipped() {
        let mut acc = StreamAccumulator::default();
        acc.ingest(b"not json at all", None);
        acc.ingest(br#"{"type":"heartbeat","n":1}"#, None);
        acc.ingest(br#"{"no_type":true}"#, None);
        acc.ingest(br#"{"type":"message","content":"still fine"}"#, None);
        assert_eq!(acc.result_content(), "still fine");
    }

    #[test]
    fn tool_target_for_file_ops() {
        let input = json!({"file_path": "src/main.rs"});
        assert_eq!(
            extract_tool_target("Edit", &input).as_deref(),
            Some("src/main.rs")
        );
    }

    #[test]
    fn tool_target_for_bash_truncates() {
        let long_command = "x".repeat(100);
        let input = json!({ "command": long_command });
        let target = extract_tool_target("Bash", &input).unwrap();
        assert_eq!(target.len(), 60);
    }

    #[test]
    fn tool_target_for_web() {
        let input = json!({"url": "https://example.com/docs"});
        assert_eq!(
            extract_tool_target("WebFetch", &input).as_deref(),
            Some("https://example.com/docs")
        );
    }

    #[test]
    fn tool_target_fallback_scans_field_order() {
        let input = json!({"query": "rust traits", "other": 1});
        assert_eq!(
            extract_tool_target("SomeNewTool", &input).as_deref(),
            Some("rust traits")
        );
    }

    #[test]
    fn tool_target_never_panics_on_odd_input() {
        assert_eq!(extract_tool_target("Bash", &json!(null)), None);
        assert_eq!(extract_tool_target("Edit", &json!("just a string")), None);
        assert_eq!(extract_tool_target("Anything", &json!([1, 2, 3])), None);
        assert_eq!(extract_tool_target("Edit", &json!({})), None);
        assert_eq!(
            extract_tool_target("Edit", &json!({"file_path": ""})),
            None
        );
    }

    #[tokio::test]
    async fn mock_adapter_default_outcome_succeeds() {
        let adapter = MockAdapter::new();
        let dir = tempfile::tempdir().unwrap();
        let invocation =
            AdapterInvocation::new("build", dir.path().to_path_buf(), "do it");

        let result = adapter.run(invocation).await.unwrap();
        assert_eq!(result.result_content, "ok");
        assert_eq!(result.exit_code, 0);
        assert_eq!(adapter.invocations(), 1);
    }

    #[tokio::test]
    async fn mock_adapter_scripted_outcomes_consume_in_order() {
        let adapter = MockAdapter::new();
        adapter.script(
            "build",
            vec![
                MockOutcome::failing("first attempt breaks"),
                MockOutcome::ok("second attempt works"),
            ],
        );

        let dir = tempfile::tempdir().unwrap();
        let first = adapter
            .run(AdapterInvocation::new(
                "build",
                dir.path().to_path_buf(),
                "p",
            ))
            .await;
        assert!(matches!(first, Err(AdapterError::Exit { code: 1, .. })));

        let second = adapter
            .run(AdapterInvocation::new(
                "build",
                dir.path().to_path_buf(),
                "p",
            ))
            .await
            .unwrap();
        assert_eq!(second.result_content, "second attempt works");

        // Exhausted scripts repeat the last outcome.
        let third = adapter
            .run(AdapterInvocation::new(
                "build",
                dir.path().to_path_buf(),
                "p",
            ))
            .await
            .unwrap();
        assert_eq!(third.result_content, "second attempt works");
    }

    #[tokio::test]
    async fn mock_adapter_writes_scripted_files() {
        let adapter = MockAdapter::new();
        adapter.script(
            "build",
            vec![MockOutcome::ok("done").with_file("output/a.json", r#"{"ok":true}"#)],
        );

        let dir = tempfile::tempdir().unwrap();
        adapter
            .run(AdapterInvocation::new(
                "build",
                dir.path().to_path_buf(),
                "p",
            ))
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("output/a.json")).unwrap();
        assert_eq!(content, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn mock_adapter_cancellation() {
        let adapter = MockAdapter::new();
        adapter.script(
            "slow",
            vec![MockOutcome::ok("never").with_delay(Duration::from_secs(30))],
        );

        let dir = tempfile::tempdir().unwrap();
        let mut invocation =
            AdapterInvocation::new("slow", dir.path().to_path_buf(), "p");
        let cancel = CancellationToken::new();
        invocation.cancel = cancel.clone();

        let handle = tokio::spawn(async move { adapter.run(invocation).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AdapterError::Cancelled)));
    }

    #[tokio::test]
    async fn mock_adapter_tracks_live_concurrency() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.script(
            "fan",
            vec![MockOutcome::ok("ok").with_delay(Duration::from_millis(50))],
        );

        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for i in 0..4 {
            let adapter = Arc::clone(&adapter);
            let workspace = dir.path().join(format!("w{i}"));
            std::fs::create_dir_all(&workspace).unwrap();
            handles.push(tokio::spawn(async move {
                adapter
                    .run(AdapterInvocation::new("fan", workspace, "p"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(adapter.max_live(), 4);
        assert_eq!(adapter.invocations(), 4);
    }

    #[test]
    fn worker_step_ids_share_base_script() {
        let adapter = MockAdapter::new();
        adapter.script("fan", vec![MockOutcome::ok("scripted")]);
        let outcome = adapter.next_outcome("fan#worker_2");
        assert_eq!(outcome.result_content, "scripted");
    }
}
