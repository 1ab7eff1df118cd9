//! Core types for the pipeline execution engine.
//!
//! Rows persisted by the state store and values exchanged between the
//! scheduler, adapters, and renderers all live here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for event and artifact rows.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Pipeline-run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step execution status.
///
/// Allowed transitions:
/// `not_started -> running -> {retrying -> running, completed, failed, failed_optional}`
/// and `not_started -> skipped` when an injected artifact source is tainted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    Retrying,
    Completed,
    Failed,
    FailedOptional,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedOptional => "failed_optional",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedOptional | Self::Skipped
        )
    }

    /// A satisfied dependency unblocks downstream steps.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedOptional | Self::Skipped)
    }

    /// Tainted sources force artifact consumers into `skipped`.
    pub fn taints_consumers(&self) -> bool {
        matches!(self, Self::FailedOptional | Self::Skipped)
    }

    /// Check whether `next` is a legal successor state.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Running)
                | (Self::NotStarted, Self::Skipped)
                | (Self::Running, Self::Retrying)
                | (Self::Retrying, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::FailedOptional)
        )
    }
}

/// Declared artifact content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    Text,
    Json,
    Markdown,
    Code,
    Binary,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Code => "code",
            Self::Binary => "binary",
        }
    }
}

/// Where a declared artifact's content comes from when the persona did not
/// write the file itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// The persona writes the file at the declared path (default).
    #[default]
    File,
    /// Captured subprocess stdout is written to the declared path.
    Stdout,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Stdout => "stdout",
        }
    }
}

/// Deliverable categories tracked for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableKind {
    File,
    Url,
    PullRequest,
    Branch,
    Issue,
    Log,
    Contract,
}

impl DeliverableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Url => "url",
            Self::PullRequest => "pull_request",
            Self::Branch => "branch",
            Self::Issue => "issue",
            Self::Log => "log",
            Self::Contract => "contract",
        }
    }
}

// --- Core records ---

/// Token counters reported by an adapter subprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_creation
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_creation += other.cache_creation;
    }
}

/// One execution of a pipeline.
///
/// `id` is `<pipeline_name>-<hex_suffix>` and appears in workspace paths,
/// store rows, the event stream, and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub pipeline: String,
    /// User input string passed to `{{ input }}` expansion.
    pub input: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    /// Short failure summary when the run did not complete.
    pub error: Option<String>,
}

/// Per-step state row, unique on `(run_id, step_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: String,
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub tokens: TokenUsage,
    pub workspace_path: Option<String>,
}

impl StepState {
    /// Fresh `not_started` row for a step.
    pub fn new(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            status: StepStatus::NotStarted,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
            tokens: TokenUsage::default(),
            workspace_path: None,
        }
    }
}

/// Persisted artifact row, unique on `(run_id, step_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: Id,
    pub run_id: String,
    pub step_id: String,
    pub name: String,
    /// Absolute path inside the step workspace.
    pub path: String,
    pub artifact_type: ArtifactType,
    pub required: bool,
    /// SHA-256 of the file content at materialization time.
    pub checksum: Option<String>,
}

/// User-facing output tracked during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub step_id: String,
    pub kind: DeliverableKind,
    /// Path or locator (URL, branch name, PR reference).
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
