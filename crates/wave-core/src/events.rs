//! Progress events emitted during pipeline execution.
//!
//! One event stream per run; events for a single step are totally ordered.
//! `stream_activity` is the high-frequency kind that gets throttled, every
//! other kind passes through the emitter immediately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kinds mirroring the step lifecycle plus the high-frequency
/// tool-use ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    Running,
    StreamActivity,
    Retrying,
    Completed,
    Failed,
    FailedOptional,
    Skipped,
}

impl StepEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::StreamActivity => "stream_activity",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedOptional => "failed_optional",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal kinds bypass the throttle and must never be dropped.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StreamActivity)
    }
}

/// A single progress event.
///
/// `estimated_time_ms` is always serialized, zero included, so downstream
/// consumers can rely on the field being present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub step_id: String,
    pub kind: StepEventKind,
    pub persona: String,
    pub adapter: String,
    /// Model hint, set on the first `running` event for a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_delta: Option<u64>,
    pub estimated_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Minimal event with the given kind; optional fields empty.
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        kind: StepEventKind,
        persona: impl Into<String>,
        adapter: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            kind,
            persona: persona.into(),
            adapter: adapter.into(),
            model: None,
            message: None,
            tool_name: None,
            tool_target: None,
            tokens_delta: None,
            estimated_time_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tool(
        mut self,
        name: impl Into<String>,
        target: Option<String>,
    ) -> Self {
        self.tool_name = Some(name.into());
        self.tool_target = target;
        self
    }

    pub fn with_tokens_delta(mut self, delta: u64) -> Self {
        self.tokens_delta = Some(delta);
        self
    }
}
