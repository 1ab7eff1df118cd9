//! Output renderers for the CLI.
//!
//! Four modes: `auto` (TTY-aware), `json` (NDJSON events on stdout with a
//! final result object), `text` (progress to stderr, result to stdout),
//! and `quiet` (final result only).

use serde::Serialize;
use std::io::Write;
use wave_core::{ProgressEvent, RunStatus, StepEventKind};
use wave_engine::{EventSink, RunResult};

/// Requested output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputMode {
    #[default]
    Auto,
    Json,
    Text,
    Quiet,
}

impl OutputMode {
    /// Resolve `auto`. The rich TTY renderer is an external front-end;
    /// the core falls back to text on both ends.
    pub fn resolved(self) -> OutputMode {
        match self {
            OutputMode::Auto => OutputMode::Text,
            other => other,
        }
    }
}

/// NDJSON sink: one event object per line on stdout.
#[derive(Debug, Default)]
pub struct JsonSink;

impl EventSink for JsonSink {
    fn on_event(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{line}");
        }
    }
}

/// Plain-text progress sink on stderr.
#[derive(Debug, Default)]
pub struct TextSink;

impl EventSink for TextSink {
    fn on_event(&self, event: &ProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let line = match event.kind {
            StepEventKind::StreamActivity => {
                let tool = event.tool_name.as_deref().unwrap_or("tool");
                let target = event.tool_target.as_deref().unwrap_or("");
                format!("  [{}] {} {}", event.step_id, tool, target)
            }
            _ => match &event.message {
                Some(message) => {
                    format!("[{}] {} ({})", event.step_id, event.kind.as_str(), message)
                }
                None => format!("[{}] {}", event.step_id, event.kind.as_str()),
            },
        };
        let _ = writeln!(stderr, "{line}");
    }
}

/// Final result object for `--output json`.
#[derive(Debug, Serialize)]
struct JsonResult<'a> {
    run_id: &'a str,
    status: &'a str,
    total_tokens: u64,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_step: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hints: Vec<&'a str>,
}

/// Map a run result to the process exit code.
pub fn exit_code_for(result: &RunResult) -> i32 {
    match result.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => 4,
        _ => match result.failure.as_ref().map(|f| f.recovery.class) {
            Some(wave_engine::RecoveryClass::ContractValidation) => 3,
            Some(wave_engine::RecoveryClass::Preflight) => 2,
            Some(wave_engine::RecoveryClass::Cancelled) => 4,
            _ => 1,
        },
    }
}

/// Render the terminal result in the requested mode.
pub fn render_result(mode: OutputMode, result: &RunResult) {
    let exit_code = exit_code_for(result);
    match mode {
        OutputMode::Json => {
            let object = JsonResult {
                run_id: &result.run_id,
                status: result.status.as_str(),
                total_tokens: result.total_tokens,
                exit_code,
                failed_step: result.failure.as_ref().map(|f| f.step_id.as_str()),
                recovery_class: result
                    .failure
                    .as_ref()
                    .map(|f| f.recovery.class.as_str()),
                hints: result
                    .failure
                    .as_ref()
                    .map(|f| f.recovery.hints.iter().map(String::as_str).collect())
                    .unwrap_or_default(),
            };
            if let Ok(line) = serde_json::to_string(&object) {
                println!("{line}");
            }
        }
        _ => {
            println!(
                "run {} {} ({} tokens)",
                result.run_id,
                result.status.as_str(),
                result.total_tokens
            );
            if let Some(failure) = &result.failure {
                println!(
                    "step {} ({}) failed: {}",
                    failure.step_id, failure.persona, failure.message
                );
                println!("recovery [{}]:", failure.recovery.class.as_str());
                for hint in &failure.recovery.hints {
                    println!("  - {hint}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_engine::{RecoveryBlock, RunFailure};

    fn result(status: RunStatus, class: Option<wave_engine::RecoveryClass>) -> RunResult {
        RunResult {
            run_id: "p-1".to_string(),
            status,
            total_tokens: 0,
            failure: class.map(|c| RunFailure {
                step_id: "s".to_string(),
                persona: "p".to_string(),
                message: "m".to_string(),
                recovery: RecoveryBlock {
                    class: c,
                    hints: vec![],
                },
            }),
        }
    }

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(exit_code_for(&result(RunStatus::Completed, None)), 0);
        assert_eq!(exit_code_for(&result(RunStatus::Cancelled, None)), 4);
        assert_eq!(
            exit_code_for(&result(
                RunStatus::Failed,
                Some(wave_engine::RecoveryClass::ContractValidation)
            )),
            3
        );
        assert_eq!(
            exit_code_for(&result(
                RunStatus::Failed,
                Some(wave_engine::RecoveryClass::Preflight)
            )),
            2
        );
        assert_eq!(
            exit_code_for(&result(
                RunStatus::Failed,
                Some(wave_engine::RecoveryClass::AdapterExit)
            )),
            1
        );
    }
}
