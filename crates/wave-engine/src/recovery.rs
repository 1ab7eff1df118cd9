//! Failure classification with actionable hints.
//!
//! Every user-visible failure carries a recovery block: a class plus hints
//! that tell the user what to do next (install commands for missing skills,
//! `file://` URIs for failing artifacts). Hints are scrubbed before they
//! leave the engine.

use crate::adapter::AdapterError;
use crate::contract::ContractOutcome;
use crate::preflight::PreflightError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use wave_core::{scrub, SkillSpec};

/// Failure classes surfaced to users and CI wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryClass {
    Preflight,
    ContractValidation,
    AdapterExit,
    Cancelled,
    Unknown,
}

impl RecoveryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::ContractValidation => "contract_validation",
            Self::AdapterExit => "adapter_exit",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// A classified failure with actionable hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryBlock {
    pub class: RecoveryClass,
    pub hints: Vec<String>,
}

impl RecoveryBlock {
    fn new(class: RecoveryClass, hints: Vec<String>) -> Self {
        Self {
            class,
            hints: hints.iter().map(|h| scrub(h)).collect(),
        }
    }

    pub fn unknown(message: &str) -> Self {
        Self::new(RecoveryClass::Unknown, vec![message.to_string()])
    }
}

/// Classify a preflight failure, enumerating each missing tool and skill
/// with its install command when the manifest declares one.
pub fn from_preflight(
    error: &PreflightError,
    skills: &HashMap<String, SkillSpec>,
) -> RecoveryBlock {
    match error {
        PreflightError::Missing {
            missing_tools,
            missing_skills,
        } => {
            let mut hints = Vec::new();
            for tool in missing_tools {
                hints.push(format!("tool '{tool}' not found on PATH; install it and re-run"));
            }
            for skill in missing_skills {
                match skills.get(skill).and_then(|s| s.install.as_ref()) {
                    Some(install) => {
                        hints.push(format!("skill '{skill}' unavailable; try: {install}"));
                    }
                    None => hints.push(format!(
                        "skill '{skill}' unavailable and declares no install command"
                    )),
                }
            }
            RecoveryBlock::new(RecoveryClass::Preflight, hints)
        }
        PreflightError::Cancelled => {
            RecoveryBlock::new(RecoveryClass::Cancelled, vec!["preflight interrupted".to_string()])
        }
    }
}

/// Classify a contract failure after retries are exhausted.
pub fn from_contract(outcome: &ContractOutcome, workspace: &Path) -> RecoveryBlock {
    let mut hints = Vec::new();
    if let Some(uri) = &outcome.artifact_uri {
        hints.push(format!("failing artifact: {uri}"));
    }
    for violation in &outcome.violations {
        if violation.path.is_empty() {
            hints.push(format!("[{}] {}", violation.kind, violation.message));
        } else {
            hints.push(format!(
                "[{} at {}] {}",
                violation.kind, violation.path, violation.message
            ));
        }
    }
    if let Some(output) = &outcome.output {
        let trimmed = output.trim();
        if !trimmed.is_empty() {
            hints.push(format!("validator output: {trimmed}"));
        }
    }
    hints.push(format!("workspace: file://{}", workspace.display()));
    RecoveryBlock::new(RecoveryClass::ContractValidation, hints)
}

/// Classify an adapter failure.
pub fn from_adapter(error: &AdapterError, workspace: &Path) -> RecoveryBlock {
    match error {
        AdapterError::Cancelled => RecoveryBlock::new(
            RecoveryClass::Cancelled,
            vec!["step interrupted before completion".to_string()],
        ),
        AdapterError::Timeout(secs) => RecoveryBlock::new(
            RecoveryClass::AdapterExit,
            vec![
                format!("adapter timed out after {secs}s; raise the step timeout or simplify the prompt"),
                format!("workspace: file://{}", workspace.display()),
            ],
        ),
        AdapterError::BinaryNotFound(binary) => RecoveryBlock::new(
            RecoveryClass::AdapterExit,
            vec![format!("adapter binary '{binary}' not found on PATH")],
        ),
        AdapterError::Exit { code, detail } => RecoveryBlock::new(
            RecoveryClass::AdapterExit,
            vec![
                format!("adapter exited with code {code}: {detail}"),
                format!("workspace: file://{}", workspace.display()),
            ],
        ),
        other => RecoveryBlock::new(
            RecoveryClass::AdapterExit,
            vec![
                other.to_string(),
                format!("workspace: file://{}", workspace.display()),
            ],
        ),
    }
}
