//! Preflight dependency checks.
//!
//! Runs once before the first step. Declared tools must resolve on the host
//! PATH; declared skills must pass their `check` command, with one
//! `install` + `init` repair attempt when those commands are declared.
//! Failures surface a structured error carrying the missing lists, which
//! maps to exit code 2.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wave_core::pipeline::Requires;
use wave_core::SkillSpec;

/// Timeout for each skill lifecycle command.
const SKILL_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("missing tools: [{}]; missing skills: [{}]", missing_tools.join(", "), missing_skills.join(", "))]
    Missing {
        missing_tools: Vec<String>,
        missing_skills: Vec<String>,
    },
    #[error("preflight cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PreflightError>;

/// Check every declared tool and skill. Collects all misses before failing
/// so the recovery block can list everything at once.
pub async fn run(
    requires: &Requires,
    skills: &HashMap<String, SkillSpec>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut missing_tools = Vec::new();
    let mut missing_skills = Vec::new();

    for tool in &requires.tools {
        if which::which(tool).is_err() {
            debug!(tool = %tool, "tool not found on PATH");
            missing_tools.push(tool.clone());
        }
    }

    for skill in &requires.skills {
        if cancel.is_cancelled() {
            return Err(PreflightError::Cancelled);
        }
        let Some(spec) = skills.get(skill) else {
            warn!(skill = %skill, "skill not declared in manifest");
            missing_skills.push(skill.clone());
            continue;
        };
        if !skill_available(skill, spec, cancel).await? {
            missing_skills.push(skill.clone());
        }
    }

    if missing_tools.is_empty() && missing_skills.is_empty() {
        Ok(())
    } else {
        Err(PreflightError::Missing {
            missing_tools,
            missing_skills,
        })
    }
}

/// Check a skill, attempting install + init once when check fails.
async fn skill_available(
    name: &str,
    spec: &SkillSpec,
    cancel: &CancellationToken,
) -> Result<bool> {
    let Some(check) = &spec.check else {
        // No check command means the skill only contributes command files.
        return Ok(true);
    };

    if run_skill_command(check, cancel).await? {
        return Ok(true);
    }

    let Some(install) = &spec.install else {
        return Ok(false);
    };

    info!(skill = name, "skill check failed, attempting install");
    if !run_skill_command(install, cancel).await? {
        return Ok(false);
    }
    if let Some(init) = &spec.init {
        if !run_skill_command(init, cancel).await? {
            return Ok(false);
        }
    }

    run_skill_command(check, cancel).await
}

/// Run one lifecycle command in a scrubbed environment. Only PATH and HOME
/// leak through; credentials never reach skill commands.
async fn run_skill_command(command: &str, cancel: &CancellationToken) -> Result<bool> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    for var in ["PATH", "HOME"] {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }

    let Ok(mut child) = cmd.spawn() else {
        return Ok(false);
    };

    tokio::select! {
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(PreflightError::Cancelled)
        }
        status = tokio::time::timeout(SKILL_COMMAND_TIMEOUT, child.wait()) => {
            match status {
                Ok(Ok(status)) => Ok(status.success()),
                _ => Ok(false),
            }
        }
    }
}
