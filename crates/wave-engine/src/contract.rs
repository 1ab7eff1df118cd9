//! Handover contract validation.
//!
//! A contract gates the artifacts a step hands to its consumers. Two modes:
//! a JSON-Schema file validated against an artifact, or a shell command run
//! inside the workspace whose exit code is the verdict. Failures produce
//! structured violations that feed the retry prompt and, on final failure,
//! the user-facing recovery block.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use wave_core::pipeline::Contract;

/// Timeout for command contracts.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read schema {path}: {source}")]
    SchemaRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("schema {path} is not valid JSON: {source}")]
    SchemaParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("schema {path} is not a valid JSON Schema: {detail}")]
    SchemaInvalid { path: PathBuf, detail: String },
    #[error("failed to read artifact {path}: {source}")]
    ArtifactRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to run contract command: {0}")]
    CommandSpawn(std::io::Error),
    #[error("contract command timed out after {0:?}")]
    CommandTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, ContractError>;

/// One structured validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractViolation {
    /// JSON pointer into the artifact (schema mode) or empty (command mode).
    pub path: String,
    /// Failing schema keyword or failure class.
    pub kind: String,
    pub message: String,
}

/// Verdict of one contract check.
#[derive(Debug, Clone)]
pub struct ContractOutcome {
    pub passed: bool,
    pub violations: Vec<ContractViolation>,
    /// Artifact the schema checked, `file://`-prefixed, when applicable.
    pub artifact_uri: Option<String>,
    /// Captured command output on failure, fed back as a recovery hint.
    pub output: Option<String>,
}

impl ContractOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
            artifact_uri: None,
            output: None,
        }
    }

    /// Render the outcome as a recovery hint for the next attempt's prompt.
    pub fn hint(&self) -> String {
        if self.passed {
            return String::new();
        }
        let mut hint = String::from("The previous attempt failed contract validation.");
        if let Some(uri) = &self.artifact_uri {
            hint.push_str(&format!(" Artifact: {uri}."));
        }
        for violation in &self.violations {
            if violation.path.is_empty() {
                hint.push_str(&format!(" [{}] {}", violation.kind, violation.message));
            } else {
                hint.push_str(&format!(
                    " [{} at {}] {}",
                    violation.kind, violation.path, violation.message
                ));
            }
        }
        if let Some(output) = &self.output {
            let trimmed = output.trim();
            if !trimmed.is_empty() {
                hint.push_str(&format!(" Validator output: {trimmed}"));
            }
        }
        hint
    }
}

/// Validate a step's contract inside its workspace.
///
/// `artifact_path` is the resolved path of the artifact the schema applies
/// to; `artifact_required` controls whether a missing file fails.
pub async fn validate(
    contract: &Contract,
    workspace: &Path,
    artifact_path: Option<&Path>,
    artifact_required: bool,
) -> Result<ContractOutcome> {
    if let Some(schema_rel) = &contract.json_schema {
        let outcome =
            validate_schema(schema_rel, workspace, artifact_path, artifact_required)?;
        if !outcome.passed {
            return Ok(outcome);
        }
    }

    if let Some(command) = &contract.command {
        return validate_command(command, workspace).await;
    }

    Ok(ContractOutcome::pass())
}

fn validate_schema(
    schema_rel: &Path,
    workspace: &Path,
    artifact_path: Option<&Path>,
    artifact_required: bool,
) -> Result<ContractOutcome> {
    let schema_path = if schema_rel.is_absolute() {
        schema_rel.to_path_buf()
    } else {
        workspace.join(schema_rel)
    };

    let schema_text =
        std::fs::read_to_string(&schema_path).map_err(|source| ContractError::SchemaRead {
            path: schema_path.clone(),
            source,
        })?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|source| ContractError::SchemaParse {
            path: schema_path.clone(),
            source,
        })?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ContractError::SchemaInvalid {
            path: schema_path.clone(),
            detail: e.to_string(),
        })?;

    let Some(artifact_path) = artifact_path else {
        // Nothing to validate against; treat as pass (no declared source).
        return Ok(ContractOutcome::pass());
    };

    if !artifact_path.exists() {
        if !artifact_required {
            // Absent optional artifacts are not contract failures.
            return Ok(ContractOutcome::pass());
        }
        return Ok(ContractOutcome {
            passed: false,
            violations: vec![ContractViolation {
                path: String::new(),
                kind: "missing_artifact".to_string(),
                message: "required artifact file does not exist".to_string(),
            }],
            artifact_uri: Some(file_uri(artifact_path)),
            output: None,
        });
    }

    let artifact_text =
        std::fs::read_to_string(artifact_path).map_err(|source| ContractError::ArtifactRead {
            path: artifact_path.to_path_buf(),
            source,
        })?;
    let instance: serde_json::Value = match serde_json::from_str(&artifact_text) {
        Ok(value) => value,
        Err(e) => {
            return Ok(ContractOutcome {
                passed: false,
                violations: vec![ContractViolation {
                    path: String::new(),
                    kind: "invalid_json".to_string(),
                    message: e.to_string(),
                }],
                artifact_uri: Some(file_uri(artifact_path)),
                output: None,
            });
        }
    };

    let violations: Vec<ContractViolation> = validator
        .iter_errors(&instance)
        .map(|error| ContractViolation {
            path: error.instance_path.to_string(),
            kind: keyword_of(&error),
            message: error.to_string(),
        })
        .collect();

    debug!(
        artifact = %artifact_path.display(),
        violations = violations.len(),
        "schema contract checked"
    );

    Ok(ContractOutcome {
        passed: violations.is_empty(),
        violations,
        artifact_uri: Some(file_uri(artifact_path)),
        output: None,
    })
}

fn keyword_of(error: &jsonschema::ValidationError<'_>) -> String {
    // The kind debug form starts with the failing keyword variant.
    let debug = format!("{:?}", error.kind);
    debug
        .split(|c: char| c == ' ' || c == '{' || c == '(')
        .next()
        .unwrap_or("schema")
        .to_ascii_lowercase()
}

async fn validate_command(command: &str, workspace: &Path) -> Result<ContractOutcome> {
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ContractError::CommandSpawn)?;

    let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| ContractError::CommandTimeout(COMMAND_TIMEOUT))?
        .map_err(ContractError::CommandSpawn)?;

    if output.status.success() {
        return Ok(ContractOutcome::pass());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    Ok(ContractOutcome {
        passed: false,
        violations: vec![ContractViolation {
            path: String::new(),
            kind: "command_exit".to_string(),
            message: format!(
                "contract command exited with code {}",
                output.status.code().unwrap_or(-1)
            ),
        }],
        artifact_uri: None,
        output: Some(combined),
    })
}

/// `file://`-prefixed absolute path for user-facing messages.
pub fn file_uri(path: &Path) -> String {
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const OK_SCHEMA: &str = r#"{
        "type": "object",
        "properties": { "ok": { "const": true } },
        "required": ["ok"]
    }"#;

    fn contract_with_schema(dir: &Path) -> Contract {
        std::fs::write(dir.join("check.schema.json"), OK_SCHEMA).unwrap();
        Contract {
            json_schema: Some(PathBuf::from("check.schema.json")),
            ..Contract::default()
        }
    }

    #[tokio::test]
    async fn schema_pass() {
        let dir = TempDir::new().unwrap();
        let contract = contract_with_schema(dir.path());
        let artifact = dir.path().join("a.json");
        std::fs::write(&artifact, r#"{"ok":true}"#).unwrap();

        let outcome = validate(&contract, dir.path(), Some(&artifact), true)
            .await
            .unwrap();
        assert!(outcome.passed);
        assert!(outcome.violations.is_empty());
    }

    #[tokio::test]
    async fn schema_violation_has_path_and_kind() {
        let dir = TempDir::new().unwrap();
        let contract = contract_with_schema(dir.path());
        let artifact = dir.path().join("a.json");
        std::fs::write(&artifact, r#"{"ok":false}"#).unwrap();

        let outcome = validate(&contract, dir.path(), Some(&artifact), true)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].path, "/ok");
        assert!(outcome.artifact_uri.as_deref().unwrap().starts_with("file://"));

        let hint = outcome.hint();
        assert!(hint.contains("contract validation"));
        assert!(hint.contains("file://"));
    }

    #[tokio::test]
    async fn missing_required_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let contract = contract_with_schema(dir.path());
        let artifact = dir.path().join("never-written.json");

        let outcome = validate(&contract, dir.path(), Some(&artifact), true)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].kind, "missing_artifact");
    }

    #[tokio::test]
    async fn missing_optional_artifact_passes() {
        let dir = TempDir::new().unwrap();
        let contract = contract_with_schema(dir.path());
        let artifact = dir.path().join("never-written.json");

        let outcome = validate(&contract, dir.path(), Some(&artifact), false)
            .await
            .unwrap();
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn non_json_artifact_is_a_violation() {
        let dir = TempDir::new().unwrap();
        let contract = contract_with_schema(dir.path());
        let artifact = dir.path().join("a.json");
        std::fs::write(&artifact, "not json").unwrap();

        let outcome = validate(&contract, dir.path(), Some(&artifact), true)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].kind, "invalid_json");
    }

    #[tokio::test]
    async fn command_contract_exit_codes() {
        let dir = TempDir::new().unwrap();

        let passing = Contract {
            command: Some("true".to_string()),
            ..Contract::default()
        };
        let outcome = validate(&passing, dir.path(), None, true).await.unwrap();
        assert!(outcome.passed);

        let failing = Contract {
            command: Some("echo 'bad artifact' >&2; exit 3".to_string()),
            ..Contract::default()
        };
        let outcome = validate(&failing, dir.path(), None, true).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].kind, "command_exit");
        assert!(outcome.output.as_deref().unwrap().contains("bad artifact"));
        assert!(outcome.hint().contains("bad artifact"));
    }

    #[tokio::test]
    async fn command_runs_in_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("expected.txt"), "x").unwrap();

        let contract = Contract {
            command: Some("test -f expected.txt".to_string()),
            ..Contract::default()
        };
        let outcome = validate(&contract, dir.path(), None, true).await.unwrap();
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn unreadable_schema_is_an_error() {
        let dir = TempDir::new().unwrap();
        let contract = Contract {
            json_schema: Some(PathBuf::from("missing.schema.json")),
            ..Contract::default()
        };
        let result = validate(&contract, dir.path(), None, true).await;
        assert!(matches!(result, Err(ContractError::SchemaRead { .. })));
    }
}
