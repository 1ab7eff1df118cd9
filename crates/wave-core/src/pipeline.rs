//! Pipeline and step schema.
//!
//! These structs define the parsed shape of pipeline YAML documents. The
//! loader itself lives outside the engine; everything here is the contract
//! between parsed documents and the scheduler, including structural
//! validation (unknown ids, cycles, fan-out conflicts).

use crate::types::{ArtifactSource, ArtifactType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("step {step} depends on unknown step: {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle involving step: {0}")]
    Cycle(String),
    #[error("step {0} declares both concurrency and a matrix strategy")]
    ConcurrencyMatrixConflict(String),
    #[error("step {step} injects artifact from unknown step: {from_step}")]
    UnknownArtifactSource { step: String, from_step: String },
    #[error("step {step} injects artifact from {from_step}, which does not precede it")]
    ArtifactSourceNotUpstream { step: String, from_step: String },
    #[error("step {0} declares neither an inline prompt nor a source_path")]
    MissingExec(String),
    #[error("step {0} declares both an inline prompt and a source_path")]
    AmbiguousExec(String),
    #[error("contract on step {0} declares neither json_schema nor command")]
    EmptyContract(String),
    #[error("pipeline {0} is marked release but also disabled")]
    ReleaseDisabledConflict(String),
    #[error("release pipeline step {step} references release-excluded step {from_step}")]
    ReleaseExcludedReference { step: String, from_step: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Memory policy between steps. Fresh memory is the default: inter-step
/// data flows only through artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    #[default]
    Fresh,
    Inherit,
}

/// What happens when a step exhausts its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Retry,
    #[default]
    Fail,
    Skip,
}

/// Workspace flavor for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    /// Plain staging directory populated from mounts.
    #[default]
    Mount,
    /// Git worktree checkout rooted at a named branch.
    Worktree,
}

/// Mount access mode. Readonly mounts are copies; readwrite mounts are
/// symlinks back to the host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    #[default]
    Readonly,
    Readwrite,
}

/// A host path mapped into the step workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub mode: MountMode,
}

/// Workspace configuration for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    #[serde(rename = "type", default)]
    pub kind: WorkspaceKind,
    /// Repository root for worktree workspaces; `./` yields an empty root
    /// for mount workspaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Branch for worktree checkouts; created from HEAD when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
    /// Leave the worktree in place after the step for downstream steps
    /// sharing the branch.
    #[serde(default)]
    pub keep_worktree: bool,
}

/// An upstream artifact copied into this step's workspace under
/// `artifacts/<alias>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectArtifact {
    pub source_step: String,
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl InjectArtifact {
    /// Alias defaults to the artifact name.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.artifact_name)
    }
}

/// The step's prompt: inline text or a file reference, exactly one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
}

/// A declared output of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub name: String,
    /// Workspace-relative path the persona is expected to write.
    pub path: String,
    #[serde(rename = "type", default)]
    pub artifact_type: ArtifactType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub source: ArtifactSource,
    /// Optional schema path recorded on the artifact for downstream tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Handover contract gating the step's artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contract {
    /// JSON-Schema file validated against the `source` artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<PathBuf>,
    /// Shell command whose exit code is the verdict, run in the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Artifact name the schema validates; defaults to the first declared
    /// output artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
}

/// Items source for matrix fan-out: a JSON array at `key` inside the
/// injected artifact aliased `artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixItems {
    pub artifact: String,
    pub key: String,
}

/// Matrix strategy: one worker per item, each bound to `{{ task }}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixStrategy {
    pub items: MatrixItems,
    #[serde(default = "default_matrix_concurrency")]
    pub max_concurrency: usize,
}

fn default_matrix_concurrency() -> usize {
    5
}

/// Step-level strategy container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixStrategy>,
}

/// Post-execution validation rules, checked before the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    FileExists { path: String },
}

/// Skills and tools a pipeline (or step) requires on the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requires {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// One step of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub persona: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub memory: MemoryPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inject_artifacts: Vec<InjectArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,
    #[serde(default)]
    pub exec: ExecSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_artifacts: Vec<OutputArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Contract>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Spawn N identical workers in isolated workspaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Per-step timeout override in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requires>,
    /// Set to false to exclude this step from release pipelines. Excluded
    /// steps are never referenced by a release pipeline's dependency or
    /// artifact graph and do not run when the pipeline is a release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<bool>,
}

impl Step {
    pub fn matrix(&self) -> Option<&MatrixStrategy> {
        self.strategy.as_ref().and_then(|s| s.matrix.as_ref())
    }

    pub fn excluded_from_release(&self) -> bool {
        self.release == Some(false)
    }
}

/// A pipeline: an immutable DAG of steps plus preflight requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub release: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requires>,
    pub steps: Vec<Step>,
}

impl Pipeline {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Collect requirements declared on the pipeline and on any step.
    pub fn all_requirements(&self) -> Requires {
        let mut merged = self.requires.clone().unwrap_or_default();
        for step in &self.steps {
            if let Some(req) = &step.requires {
                for skill in &req.skills {
                    if !merged.skills.contains(skill) {
                        merged.skills.push(skill.clone());
                    }
                }
                for tool in &req.tools {
                    if !merged.tools.contains(tool) {
                        merged.tools.push(tool.clone());
                    }
                }
            }
        }
        merged
    }

    /// Structural validation. Runs before any run id is generated.
    pub fn validate(&self) -> Result<()> {
        if self.release && self.disabled {
            return Err(PipelineError::ReleaseDisabledConflict(self.name.clone()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PipelineError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PipelineError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if step.concurrency.is_some() && step.matrix().is_some() {
                return Err(PipelineError::ConcurrencyMatrixConflict(step.id.clone()));
            }
            match (&step.exec.prompt, &step.exec.source_path) {
                (None, None) => return Err(PipelineError::MissingExec(step.id.clone())),
                (Some(_), Some(_)) => return Err(PipelineError::AmbiguousExec(step.id.clone())),
                _ => {}
            }
            if let Some(contract) = &step.contract {
                if contract.json_schema.is_none() && contract.command.is_none() {
                    return Err(PipelineError::EmptyContract(step.id.clone()));
                }
            }
        }

        let order = self.topo_order()?;
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        for step in &self.steps {
            for inject in &step.inject_artifacts {
                let Some(&source_pos) = position.get(inject.source_step.as_str()) else {
                    return Err(PipelineError::UnknownArtifactSource {
                        step: step.id.clone(),
                        from_step: inject.source_step.clone(),
                    });
                };
                if source_pos >= position[step.id.as_str()] {
                    return Err(PipelineError::ArtifactSourceNotUpstream {
                        step: step.id.clone(),
                        from_step: inject.source_step.clone(),
                    });
                }
            }
        }

        // Release integrity: a step opted out of release may not be
        // reachable through the persona/contract graph of a release
        // pipeline, i.e. nothing included may depend on it or inject its
        // artifacts.
        if self.release {
            let excluded: HashSet<&str> = self
                .steps
                .iter()
                .filter(|s| s.excluded_from_release())
                .map(|s| s.id.as_str())
                .collect();
            if !excluded.is_empty() {
                for step in &self.steps {
                    if step.excluded_from_release() {
                        continue;
                    }
                    for dep in &step.dependencies {
                        if excluded.contains(dep.as_str()) {
                            return Err(PipelineError::ReleaseExcludedReference {
                                step: step.id.clone(),
                                from_step: dep.clone(),
                            });
                        }
                    }
                    for inject in &step.inject_artifacts {
                        if excluded.contains(inject.source_step.as_str()) {
                            return Err(PipelineError::ReleaseExcludedReference {
                                step: step.id.clone(),
                                from_step: inject.source_step.clone(),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Topological order of step ids (Kahn's algorithm). Fails on cycles.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            indegree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.dependencies {
                *indegree.entry(step.id.as_str()).or_insert(0) += 1;
                downstream
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        // Seed with declaration order so independent steps keep a stable order.
        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .filter(|s| indegree[s.id.as_str()] == 0)
            .map(|s| s.id.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(children) = downstream.get(id) {
                for child in children {
                    if let Some(entry) = indegree.get_mut(child) {
                        *entry -= 1;
                        if *entry == 0 {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .find(|s| !order.contains(&s.id))
                .map_or_else(String::new, |s| s.id.clone());
            return Err(PipelineError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Step ids that transitively depend on `id` (used for taint
    /// propagation and resume validation).
    pub fn downstream_of(&self, id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for step in &self.steps {
                if step.dependencies.contains(&current) && result.insert(step.id.clone()) {
                    frontier.push(step.id.clone());
                }
            }
        }
        result
    }
}
