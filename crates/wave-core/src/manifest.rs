//! Manifest schema: adapters, personas, runtime settings, and skills.
//!
//! The manifest loader is external; these structs define the parsed shape
//! the engine consumes, with defaults applied through serde.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Hard ceiling on the worker pool regardless of configuration.
pub const MAX_CONCURRENT_WORKERS: usize = 10;

/// Default worker pool size when the manifest does not set one.
pub const DEFAULT_CONCURRENT_WORKERS: usize = 5;

/// Default run-id suffix entropy in bytes (8 hex chars).
pub const DEFAULT_RUN_ID_BYTES: usize = 4;

/// Adapter implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Real model-CLI subprocess in streaming mode.
    #[default]
    Cli,
    /// Deterministic in-process adapter for tests and dry runs.
    Mock,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Mock => "mock",
        }
    }
}

/// One configured adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSpec {
    #[serde(rename = "type", default)]
    pub kind: AdapterKind,
    /// Binary to invoke for CLI adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Tool permission lists with glob patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

/// Network sandbox settings passed through to the adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
}

/// System prompt: a file reference or inline text, file winning when both
/// are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemPrompt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
}

/// A named adapter configuration: prompt, permissions, model choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub adapter: String,
    #[serde(default)]
    pub system_prompt: SystemPrompt,
    #[serde(default)]
    pub permissions: Permissions,
    /// Hook settings forwarded verbatim to the adapter config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Relay / compaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySpec {
    pub summarizer_persona: String,
    #[serde(default = "default_token_threshold")]
    pub token_threshold_percent: u8,
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default = "default_relay_strategy")]
    pub strategy: String,
}

fn default_token_threshold() -> u8 {
    80
}

fn default_context_window() -> u64 {
    200_000
}

fn default_relay_strategy() -> String {
    "summarize_to_checkpoint".to_string()
}

/// Audit trace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Trace directory; defaults to `.wave/traces` under the state dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for AuditSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Runtime settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Runtime {
    pub workspace_root: PathBuf,
    pub max_concurrent_workers: usize,
    pub default_timeout_minutes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelaySpec>,
    pub audit: AuditSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSpec>,
    /// Environment variables passed through to adapter subprocesses.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_passthrough: Vec<String>,
    /// Run-id suffix entropy in bytes.
    pub pipeline_id_hash_length: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".wave/workspaces"),
            max_concurrent_workers: DEFAULT_CONCURRENT_WORKERS,
            default_timeout_minutes: 30,
            relay: None,
            audit: AuditSpec::default(),
            sandbox: None,
            env_passthrough: Vec::new(),
            pipeline_id_hash_length: DEFAULT_RUN_ID_BYTES,
        }
    }
}

impl Runtime {
    /// Worker pool size after clamping to the hard ceiling.
    pub fn effective_workers(&self) -> usize {
        self.max_concurrent_workers
            .max(1)
            .min(MAX_CONCURRENT_WORKERS)
    }
}

/// Skill lifecycle commands declared in the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillSpec {
    /// Command proving the skill is usable; exit 0 means present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    /// Glob of command files copied into each workspace's commands dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_glob: Option<String>,
}

/// The full manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub adapters: HashMap<String, AdapterSpec>,
    pub personas: HashMap<String, Persona>,
    pub runtime: Runtime,
    pub skills: HashMap<String, SkillSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skill_mounts: Vec<PathBuf>,
}

impl Manifest {
    pub fn persona(&self, name: &str) -> Option<&Persona> {
        self.personas.get(name)
    }

    pub fn adapter(&self, name: &str) -> Option<&AdapterSpec> {
        self.adapters.get(name)
    }
}
