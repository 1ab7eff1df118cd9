//! Shared data model for the Wave pipeline engine.
//!
//! Pure types and parsing: no async runtime, no I/O beyond what callers do
//! with the parsed structures.

pub mod events;
pub mod manifest;
pub mod pipeline;
pub mod runid;
pub mod scrub;
pub mod template;
pub mod types;

pub use events::{ProgressEvent, StepEventKind};
pub use manifest::{
    AdapterKind, AdapterSpec, Manifest, Permissions, Persona, RelaySpec, Runtime, SkillSpec,
};
pub use pipeline::{
    Contract, InjectArtifact, MatrixStrategy, MountMode, OnFailure, OutputArtifact, Pipeline,
    PipelineError, Requires, Step, WorkspaceKind, WorkspaceSpec,
};
pub use runid::generate_run_id;
pub use scrub::{scrub, Scrubber};
pub use template::{expand, TemplateContext};
pub use types::{
    ArtifactRecord, ArtifactSource, ArtifactType, Deliverable, DeliverableKind, Id, Run,
    RunStatus, StepState, StepStatus, TokenUsage,
};
