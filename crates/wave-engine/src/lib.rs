//! Wave execution engine.
//!
//! Everything between a parsed pipeline and a sealed run: the state store,
//! the DAG scheduler, per-step execution, workspace provisioning, the
//! adapter seam, contract validation, preflight, resume, and failure
//! classification.

pub mod adapter;
pub mod audit;
pub mod context;
pub mod contract;
pub mod deliverables;
pub mod emitter;
pub mod executor;
pub mod git;
pub mod preflight;
pub mod recovery;
pub mod relay;
pub mod resume;
pub mod scheduler;
pub mod storage;
pub mod workspace;

pub use adapter::{Adapter, AdapterError, AdapterInvocation, AdapterResult, CliAdapter, MockAdapter};
pub use context::RunContext;
pub use deliverables::DeliverableTracker;
pub use emitter::{EventEmitter, EventSink};
pub use recovery::{RecoveryBlock, RecoveryClass};
pub use scheduler::{ResumeSeed, RunFailure, RunResult, Scheduler, SchedulerError};
pub use storage::{Storage, StorageError};
pub use workspace::WorkspaceManager;
