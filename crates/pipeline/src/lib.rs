//! Compression pipeline orchestration
//!
//! Drives one compression task from source bytes to the final buffer:
//! select a credential, upload, apply resize/convert server-side, download,
//! and report progress and quota usage along the way. Failures are classified
//! and retried across the credential pool, at most once per credential.

pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod task;

pub use error::{PipelineError, Result};
pub use events::{PipelineEvent, Stage};
pub use orchestrator::{CompressionResult, Orchestrator, OrchestratorConfig};
pub use progress::ProgressEmitter;
pub use task::{CompressionTask, Composition, Source, SourceKind, TaskOptions, TransformPlan};
