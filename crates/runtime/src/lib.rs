//! Pipeline execution: definitions, the thread-per-stage scheduler, and built-in stages.
//!
//! Architecture role:
//! - parses and validates declarative pipeline definitions
//! - initializes every stage instance, wires bounded channels between them, and runs each
//!   instance on its own thread
//! - provides the built-in stage catalog, including the sorted-input group-by
//!
//! Key modules:
//! - [`pipeline`]
//! - [`scheduler`]
//! - [`worker`]
//! - [`stages`]

pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod worker;

pub use pipeline::{DistributionDef, ErrorHandlingDef, HopDef, PipelineDef, StageDef};
pub use scheduler::{PipelineResult, PreparedPipeline, RunningPipeline, Scheduler, StageReport};
pub use stages::builtin_registry;
pub use worker::RejectionLimits;
