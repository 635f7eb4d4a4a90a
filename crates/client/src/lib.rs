//! Embedded entry point for running rowflow pipelines in-process.
//!
//! [`Engine`] wraps the scheduler and the built-in stage catalog; [`RunReport`] pairs a
//! finished run with the row layouts needed to render its collected outputs.

pub mod engine;
pub mod report;

pub use engine::Engine;
pub use report::RunReport;
