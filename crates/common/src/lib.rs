//! Shared configuration, error types, IDs, and observability primitives for rowflow crates.
//!
//! Architecture role:
//! - defines engine configuration passed from the client down to every stage
//! - provides the common [`RowflowError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry used by stages and the scheduler
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{Result, RowflowError};
pub use ids::*;
pub use metrics::MetricsRegistry;
