//! Typed identifiers shared across scheduler/stage components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one pipeline run within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(
    /// Raw numeric id value.
    pub u64,
);

impl RunId {
    /// Allocate the next process-unique run id.
    pub fn next() -> Self {
        Self(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One running copy of a stage: `(stage name, copy number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageInstanceId {
    /// Stage name from the pipeline definition.
    pub stage: String,
    /// Zero-based copy number.
    pub copy: u32,
}

impl StageInstanceId {
    /// Build an instance id.
    pub fn new(stage: impl Into<String>, copy: u32) -> Self {
        Self {
            stage: stage.into(),
            copy,
        }
    }
}

impl fmt::Display for StageInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.copy)
    }
}

#[cfg(test)]
mod tests {
    use super::{RunId, StageInstanceId};

    #[test]
    fn run_ids_are_unique() {
        let a = RunId::next();
        let b = RunId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn instance_id_display_is_name_dot_copy() {
        assert_eq!(StageInstanceId::new("group", 2).to_string(), "group.2");
    }
}
