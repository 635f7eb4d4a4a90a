use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RowflowError};

/// Engine-wide defaults shared by the scheduler and every stage instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity (in rows) of every channel between two stage instances.
    pub channel_capacity: usize,
    /// Default spill directory for stages that do not configure one.
    pub spill_dir: String,
    /// Default number of buffered rows per group before spilling.
    pub spill_threshold_rows: usize,
    /// Record per-stage counters into the global prometheus registry.
    pub metrics_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            spill_dir: env::temp_dir().to_string_lossy().into_owned(),
            spill_threshold_rows: 5_000,
            metrics_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `ROWFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("ROWFLOW_CHANNEL_CAPACITY")? {
            cfg.channel_capacity = v;
        }
        if let Ok(dir) = env::var("ROWFLOW_SPILL_DIR") {
            cfg.spill_dir = dir;
        }
        if let Some(v) = env_usize("ROWFLOW_SPILL_THRESHOLD_ROWS")? {
            cfg.spill_threshold_rows = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(RowflowError::InvalidConfig(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.spill_threshold_rows == 0 {
            return Err(RowflowError::InvalidConfig(
                "spill_threshold_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .map(Some)
            .map_err(|e| RowflowError::InvalidConfig(format!("{key}={v}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("default config");
        assert_eq!(cfg.channel_capacity, 10_000);
        assert_eq!(cfg.spill_threshold_rows, 5_000);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"channel_capacity": 4}"#).expect("parse config");
        assert_eq!(cfg.channel_capacity, 4);
        assert_eq!(cfg.spill_threshold_rows, 5_000);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let cfg = EngineConfig {
            channel_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
