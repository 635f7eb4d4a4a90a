use std::collections::HashMap;
use std::path::Path;

use rowflow_common::metrics::global_metrics;
use rowflow_common::{EngineConfig, Result};
use rowflow_execution::{SchemaRef, StageRegistry};
use rowflow_runtime::{PipelineDef, RunningPipeline, Scheduler, builtin_registry};
use tracing::info;

use crate::report::RunReport;

/// Embedded engine: a scheduler over the built-in stage catalog plus any registered extras.
#[derive(Debug, Clone)]
pub struct Engine {
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_registry(config, builtin_registry())
    }

    /// Engine over a caller-assembled registry, e.g. the built-ins plus custom stage types.
    pub fn with_registry(config: EngineConfig, registry: StageRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: Scheduler::new(registry, config),
        })
    }

    /// Defaults overridden by `ROWFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        self.scheduler.engine()
    }

    pub fn stage_types(&self) -> Vec<String> {
        self.scheduler.registry().names()
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<PipelineDef> {
        PipelineDef::from_path(path)
    }

    /// Check `def` without running it: graph validation plus a full stage initialization.
    pub fn validate(&self, def: &PipelineDef) -> Result<()> {
        let prepared = self.scheduler.prepare(def)?;
        info!(
            pipeline = %def.name,
            instances = prepared.instance_count(),
            "pipeline is valid"
        );
        prepared.discard();
        Ok(())
    }

    /// Run `def` to completion.
    pub fn run(&self, def: &PipelineDef) -> Result<RunReport> {
        let prepared = self.scheduler.prepare(def)?;
        let schemas = def
            .stages
            .iter()
            .filter_map(|s| {
                prepared
                    .output_schema(&s.name)
                    .map(|schema| (s.name.clone(), SchemaRef::clone(schema)))
            })
            .collect::<HashMap<_, _>>();
        let result = prepared.start()?.wait();
        Ok(RunReport::new(result, schemas))
    }

    pub fn run_path(&self, path: impl AsRef<Path>) -> Result<RunReport> {
        let def = self.load(path)?;
        self.run(&def)
    }

    /// Start `def` and return the running handle for polling or stopping.
    pub fn start(&self, def: &PipelineDef) -> Result<RunningPipeline> {
        self.scheduler.start(def)
    }

    pub fn prometheus_metrics(&self) -> String {
        global_metrics().render_prometheus()
    }
}
