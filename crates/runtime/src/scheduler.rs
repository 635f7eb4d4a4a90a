//! Builds the channel graph of a pipeline, starts one thread per stage instance, and
//! aggregates their completion status.
//!
//! Two phases:
//! - [`Scheduler::prepare`] validates the definition and initializes every instance. Any
//!   failure disposes what was already initialized and no thread starts.
//! - [`PreparedPipeline::start`] spawns the threads and returns a [`RunningPipeline`] handle
//!   for polling counters, raising the stop, and waiting for the [`PipelineResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rowflow_common::metrics::global_metrics;
use rowflow_common::{EngineConfig, Result, RowflowError, RunId, StageInstanceId};
use rowflow_execution::{
    CounterSnapshot, Distribution, ErrorEnvelope, Row, RowEmitter, RowReceiver, RowSender,
    Schema, SchemaRef, StageBehavior, StageContext, StageCounters, StageRegistry, StopSignal,
    row_channel,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::pipeline::{DistributionDef, PipelineDef};
use crate::worker::{InstanceReport, RejectionLimits, StageInstance};

/// Runs pipeline definitions against a fixed stage-type registry.
#[derive(Debug, Clone)]
pub struct Scheduler {
    registry: StageRegistry,
    engine: Arc<EngineConfig>,
}

/// One stage after successful initialization of all its copies.
struct InitializedStage {
    contexts: Vec<StageContext>,
    behaviors: Vec<Box<dyn StageBehavior>>,
    output_schema: SchemaRef,
    error_schema: SchemaRef,
    distribution: Distribution,
}

impl InitializedStage {
    fn dispose(&mut self) {
        for b in &mut self.behaviors {
            b.dispose();
        }
    }
}

#[derive(Default)]
struct CopyWiring {
    main: Vec<RowSender>,
    errors: Vec<RowSender>,
    inputs: Vec<RowReceiver>,
}

impl Scheduler {
    pub fn new(registry: StageRegistry, engine: EngineConfig) -> Self {
        Self {
            registry,
            engine: Arc::new(engine),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Prepare, start, and wait.
    pub fn run(&self, def: &PipelineDef) -> Result<PipelineResult> {
        Ok(self.start(def)?.wait())
    }

    pub fn start(&self, def: &PipelineDef) -> Result<RunningPipeline> {
        self.prepare(def)?.start()
    }

    /// Validate `def`, initialize every stage instance, and wire the channels.
    pub fn prepare(&self, def: &PipelineDef) -> Result<PreparedPipeline> {
        self.engine.validate()?;
        def.validate()?;
        let order = def.topological_order()?;
        let run_id = RunId::next();
        let stop = StopSignal::new();

        let mut stages: Vec<Option<InitializedStage>> = (0..def.stages.len()).map(|_| None).collect();
        for &idx in &order {
            match self.init_stage(def, idx, &stages, run_id, &stop) {
                Ok(stage) => stages[idx] = Some(stage),
                Err(e) => {
                    for stage in stages.iter_mut().flatten() {
                        stage.dispose();
                    }
                    error!(
                        pipeline = %def.name,
                        stage = %def.stages[idx].name,
                        error = %e,
                        "pipeline initialization failed"
                    );
                    return Err(e);
                }
            }
        }
        let stages = stages
            .into_iter()
            .map(|s| s.ok_or_else(|| RowflowError::Execution("stage left uninitialized".to_string())))
            .collect::<Result<Vec<_>>>()?;

        let mut wiring = def
            .stages
            .iter()
            .map(|s| (0..s.copies).map(|_| CopyWiring::default()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        for hop in &def.hops {
            let (Some(from), Some(to)) = (def.stage_index(&hop.from), def.stage_index(&hop.to))
            else {
                continue;
            };
            let is_error_hop = def.stages[from]
                .error_handling
                .as_ref()
                .is_some_and(|eh| eh.target == hop.to);
            let keyed = matches!(stages[from].distribution, Distribution::Keyed(_));
            let n = def.stages[from].copies;
            let m = def.stages[to].copies;
            let pairs = if n == m && !keyed {
                (0..n).map(|i| (i, i)).collect::<Vec<_>>()
            } else {
                (0..n)
                    .flat_map(|i| (0..m).map(move |j| (i, j)))
                    .collect::<Vec<_>>()
            };
            for (i, j) in pairs {
                let (tx, rx) = row_channel(self.engine.channel_capacity);
                stop.register(rx.canceller());
                let src = &mut wiring[from][i as usize];
                if is_error_hop {
                    src.errors.push(tx);
                } else {
                    src.main.push(tx);
                }
                wiring[to][j as usize].inputs.push(rx);
            }
        }

        let mut schemas = HashMap::new();
        let mut instances = Vec::new();
        for (idx, (stage, copies)) in stages.into_iter().zip(wiring).enumerate() {
            let stage_def = &def.stages[idx];
            schemas.insert(stage_def.name.clone(), Arc::clone(&stage.output_schema));
            let limits = stage_def
                .error_handling
                .as_ref()
                .map(RejectionLimits::from_def)
                .unwrap_or_default();
            let InitializedStage {
                contexts,
                behaviors,
                distribution,
                ..
            } = stage;
            for ((ctx, behavior), copy) in contexts.into_iter().zip(behaviors).zip(copies) {
                let mut output = RowEmitter::new(ctx.clone(), copy.main, distribution.clone());
                if stage_def.error_handling.is_some() {
                    output = output.with_error_targets(copy.errors);
                }
                instances.push(StageInstance::new(ctx, behavior, copy.inputs, output, limits));
            }
        }

        info!(
            pipeline = %def.name,
            run_id = %run_id,
            stages = def.stages.len(),
            instances = instances.len(),
            hops = def.hops.len(),
            "pipeline prepared"
        );
        Ok(PreparedPipeline {
            name: def.name.clone(),
            require_zero_errors: def.require_zero_errors,
            run_id,
            stop,
            metrics_enabled: self.engine.metrics_enabled,
            schemas,
            instances,
        })
    }

    fn init_stage(
        &self,
        def: &PipelineDef,
        idx: usize,
        done: &[Option<InitializedStage>],
        run_id: RunId,
        stop: &StopSignal,
    ) -> Result<InitializedStage> {
        let stage_def = &def.stages[idx];
        let input = input_schema(def, idx, done)?;

        let mut contexts = Vec::with_capacity(stage_def.copies as usize);
        let mut behaviors: Vec<Box<dyn StageBehavior>> =
            Vec::with_capacity(stage_def.copies as usize);
        let mut output_schema = None;
        let result = (|| -> Result<()> {
            for copy in 0..stage_def.copies {
                let mut ctx = StageContext::new(
                    def.name.clone(),
                    run_id,
                    StageInstanceId::new(stage_def.name.clone(), copy),
                    Arc::clone(&self.engine),
                );
                ctx.copies = stage_def.copies;
                ctx.stop = stop.clone();

                let mut behavior = self
                    .registry
                    .create(&stage_def.stage_type, &stage_def.config)?;
                let has_inputs = input.is_some();
                if behavior.is_source() && has_inputs {
                    return Err(RowflowError::InvalidConfig(format!(
                        "source stage '{}' cannot have input hops",
                        stage_def.name
                    )));
                }
                if !behavior.is_source() && !has_inputs {
                    return Err(RowflowError::InvalidConfig(format!(
                        "stage '{}' has no input hops",
                        stage_def.name
                    )));
                }
                let input_schema = input.clone().unwrap_or_else(|| Arc::new(Schema::empty()));
                match behavior.initialize(&ctx, &input_schema) {
                    Ok(schema) => output_schema = Some(schema),
                    Err(e) => {
                        behavior.dispose();
                        return Err(e);
                    }
                }
                contexts.push(ctx);
                behaviors.push(behavior);
            }
            Ok(())
        })();
        if let Err(e) = result {
            for b in &mut behaviors {
                b.dispose();
            }
            return Err(e);
        }

        let output_schema = output_schema.unwrap_or_else(|| Arc::new(Schema::empty()));
        let error_input = input.unwrap_or_else(|| Arc::new(Schema::empty()));
        let distribution = match &stage_def.distribution {
            DistributionDef::RoundRobin => Distribution::RoundRobin,
            DistributionDef::Copy => Distribution::Copy,
            DistributionDef::Keyed { fields } => {
                let resolved = fields
                    .iter()
                    .map(|f| output_schema.require_index(f))
                    .collect::<Result<Vec<_>>>();
                match resolved {
                    Ok(idx) => Distribution::Keyed(idx),
                    Err(e) => {
                        for b in &mut behaviors {
                            b.dispose();
                        }
                        return Err(e);
                    }
                }
            }
        };
        Ok(InitializedStage {
            contexts,
            behaviors,
            error_schema: Arc::new(ErrorEnvelope::schema(&error_input)),
            output_schema,
            distribution,
        })
    }
}

/// Schema arriving at stage `idx`; `None` when nothing feeds it.
///
/// Every incoming hop must carry the same layout.
fn input_schema(
    def: &PipelineDef,
    idx: usize,
    done: &[Option<InitializedStage>],
) -> Result<Option<SchemaRef>> {
    let name = &def.stages[idx].name;
    let mut found: Option<(&str, SchemaRef)> = None;
    for hop in def.hops.iter().filter(|h| &h.to == name) {
        let up = def
            .stage_index(&hop.from)
            .and_then(|i| done[i].as_ref().map(|s| (i, s)));
        let Some((up_idx, up)) = up else {
            return Err(RowflowError::Execution(format!(
                "stage '{}' initialized before its upstream '{}'",
                name, hop.from
            )));
        };
        let carries_errors = def.stages[up_idx]
            .error_handling
            .as_ref()
            .is_some_and(|eh| &eh.target == name);
        let schema = if carries_errors {
            Arc::clone(&up.error_schema)
        } else {
            Arc::clone(&up.output_schema)
        };
        match &found {
            None => found = Some((hop.from.as_str(), schema)),
            Some((first, seen)) if **seen != *schema => {
                return Err(RowflowError::InvalidConfig(format!(
                    "stage '{name}' mixes row layouts: '{first}' sends [{}] but '{}' sends [{}]",
                    seen.names().join(", "),
                    hop.from,
                    schema.names().join(", ")
                )));
            }
            Some(_) => {}
        }
    }
    Ok(found.map(|(_, s)| s))
}

/// Fully initialized pipeline whose threads have not started yet.
pub struct PreparedPipeline {
    name: String,
    require_zero_errors: bool,
    run_id: RunId,
    stop: StopSignal,
    metrics_enabled: bool,
    schemas: HashMap<String, SchemaRef>,
    instances: Vec<StageInstance>,
}

impl PreparedPipeline {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Output schema of a stage, as returned by its initialization.
    pub fn output_schema(&self, stage: &str) -> Option<&SchemaRef> {
        self.schemas.get(stage)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Dispose every instance without starting any thread.
    pub fn discard(self) {
        for instance in self.instances {
            instance.abandon();
        }
    }

    /// Spawn one named thread per instance.
    pub fn start(self) -> Result<RunningPipeline> {
        let Self {
            name,
            require_zero_errors,
            run_id,
            stop,
            metrics_enabled,
            instances,
            ..
        } = self;
        let total = instances.len();
        let mut handles = Vec::with_capacity(total);
        let mut pending = instances.into_iter();
        while let Some(instance) = pending.next() {
            let id = instance.context().instance.clone();
            let counters = Arc::clone(&instance.context().counters);
            let spawned = thread::Builder::new()
                .name(id.to_string())
                .spawn(move || instance.run());
            match spawned {
                Ok(handle) => handles.push(InstanceHandle {
                    id,
                    counters,
                    handle,
                }),
                Err(e) => {
                    error!(pipeline = %name, stage = %id, error = %e, "failed to spawn stage thread");
                    stop.raise();
                    for rest in pending.by_ref() {
                        rest.abandon();
                    }
                    for h in handles {
                        let _ = h.handle.join();
                    }
                    return Err(RowflowError::Io(e));
                }
            }
        }

        if metrics_enabled {
            global_metrics().set_running_stages(&run_id.to_string(), total as u64);
        }
        info!(pipeline = %name, run_id = %run_id, threads = total, "pipeline started");
        Ok(RunningPipeline {
            name,
            require_zero_errors,
            run_id,
            stop,
            metrics_enabled,
            started: Instant::now(),
            handles,
        })
    }
}

struct InstanceHandle {
    id: StageInstanceId,
    counters: Arc<StageCounters>,
    handle: JoinHandle<InstanceReport>,
}

/// Handle to a pipeline whose stage threads are running.
pub struct RunningPipeline {
    name: String,
    require_zero_errors: bool,
    run_id: RunId,
    stop: StopSignal,
    metrics_enabled: bool,
    started: Instant,
    handles: Vec<InstanceHandle>,
}

impl RunningPipeline {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Raise the cooperative stop for every stage.
    pub fn stop(&self) {
        if self.stop.raise() {
            warn!(pipeline = %self.name, run_id = %self.run_id, "pipeline stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Whether every stage thread has returned.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.handle.is_finished())
    }

    /// Live counters of every instance.
    pub fn counters(&self) -> Vec<(StageInstanceId, CounterSnapshot)> {
        self.handles
            .iter()
            .map(|h| (h.id.clone(), h.counters.snapshot()))
            .collect()
    }

    /// Wait for every stage thread and build the completion result.
    pub fn wait(self) -> PipelineResult {
        let mut stages = Vec::with_capacity(self.handles.len());
        let mut outputs: HashMap<String, Vec<Row>> = HashMap::new();
        for h in self.handles {
            let report = match h.handle.join() {
                Ok(report) => report,
                Err(_) => {
                    h.counters.inc_errors();
                    self.stop.raise();
                    error!(pipeline = %self.name, stage = %h.id, "stage thread panicked");
                    InstanceReport {
                        counters: h.counters.snapshot(),
                        secs: 0.0,
                        failure: Some("stage thread panicked".to_string()),
                        collected: None,
                    }
                }
            };
            if let Some(rows) = report.collected {
                outputs.entry(h.id.stage.clone()).or_default().extend(rows);
            }
            stages.push(StageReport {
                instance: h.id,
                counters: report.counters,
                secs: report.secs,
                failure: report.failure,
            });
        }

        let errors = stages.iter().map(|s| s.counters.errors).sum::<u64>();
        let rejected = stages.iter().map(|s| s.counters.rejected).sum::<u64>();
        let stopped = self.stop.is_stopped();
        let success = !self.require_zero_errors || errors == 0;
        let status = match (success, stopped) {
            (false, _) => "failed",
            (true, true) => "stopped",
            (true, false) => "success",
        };
        if self.metrics_enabled {
            let metrics = global_metrics();
            metrics.set_running_stages(&self.run_id.to_string(), 0);
            metrics.inc_pipeline_runs(&self.name, status);
        }
        info!(
            pipeline = %self.name,
            run_id = %self.run_id,
            status,
            errors,
            rejected,
            secs = self.started.elapsed().as_secs_f64(),
            "pipeline finished"
        );
        PipelineResult {
            pipeline: self.name,
            run_id: self.run_id,
            success,
            stopped,
            errors,
            rejected,
            stages,
            outputs,
        }
    }
}

/// Final counters of one stage instance.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub instance: StageInstanceId,
    pub counters: CounterSnapshot,
    pub secs: f64,
    pub failure: Option<String>,
}

/// Completion status of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub run_id: RunId,
    pub success: bool,
    /// Whether the cooperative stop was raised, by a caller or by a failing stage.
    pub stopped: bool,
    pub errors: u64,
    pub rejected: u64,
    pub stages: Vec<StageReport>,
    /// Rows gathered by `collect` stages, by stage name, copies in copy order.
    pub outputs: HashMap<String, Vec<Row>>,
}

impl PipelineResult {
    /// Summed counters of every copy of `stage`.
    pub fn stage_counters(&self, stage: &str) -> CounterSnapshot {
        self.stages
            .iter()
            .filter(|s| s.instance.stage == stage)
            .fold(CounterSnapshot::default(), |acc, s| CounterSnapshot {
                read: acc.read + s.counters.read,
                written: acc.written + s.counters.written,
                input: acc.input + s.counters.input,
                output: acc.output + s.counters.output,
                rejected: acc.rejected + s.counters.rejected,
                errors: acc.errors + s.counters.errors,
            })
    }

    /// Rows collected by `stage`, empty when it collected nothing.
    pub fn rows(&self, stage: &str) -> &[Row] {
        self.outputs.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }
}
