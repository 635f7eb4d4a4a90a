//! One running stage instance: input rotation, error redirection, rejection limits, and
//! lifecycle bookkeeping around a [`StageBehavior`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use rowflow_common::metrics::{StageSample, global_metrics};
use rowflow_common::{Result, RowflowError};
use rowflow_execution::{
    CounterSnapshot, ErrorEnvelope, Row, RowEmitter, RowReceiver, StageBehavior, StageContext,
    StageCounters, StopSignal, TryRecv,
};
use tracing::{debug, error, info, warn};

use crate::pipeline::ErrorHandlingDef;

const INPUT_WAIT: Duration = Duration::from_millis(10);

/// Rejection limits of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectionLimits {
    pub max_errors: Option<u64>,
    pub max_percent_errors: Option<u32>,
    pub min_pct_rows: Option<u64>,
}

impl RejectionLimits {
    pub fn from_def(def: &ErrorHandlingDef) -> Self {
        Self {
            max_errors: def.max_errors,
            max_percent_errors: def.max_percent_errors,
            min_pct_rows: def.min_pct_rows,
        }
    }

    /// Fail when the rejected rows break a limit.
    pub fn check(&self, counters: &StageCounters) -> Result<()> {
        let snap = counters.snapshot();
        if let Some(max) = self.max_errors.filter(|&m| snap.rejected > m) {
            return Err(RowflowError::Execution(format!(
                "{} rows rejected, more than max_errors={max}",
                snap.rejected
            )));
        }
        let Some(max_pct) = self.max_percent_errors else {
            return Ok(());
        };
        let min_rows = self.min_pct_rows.unwrap_or(0);
        if snap.rejected == 0 || snap.read == 0 || snap.read < min_rows {
            return Ok(());
        }
        let pct = (snap.rejected * 100).div_ceil(snap.read);
        if pct > u64::from(max_pct) {
            return Err(RowflowError::Execution(format!(
                "{pct}% of {} rows rejected, more than max_percent_errors={max_pct}",
                snap.read
            )));
        }
        Ok(())
    }
}

/// Reads the instance's inputs in rotation until every one has ended.
struct InputRotation {
    inputs: Vec<RowReceiver>,
    next: usize,
}

impl InputRotation {
    fn new(inputs: Vec<RowReceiver>) -> Self {
        Self { inputs, next: 0 }
    }

    fn next_row(&mut self, stop: &StopSignal) -> Option<Row> {
        'outer: loop {
            if self.inputs.is_empty() || stop.is_stopped() {
                return None;
            }
            if self.inputs.len() == 1 {
                let row = self.inputs[0].get();
                if row.is_none() {
                    self.inputs.clear();
                }
                return row;
            }

            let mut pending = 0;
            while pending < self.inputs.len() {
                let idx = self.next % self.inputs.len();
                match self.inputs[idx].try_get() {
                    TryRecv::Row(row) => {
                        self.next = idx + 1;
                        return Some(row);
                    }
                    TryRecv::Ended => {
                        self.inputs.remove(idx);
                        continue 'outer;
                    }
                    TryRecv::Pending => {
                        self.next = idx + 1;
                        pending += 1;
                    }
                }
            }

            let idx = self.next % self.inputs.len();
            match self.inputs[idx].get_timeout(INPUT_WAIT) {
                TryRecv::Row(row) => {
                    self.next = idx + 1;
                    return Some(row);
                }
                TryRecv::Ended => {
                    self.inputs.remove(idx);
                }
                TryRecv::Pending => self.next = idx + 1,
            }
        }
    }
}

/// Final state of one instance after its thread returned.
#[derive(Debug)]
pub struct InstanceReport {
    pub counters: CounterSnapshot,
    pub secs: f64,
    pub failure: Option<String>,
    pub collected: Option<Vec<Row>>,
}

/// A stage behavior plus everything needed to run it on its own thread.
pub struct StageInstance {
    ctx: StageContext,
    behavior: Box<dyn StageBehavior>,
    inputs: Vec<RowReceiver>,
    output: RowEmitter,
    limits: RejectionLimits,
}

impl StageInstance {
    pub fn new(
        ctx: StageContext,
        behavior: Box<dyn StageBehavior>,
        inputs: Vec<RowReceiver>,
        output: RowEmitter,
        limits: RejectionLimits,
    ) -> Self {
        Self {
            ctx,
            behavior,
            inputs,
            output,
            limits,
        }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Dispose without running, after a failed start.
    pub fn abandon(mut self) {
        self.behavior.dispose();
        self.output.close();
    }

    /// Run to completion on the calling thread.
    pub fn run(mut self) -> InstanceReport {
        let started = Instant::now();
        info!(
            pipeline = %self.ctx.pipeline,
            run_id = %self.ctx.run_id,
            stage = %self.ctx.instance.stage,
            copy = self.ctx.instance.copy,
            inputs = self.inputs.len(),
            "stage started"
        );

        // A panic must raise the stop before the outputs close, or downstream stages would
        // read the truncated stream as a normal end of input.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive()))
            .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())));
        let failure = match outcome {
            Ok(()) | Err(RowflowError::Cancelled) => None,
            Err(e) => {
                self.ctx.counters.inc_errors();
                error!(
                    pipeline = %self.ctx.pipeline,
                    run_id = %self.ctx.run_id,
                    stage = %self.ctx.instance.stage,
                    copy = self.ctx.instance.copy,
                    code = e.code(),
                    error = %e,
                    "stage failed; stopping pipeline"
                );
                self.ctx.stop.raise();
                Some(e.to_string())
            }
        };

        self.behavior.dispose();
        self.output.close();
        drop(std::mem::take(&mut self.inputs));
        let collected = self.behavior.take_collected();

        let counters = self.ctx.counters.snapshot();
        let secs = started.elapsed().as_secs_f64();
        if self.ctx.engine.metrics_enabled {
            global_metrics().record_stage(
                &self.ctx.run_id.to_string(),
                &self.ctx.instance.stage,
                self.ctx.instance.copy,
                StageSample {
                    rows_read: counters.read,
                    rows_written: counters.written,
                    rows_rejected: counters.rejected,
                    errors: counters.errors,
                    secs,
                },
            );
        }
        info!(
            pipeline = %self.ctx.pipeline,
            run_id = %self.ctx.run_id,
            stage = %self.ctx.instance.stage,
            copy = self.ctx.instance.copy,
            read = counters.read,
            written = counters.written,
            rejected = counters.rejected,
            errors = counters.errors,
            stopped = self.ctx.is_stopped(),
            "stage finished"
        );
        InstanceReport {
            counters,
            secs,
            failure,
            collected,
        }
    }

    fn drive(&mut self) -> Result<()> {
        if self.behavior.is_source() {
            self.behavior.generate(&self.ctx, &mut self.output)?;
        } else {
            let mut inputs = InputRotation::new(std::mem::take(&mut self.inputs));
            while let Some(row) = inputs.next_row(&self.ctx.stop) {
                self.ctx.counters.inc_read();
                self.handle_row(row)?;
            }
        }

        if self.ctx.is_stopped() {
            warn!(
                pipeline = %self.ctx.pipeline,
                stage = %self.ctx.instance.stage,
                copy = self.ctx.instance.copy,
                "stop requested; skipping finish"
            );
            return Ok(());
        }
        self.behavior.finish(&self.ctx, &mut self.output)
    }

    fn handle_row(&mut self, row: Row) -> Result<()> {
        let original = self.output.redirects_errors().then(|| row.clone());
        let err = match self.behavior.process_row(&self.ctx, row, &mut self.output) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match original {
            Some(original) if err.is_row_error() => {
                debug!(
                    stage = %self.ctx.instance.stage,
                    copy = self.ctx.instance.copy,
                    code = err.code(),
                    error = %err,
                    "row redirected to error target"
                );
                self.output
                    .emit_error(ErrorEnvelope::from_error(original, &err))?;
                self.limits.check(&self.ctx.counters)
            }
            _ => Err(err),
        }
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> RowflowError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    RowflowError::Execution(format!("stage panicked: {message}"))
}
