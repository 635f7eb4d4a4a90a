//! Stage capability contract, row routing, counters, and the error-row envelope.
//!
//! A stage behavior only transforms rows. Reading inputs, honoring the stop signal, error
//! redirection and counting live in the runtime's stage record, which hands the behavior a
//! [`RowOutput`] to write into.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use rowflow_common::{Result, RowflowError};
use serde::{Deserialize, Serialize};

use crate::channel::RowSender;
use crate::context::StageContext;
use crate::row::{FieldMeta, Row, Schema, SchemaRef, Value, ValueType};

/// Behavior of one stage type.
///
/// Lifecycle per instance: `initialize` once before any thread starts, then either
/// `generate` (sources) or `process_row` per input row, then `finish` at end of input, and
/// `dispose` always, including after a stop or a failure.
pub trait StageBehavior: Send {
    /// Validate configuration against `input` and return the output schema.
    ///
    /// Source stages receive an empty input schema.
    fn initialize(&mut self, ctx: &StageContext, input: &SchemaRef) -> Result<SchemaRef>;

    /// Whether this stage produces rows without reading any input.
    fn is_source(&self) -> bool {
        false
    }

    /// Produce rows. Only called for source stages.
    ///
    /// Implementations should return once `out.is_stopped()` turns true.
    fn generate(&mut self, ctx: &StageContext, out: &mut dyn RowOutput) -> Result<()> {
        let _ = (ctx, out);
        Ok(())
    }

    /// Handle one input row.
    ///
    /// A [`RowflowError::Conversion`] means only this row failed; the stage must be left as if
    /// the row had never been seen. Sources never receive rows, so the default fails.
    fn process_row(&mut self, ctx: &StageContext, row: Row, out: &mut dyn RowOutput) -> Result<()> {
        let _ = (row, out);
        Err(RowflowError::Execution(format!(
            "source stage '{}' received an input row",
            ctx.stage_name()
        )))
    }

    /// Flush any buffered state after every input ended. Skipped when stopped.
    fn finish(&mut self, ctx: &StageContext, out: &mut dyn RowOutput) -> Result<()> {
        let _ = (ctx, out);
        Ok(())
    }

    /// Release resources. Always called exactly once.
    fn dispose(&mut self) {}

    /// Rows handed to the completion result, for sink stages.
    fn take_collected(&mut self) -> Option<Vec<Row>> {
        None
    }
}

/// Write side given to a behavior.
pub trait RowOutput {
    /// Route one row to the stage's main outputs.
    fn emit(&mut self, row: Row) -> Result<()>;

    /// Whether the cooperative stop was raised.
    fn is_stopped(&self) -> bool;
}

/// How rows are spread over several destination channels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Each row goes to the next channel in turn.
    #[default]
    RoundRobin,
    /// Each row is cloned to every channel.
    Copy,
    /// Rows with equal values in these fields go to the same channel.
    Keyed(Vec<usize>),
}

/// Live per-instance counters. Only the owning thread writes them.
#[derive(Debug, Default)]
pub struct StageCounters {
    read: AtomicU64,
    written: AtomicU64,
    input: AtomicU64,
    output: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl StageCounters {
    pub fn inc_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows brought in from outside the pipeline (sources).
    pub fn inc_input(&self) {
        self.input.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows handed out of the pipeline (sinks).
    pub fn inc_output(&self) {
        self.output.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            read: self.read.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            input: self.input.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StageCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub read: u64,
    pub written: u64,
    pub input: u64,
    pub output: u64,
    pub rejected: u64,
    pub errors: u64,
}

/// A set of destination channels plus the routing state over them.
#[derive(Debug)]
struct Targets {
    senders: Vec<RowSender>,
    distribution: Distribution,
    next: usize,
}

impl Targets {
    fn send(&mut self, row: Row) -> Result<()> {
        match self.senders.len() {
            0 => Ok(()),
            1 => self.senders[0].put(row),
            n => match &self.distribution {
                Distribution::RoundRobin => {
                    let idx = self.next % n;
                    self.next = self.next.wrapping_add(1);
                    self.senders[idx].put(row)
                }
                Distribution::Copy => {
                    let (last, rest) = self.senders.split_last().ok_or_else(|| {
                        RowflowError::Execution("copy distribution without targets".to_string())
                    })?;
                    for sender in rest {
                        sender.put(row.clone())?;
                    }
                    last.put(row)
                }
                Distribution::Keyed(fields) => {
                    let idx = key_partition(&row, fields, n);
                    self.senders[idx].put(row)
                }
            },
        }
    }
}

/// Destination index for `row` among `partitions` channels.
pub fn key_partition(row: &Row, fields: &[usize], partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    for v in row.project(fields) {
        v.hash(&mut hasher);
    }
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// The [`RowOutput`] the runtime hands to behaviors.
///
/// Main rows follow the configured [`Distribution`]; error rows always round-robin over the
/// error target's channels.
#[derive(Debug)]
pub struct RowEmitter {
    main: Targets,
    errors: Option<Targets>,
    ctx: StageContext,
}

impl RowEmitter {
    pub fn new(ctx: StageContext, senders: Vec<RowSender>, distribution: Distribution) -> Self {
        Self {
            main: Targets {
                senders,
                distribution,
                next: 0,
            },
            errors: None,
            ctx,
        }
    }

    /// Route error envelopes to `senders`.
    #[must_use]
    pub fn with_error_targets(mut self, senders: Vec<RowSender>) -> Self {
        self.errors = Some(Targets {
            senders,
            distribution: Distribution::RoundRobin,
            next: 0,
        });
        self
    }

    pub fn redirects_errors(&self) -> bool {
        self.errors.is_some()
    }

    /// Send an error envelope and count the row as rejected.
    pub fn emit_error(&mut self, envelope: ErrorEnvelope) -> Result<()> {
        let targets = self.errors.as_mut().ok_or_else(|| {
            RowflowError::Execution(format!(
                "stage {} has no error target",
                self.ctx.instance
            ))
        })?;
        self.ctx.counters.inc_rejected();
        targets.send(envelope.into_row())
    }

    /// Mark every output done by dropping the senders.
    pub fn close(&mut self) {
        self.main.senders.clear();
        if let Some(errors) = self.errors.as_mut() {
            errors.senders.clear();
        }
    }
}

impl RowOutput for RowEmitter {
    fn emit(&mut self, row: Row) -> Result<()> {
        self.main.send(row)?;
        self.ctx.counters.inc_written();
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.ctx.stop.is_stopped()
    }
}

/// Names of the fields appended to a rejected row.
pub const ERROR_FIELD_INDEX: &str = "error_field_index";
pub const ERROR_CODE: &str = "error_code";
pub const ERROR_MESSAGE: &str = "error_message";

/// A rejected input row plus what went wrong with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    pub row: Row,
    pub field_index: Option<usize>,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn from_error(row: Row, err: &RowflowError) -> Self {
        let (field_index, message) = match err {
            RowflowError::Conversion {
                field_index,
                message,
                ..
            } => (*field_index, message.clone()),
            other => (None, other.to_string()),
        };
        Self {
            row,
            field_index,
            code: err.code().to_string(),
            message,
        }
    }

    /// Schema of error rows produced from rows of `input`.
    pub fn schema(input: &Schema) -> Schema {
        input.appended([
            FieldMeta::new(ERROR_FIELD_INDEX, ValueType::Integer),
            FieldMeta::new(ERROR_CODE, ValueType::String),
            FieldMeta::new(ERROR_MESSAGE, ValueType::String),
        ])
    }

    pub fn into_row(self) -> Row {
        let index = self
            .field_index
            .map_or(Value::Null, |i| Value::Integer(i as i64));
        self.row
            .appended([index, Value::String(self.code), Value::String(self.message)])
    }

    /// Split an error row back into its parts.
    pub fn from_row(row: &Row) -> Option<Self> {
        let n = row.len();
        if n < 3 {
            return None;
        }
        let values = row.values();
        let field_index = match &values[n - 3] {
            Value::Null => None,
            Value::Integer(i) => Some(usize::try_from(*i).ok()?),
            _ => return None,
        };
        let (Value::String(code), Value::String(message)) = (&values[n - 2], &values[n - 1])
        else {
            return None;
        };
        Some(Self {
            row: Row::new(values[..n - 3].to_vec()),
            field_index,
            code: code.clone(),
            message: message.clone(),
        })
    }
}
