//! Row model, bounded channels, and the stage contract.
//!
//! Architecture role:
//! - typed values, rows, and schemas moved between stages
//! - the bounded SPSC row channel and its cancellation handles
//! - the stage capability trait, row routing, counters, and error envelopes
//! - the start-up stage-type registry
//!
//! Key modules:
//! - [`row`]
//! - [`channel`]
//! - [`stage`]
//! - [`context`]
//! - [`registry`]

pub mod channel;
pub mod context;
pub mod registry;
pub mod row;
pub mod stage;

pub use channel::{ChannelCanceller, RowReceiver, RowSender, TryRecv, row_channel};
pub use context::{StageContext, StopSignal};
pub use registry::{FnStageFactory, StageFactory, StageRegistry, parse_stage_config};
pub use row::{FieldMeta, Row, Schema, SchemaRef, Value, ValueType};
pub use stage::{
    CounterSnapshot, Distribution, ErrorEnvelope, RowEmitter, RowOutput, StageBehavior,
    StageCounters,
};
