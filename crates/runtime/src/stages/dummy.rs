use rowflow_common::Result;
use rowflow_execution::{Row, RowOutput, SchemaRef, StageBehavior, StageContext};

pub const TYPE_NAME: &str = "dummy";

/// Passes every row through unchanged.
#[derive(Debug, Default)]
pub struct DummyStage;

impl StageBehavior for DummyStage {
    fn initialize(&mut self, _ctx: &StageContext, input: &SchemaRef) -> Result<SchemaRef> {
        Ok(SchemaRef::clone(input))
    }

    fn process_row(&mut self, _ctx: &StageContext, row: Row, out: &mut dyn RowOutput) -> Result<()> {
        out.emit(row)
    }
}
