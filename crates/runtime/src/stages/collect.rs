use rowflow_common::Result;
use rowflow_execution::{Row, RowOutput, SchemaRef, StageBehavior, StageContext};

pub const TYPE_NAME: &str = "collect";

/// Sink that keeps every row for the completion result.
///
/// Rows are also forwarded, so a collect stage may sit in the middle of a pipeline.
#[derive(Debug, Default)]
pub struct CollectStage {
    rows: Vec<Row>,
}

impl StageBehavior for CollectStage {
    fn initialize(&mut self, _ctx: &StageContext, input: &SchemaRef) -> Result<SchemaRef> {
        Ok(SchemaRef::clone(input))
    }

    fn process_row(&mut self, ctx: &StageContext, row: Row, out: &mut dyn RowOutput) -> Result<()> {
        ctx.counters.inc_output();
        self.rows.push(row.clone());
        out.emit(row)
    }

    fn take_collected(&mut self) -> Option<Vec<Row>> {
        Some(std::mem::take(&mut self.rows))
    }
}
