use rowflow_common::{Result, RowflowError};
use rowflow_execution::{
    FieldMeta, Row, RowOutput, Schema, SchemaRef, StageBehavior, StageContext, Value,
    parse_stage_config,
};
use serde::Deserialize;

pub const TYPE_NAME: &str = "values";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValuesConfig {
    pub fields: Vec<FieldMeta>,
    /// One JSON array per row, one element per field.
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Source emitting literal rows from its configuration.
#[derive(Debug)]
pub struct ValuesStage {
    config: ValuesConfig,
    rows: Vec<Row>,
}

impl ValuesStage {
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            config: parse_stage_config(TYPE_NAME, config)?,
            rows: Vec::new(),
        })
    }
}

impl StageBehavior for ValuesStage {
    fn initialize(&mut self, _ctx: &StageContext, _input: &SchemaRef) -> Result<SchemaRef> {
        let fields = &self.config.fields;
        self.rows = self
            .config
            .rows
            .iter()
            .enumerate()
            .map(|(n, literal)| {
                if literal.len() != fields.len() {
                    return Err(RowflowError::InvalidConfig(format!(
                        "values row {n} has {} values for {} fields",
                        literal.len(),
                        fields.len()
                    )));
                }
                literal
                    .iter()
                    .zip(fields)
                    .map(|(json, field)| Value::from_json(json, field.value_type))
                    .collect::<Result<Vec<_>>>()
                    .map(Row::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SchemaRef::new(Schema::new(fields.clone())))
    }

    fn is_source(&self) -> bool {
        true
    }

    fn generate(&mut self, ctx: &StageContext, out: &mut dyn RowOutput) -> Result<()> {
        for row in std::mem::take(&mut self.rows) {
            if out.is_stopped() {
                break;
            }
            ctx.counters.inc_input();
            out.emit(row)?;
        }
        Ok(())
    }
}
