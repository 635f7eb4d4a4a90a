use rowflow_common::{Result, RowflowError};
use rowflow_execution::{
    FieldMeta, Row, RowOutput, Schema, SchemaRef, StageBehavior, StageContext, Value, ValueType,
    parse_stage_config,
};
use serde::Deserialize;

pub const TYPE_NAME: &str = "generate_rows";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateRowsConfig {
    #[serde(default)]
    pub fields: Vec<FieldMeta>,
    /// One literal per field, repeated on every row.
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    /// Rows to emit; unbounded until stopped when absent.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Integer field appended after `fields`, counting from `sequence_start`.
    #[serde(default)]
    pub sequence_field: Option<String>,
    #[serde(default = "default_one")]
    pub sequence_start: i64,
    #[serde(default = "default_one")]
    pub sequence_step: i64,
}

fn default_one() -> i64 {
    1
}

/// Source emitting the same row over and over, optionally numbered.
#[derive(Debug)]
pub struct GenerateRowsStage {
    config: GenerateRowsConfig,
    template: Vec<Value>,
}

impl GenerateRowsStage {
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            config: parse_stage_config(TYPE_NAME, config)?,
            template: Vec::new(),
        })
    }
}

impl StageBehavior for GenerateRowsStage {
    fn initialize(&mut self, _ctx: &StageContext, _input: &SchemaRef) -> Result<SchemaRef> {
        let cfg = &self.config;
        if cfg.values.len() != cfg.fields.len() {
            return Err(RowflowError::InvalidConfig(format!(
                "generate_rows has {} values for {} fields",
                cfg.values.len(),
                cfg.fields.len()
            )));
        }
        self.template = cfg
            .values
            .iter()
            .zip(&cfg.fields)
            .map(|(json, field)| Value::from_json(json, field.value_type))
            .collect::<Result<Vec<_>>>()?;

        let mut fields = cfg.fields.clone();
        if let Some(name) = &cfg.sequence_field {
            fields.push(FieldMeta::new(name.clone(), ValueType::Integer));
        }
        Ok(SchemaRef::new(Schema::new(fields)))
    }

    fn is_source(&self) -> bool {
        true
    }

    fn generate(&mut self, ctx: &StageContext, out: &mut dyn RowOutput) -> Result<()> {
        let mut emitted = 0_u64;
        let mut sequence = self.config.sequence_start;
        while self.config.limit.is_none_or(|limit| emitted < limit) {
            if out.is_stopped() {
                break;
            }
            let mut row = Row::new(self.template.clone());
            if self.config.sequence_field.is_some() {
                row = row.appended([Value::Integer(sequence)]);
                sequence = sequence.wrapping_add(self.config.sequence_step);
            }
            ctx.counters.inc_input();
            out.emit(row)?;
            emitted += 1;
        }
        Ok(())
    }
}
