//! Group-by over input sorted by the group fields.
//!
//! One group is open at a time; a key change closes it. Three output modes:
//! - summary: one row per group, key values followed by the final aggregates
//! - running pass-through: every row followed by the aggregates so far
//! - final pass-through: every row followed by its group's final aggregates, which needs the
//!   whole group buffered (see [`buffer::GroupBuffer`])
//!
//! Unsorted input is not detected: a key that shows up again after another key opens a new,
//! separate group.

pub mod accumulator;
pub mod buffer;

use std::path::PathBuf;

use rowflow_common::metrics::global_metrics;
use rowflow_common::{Result, RowflowError};
use rowflow_execution::{
    FieldMeta, Row, RowOutput, Schema, SchemaRef, StageBehavior, StageContext, Value, ValueType,
    parse_stage_config,
};
use rowflow_spill::SpillLayout;
use serde::Deserialize;
use tracing::debug;

use self::accumulator::{AggSpec, AggState, AggregateKind, DEFAULT_SEPARATOR, Update, init_states};
use self::buffer::GroupBuffer;

pub const TYPE_NAME: &str = "group_by";

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupByConfig {
    #[serde(default)]
    pub group_fields: Vec<String>,
    #[serde(default)]
    pub aggregates: Vec<AggregateDef>,
    /// Emit every input row instead of one row per group.
    #[serde(default)]
    pub pass_all_rows: bool,
    /// With `pass_all_rows`, decorate rows with the aggregates so far instead of the final ones.
    #[serde(default)]
    pub running_values: bool,
    #[serde(default)]
    pub line_number_field: Option<String>,
    #[serde(default)]
    pub spill_dir: Option<String>,
    #[serde(default = "default_spill_prefix")]
    pub spill_prefix: String,
    #[serde(default)]
    pub spill_threshold_rows: Option<usize>,
    /// In summary mode, emit one row even when the input is empty.
    #[serde(default)]
    pub always_return_row: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateDef {
    /// Output field name.
    pub name: String,
    pub kind: AggregateKind,
    /// Source field; optional for `count_all`.
    #[serde(default)]
    pub field: Option<String>,
    /// `concat` separator.
    #[serde(default)]
    pub separator: Option<String>,
}

fn default_spill_prefix() -> String {
    "grp".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Summary,
    Running,
    Final,
}

/// Resolved configuration, built by `initialize`.
#[derive(Debug)]
struct Plan {
    mode: OutputMode,
    group_idx: Vec<usize>,
    specs: Vec<AggSpec>,
    line_numbers: bool,
    threshold: usize,
    layout: SpillLayout,
}

#[derive(Debug)]
struct GroupState {
    key: Vec<Value>,
    states: Vec<AggState>,
    rows: u64,
    buffer: Option<GroupBuffer>,
}

#[derive(Debug)]
pub struct GroupByStage {
    config: GroupByConfig,
    plan: Option<Plan>,
    open: Option<GroupState>,
    seen_rows: bool,
}

impl GroupByStage {
    pub fn new(config: GroupByConfig) -> Self {
        Self {
            config,
            plan: None,
            open: None,
            seen_rows: false,
        }
    }

    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(parse_stage_config(TYPE_NAME, config)?))
    }

    fn plan(&self) -> Result<&Plan> {
        self.plan
            .as_ref()
            .ok_or_else(|| RowflowError::Execution("group_by used before initialize".to_string()))
    }

    fn close_group(&mut self, ctx: &StageContext, out: &mut dyn RowOutput) -> Result<()> {
        let Some(group) = self.open.take() else {
            return Ok(());
        };
        let plan = self.plan()?;
        let finals = group.states.iter().map(AggState::value).collect::<Vec<_>>();
        match plan.mode {
            OutputMode::Summary => {
                out.emit(Row::new(group.key).appended(finals))?;
            }
            OutputMode::Running => {}
            OutputMode::Final => {
                let Some(buffer) = group.buffer else {
                    return Ok(());
                };
                let spilled = buffer.spilled_rows();
                let mut line = 0_i64;
                for row in buffer.into_replay()? {
                    if out.is_stopped() {
                        return Ok(());
                    }
                    line += 1;
                    let mut row = row?.appended(finals.iter().cloned());
                    if plan.line_numbers {
                        row = row.appended([Value::Integer(line)]);
                    }
                    out.emit(row)?;
                }
                if spilled > 0 {
                    debug!(
                        stage = %ctx.instance.stage,
                        copy = ctx.instance.copy,
                        rows = line,
                        spilled,
                        "replayed spilled group"
                    );
                }
            }
        }
        Ok(())
    }
}

impl StageBehavior for GroupByStage {
    fn initialize(&mut self, ctx: &StageContext, input: &SchemaRef) -> Result<SchemaRef> {
        let cfg = &self.config;
        let mode = match (cfg.pass_all_rows, cfg.running_values) {
            (false, false) => OutputMode::Summary,
            (false, true) => {
                return Err(RowflowError::InvalidConfig(
                    "group_by running_values requires pass_all_rows".to_string(),
                ));
            }
            (true, true) => OutputMode::Running,
            (true, false) => OutputMode::Final,
        };
        if mode == OutputMode::Summary && cfg.line_number_field.is_some() {
            return Err(RowflowError::InvalidConfig(
                "group_by line_number_field only applies with pass_all_rows".to_string(),
            ));
        }

        let group_idx = cfg
            .group_fields
            .iter()
            .map(|f| input.require_index(f))
            .collect::<Result<Vec<_>>>()?;

        let mut specs = Vec::with_capacity(cfg.aggregates.len());
        let mut agg_fields = Vec::with_capacity(cfg.aggregates.len());
        for agg in &cfg.aggregates {
            let field = match (&agg.field, agg.kind.needs_field()) {
                (Some(name), _) => Some(input.require_index(name)?),
                (None, false) => None,
                (None, true) => {
                    return Err(RowflowError::InvalidConfig(format!(
                        "aggregate '{}' ({:?}) needs a source field",
                        agg.name, agg.kind
                    )));
                }
            };
            let source = field.map(|i| input.field(i).value_type);
            let output_type = agg.kind.output_type(source).map_err(|reason| {
                RowflowError::InvalidConfig(format!("aggregate '{}': {reason}", agg.name))
            })?;
            let mut meta = FieldMeta::new(agg.name.clone(), output_type);
            if let Some(i) = field.filter(|&i| output_type == input.field(i).value_type) {
                let src = input.field(i);
                meta = meta.with_length_precision(src.length, src.precision);
            }
            agg_fields.push(meta);
            specs.push(AggSpec {
                kind: agg.kind,
                field,
                output_type,
                separator: agg
                    .separator
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            });
        }

        let output = match mode {
            OutputMode::Summary => Schema::new(
                group_idx
                    .iter()
                    .map(|&i| input.field(i).clone())
                    .chain(agg_fields)
                    .collect(),
            ),
            OutputMode::Running | OutputMode::Final => {
                let line = cfg
                    .line_number_field
                    .as_ref()
                    .map(|name| FieldMeta::new(name.clone(), ValueType::Integer));
                input.appended(agg_fields.into_iter().chain(line))
            }
        };
        let mut names = output.names();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(RowflowError::InvalidConfig(format!(
                "group_by output has duplicate field '{}'",
                dup[0]
            )));
        }

        let threshold = cfg
            .spill_threshold_rows
            .unwrap_or(ctx.engine.spill_threshold_rows);
        if threshold == 0 {
            return Err(RowflowError::InvalidConfig(
                "group_by spill_threshold_rows must be at least 1".to_string(),
            ));
        }
        let dir = cfg
            .spill_dir
            .clone()
            .unwrap_or_else(|| ctx.engine.spill_dir.clone());
        self.plan = Some(Plan {
            mode,
            group_idx,
            specs,
            line_numbers: cfg.line_number_field.is_some(),
            threshold,
            layout: SpillLayout::new(PathBuf::from(dir), cfg.spill_prefix.clone()),
        });
        Ok(SchemaRef::new(output))
    }

    fn process_row(
        &mut self,
        ctx: &StageContext,
        row: Row,
        out: &mut dyn RowOutput,
    ) -> Result<()> {
        let plan = self.plan()?;
        let key = row.project(&plan.group_idx);
        let same_group = self
            .open
            .as_ref()
            .is_some_and(|g| Value::same_key(&g.key, &key));

        // Convert against the state this row would update before changing anything.
        let fresh;
        let states = match (&self.open, same_group) {
            (Some(g), true) => &g.states,
            _ => {
                fresh = init_states(&plan.specs);
                &fresh
            }
        };
        let updates = plan
            .specs
            .iter()
            .zip(states)
            .map(|(spec, state)| {
                let value = spec
                    .field
                    .and_then(|i| row.get(i))
                    .unwrap_or(&NULL);
                state.prepare(spec, value)
            })
            .collect::<Result<Vec<Update>>>()?;

        if !same_group {
            self.close_group(ctx, out)?;
            let plan = self.plan()?;
            let buffer = (plan.mode == OutputMode::Final)
                .then(|| GroupBuffer::new(plan.threshold, plan.layout.clone()));
            self.open = Some(GroupState {
                key,
                states: init_states(&plan.specs),
                rows: 0,
                buffer,
            });
        }
        self.seen_rows = true;

        let plan = self.plan.as_ref().ok_or_else(|| {
            RowflowError::Execution("group_by used before initialize".to_string())
        })?;
        let Some(group) = self.open.as_mut() else {
            return Ok(());
        };
        for ((spec, state), update) in plan.specs.iter().zip(&mut group.states).zip(updates) {
            state.apply(spec, update);
        }
        group.rows += 1;

        match plan.mode {
            OutputMode::Summary => Ok(()),
            OutputMode::Running => {
                let mut decorated = row.appended(group.states.iter().map(AggState::value));
                if plan.line_numbers {
                    decorated = decorated.appended([Value::Integer(group.rows as i64)]);
                }
                out.emit(decorated)
            }
            OutputMode::Final => {
                let Some(buffer) = group.buffer.as_mut() else {
                    return Ok(());
                };
                if let Some(event) = buffer.push(row)? {
                    debug!(
                        stage = %ctx.instance.stage,
                        copy = ctx.instance.copy,
                        rows = event.rows,
                        bytes = event.bytes,
                        group_rows = group.rows,
                        "group buffer spilled"
                    );
                    if ctx.engine.metrics_enabled {
                        global_metrics().record_spill(
                            &ctx.run_id.to_string(),
                            &ctx.instance.stage,
                            TYPE_NAME,
                            event.rows,
                            event.bytes,
                            event.secs,
                        );
                    }
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self, ctx: &StageContext, out: &mut dyn RowOutput) -> Result<()> {
        if self.open.is_some() {
            return self.close_group(ctx, out);
        }
        let plan = self.plan()?;
        if plan.mode == OutputMode::Summary && self.config.always_return_row && !self.seen_rows {
            let empty = init_states(&plan.specs);
            let row = Row::new(vec![Value::Null; plan.group_idx.len()])
                .appended(empty.iter().map(AggState::value));
            out.emit(row)?;
        }
        Ok(())
    }

    fn dispose(&mut self) {
        // Drops any open buffer, deleting its spill file.
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rowflow_common::{EngineConfig, Result, RunId, StageInstanceId};
    use rowflow_execution::{
        FieldMeta, Row, RowOutput, Schema, SchemaRef, StageBehavior, StageContext, Value, ValueType,
    };
    use serde_json::json;

    use super::GroupByStage;

    #[derive(Default)]
    struct Sink(Vec<Row>);

    impl RowOutput for Sink {
        fn emit(&mut self, row: Row) -> Result<()> {
            self.0.push(row);
            Ok(())
        }

        fn is_stopped(&self) -> bool {
            false
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(
            "unit",
            RunId::next(),
            StageInstanceId::new("group", 0),
            Arc::new(EngineConfig::default()),
        )
    }

    fn input() -> SchemaRef {
        Arc::new(Schema::new(vec![
            FieldMeta::new("k", ValueType::String),
            FieldMeta::new("a", ValueType::String),
            FieldMeta::new("b", ValueType::String),
        ]))
    }

    fn row(k: &str, a: &str, b: &str) -> Row {
        Row::new(vec![Value::from(k), Value::from(a), Value::from(b)])
    }

    fn stage(extra: serde_json::Value) -> GroupByStage {
        let mut config = json!({
            "group_fields": ["k"],
            "aggregates": [
                {"name": "sum_a", "kind": "sum", "field": "a"},
                {"name": "sum_b", "kind": "sum", "field": "b"}
            ]
        });
        if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        GroupByStage::from_json(&config).expect("config")
    }

    #[test]
    fn failed_row_leaves_running_state_untouched() {
        let ctx = ctx();
        let mut group = stage(json!({"pass_all_rows": true, "running_values": true}));
        let schema = group.initialize(&ctx, &input()).expect("initialize");
        assert_eq!(schema.names(), vec!["k", "a", "b", "sum_a", "sum_b"]);

        let mut out = Sink::default();
        group
            .process_row(&ctx, row("A", "1", "1"), &mut out)
            .expect("first row");
        let err = group
            .process_row(&ctx, row("A", "2", "x"), &mut out)
            .expect_err("bad b");
        assert!(err.is_row_error());
        group
            .process_row(&ctx, row("A", "3", "3"), &mut out)
            .expect("third row");

        let sums = out
            .0
            .iter()
            .map(|r| (r.values()[3].clone(), r.values()[4].clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            sums,
            vec![
                (Value::Number(1.0), Value::Number(1.0)),
                (Value::Number(4.0), Value::Number(4.0)),
            ]
        );
    }

    #[test]
    fn failed_first_row_of_new_key_keeps_previous_group_open() {
        let ctx = ctx();
        let mut group = stage(json!({}));
        group.initialize(&ctx, &input()).expect("initialize");

        let mut out = Sink::default();
        group
            .process_row(&ctx, row("A", "1", "2"), &mut out)
            .expect("first row");
        assert!(
            group
                .process_row(&ctx, row("B", "x", "1"), &mut out)
                .is_err()
        );
        assert!(out.0.is_empty());

        group
            .process_row(&ctx, row("A", "5", "5"), &mut out)
            .expect("same group");
        group.finish(&ctx, &mut out).expect("finish");
        assert_eq!(
            out.0,
            vec![Row::new(vec![
                Value::from("A"),
                Value::Number(6.0),
                Value::Number(7.0),
            ])]
        );
    }

    #[test]
    fn rejects_inconsistent_modes() {
        let ctx = ctx();
        let mut running_only = stage(json!({"running_values": true}));
        assert!(running_only.initialize(&ctx, &input()).is_err());

        let mut numbered_summary = stage(json!({"line_number_field": "n"}));
        assert!(numbered_summary.initialize(&ctx, &input()).is_err());

        let mut clash = stage(json!({"pass_all_rows": true, "line_number_field": "sum_a"}));
        let err = clash.initialize(&ctx, &input()).expect_err("duplicate field");
        assert!(err.to_string().contains("duplicate field 'sum_a'"));

        let unknown_key = GroupByStage::from_json(&json!({"group_by": ["k"]}));
        assert!(unknown_key.is_err());
    }
}
