use std::collections::HashSet;

use rowflow_common::{EngineConfig, RowflowError};
use rowflow_execution::{Row, RowOutput, SchemaRef, StageBehavior, StageContext, Value};
use rowflow_runtime::{PipelineDef, Scheduler, builtin_registry};
use serde_json::json;

fn pipeline(value: serde_json::Value) -> PipelineDef {
    serde_json::from_value(value).expect("pipeline json")
}

fn small_channels() -> EngineConfig {
    EngineConfig {
        channel_capacity: 1,
        ..EngineConfig::default()
    }
}

fn sequence_source(limit: u64) -> serde_json::Value {
    json!({"name": "gen", "type": "generate_rows", "config": {
        "fields": [{"name": "tag", "type": "string"}],
        "values": ["t"],
        "limit": limit,
        "sequence_field": "n"
    }})
}

fn sequence_numbers(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r.get(1) {
            Some(Value::Integer(n)) => *n,
            other => panic!("unexpected sequence value {other:?}"),
        })
        .collect()
}

#[test]
fn rows_arrive_in_order_through_capacity_one_channels() {
    let def = pipeline(json!({
        "name": "backpressure",
        "stages": [
            sequence_source(500),
            {"name": "pass", "type": "dummy"},
            {"name": "out", "type": "collect"}
        ],
        "hops": [{"from": "gen", "to": "pass"}, {"from": "pass", "to": "out"}]
    }));
    let result = Scheduler::new(builtin_registry(), small_channels())
        .run(&def)
        .expect("run");
    assert!(result.success);
    assert_eq!(sequence_numbers(result.rows("out")), (1..=500).collect::<Vec<_>>());

    let gen_counters = result.stage_counters("gen");
    assert_eq!(gen_counters.input, 500);
    assert_eq!(gen_counters.written, 500);
    assert_eq!(result.stage_counters("pass").read, 500);
    assert_eq!(result.stage_counters("out").output, 500);
}

#[test]
fn round_robin_spreads_rows_over_copies() {
    let def = pipeline(json!({
        "name": "round-robin",
        "stages": [
            sequence_source(90),
            {"name": "pass", "type": "dummy", "copies": 3},
            {"name": "out", "type": "collect"}
        ],
        "hops": [{"from": "gen", "to": "pass"}, {"from": "pass", "to": "out"}]
    }));
    let result = Scheduler::new(builtin_registry(), EngineConfig::default())
        .run(&def)
        .expect("run");
    assert!(result.success);

    let per_copy = result
        .stages
        .iter()
        .filter(|s| s.instance.stage == "pass")
        .map(|s| s.counters.read)
        .collect::<Vec<_>>();
    assert_eq!(per_copy, vec![30, 30, 30]);

    let mut seen = sequence_numbers(result.rows("out"));
    seen.sort_unstable();
    assert_eq!(seen, (1..=90).collect::<Vec<_>>());
}

#[test]
fn copy_distribution_sends_every_row_to_every_target() {
    let def = pipeline(json!({
        "name": "copy",
        "stages": [
            {"name": "gen", "type": "generate_rows", "distribution": "copy", "config": {
                "fields": [{"name": "tag", "type": "string"}],
                "values": ["t"],
                "limit": 10,
                "sequence_field": "n"
            }},
            {"name": "left", "type": "collect"},
            {"name": "right", "type": "collect"}
        ],
        "hops": [{"from": "gen", "to": "left"}, {"from": "gen", "to": "right"}]
    }));
    let result = Scheduler::new(builtin_registry(), EngineConfig::default())
        .run(&def)
        .expect("run");
    assert_eq!(result.rows("left"), result.rows("right"));
    assert_eq!(result.rows("left").len(), 10);
    assert_eq!(result.stage_counters("gen").written, 10);
}

#[test]
fn fan_in_reads_every_input_to_the_end() {
    let def = pipeline(json!({
        "name": "fan-in",
        "stages": [
            {"name": "a", "type": "generate_rows", "config": {
                "fields": [{"name": "tag", "type": "string"}],
                "values": ["a"], "limit": 40, "sequence_field": "n"
            }},
            {"name": "b", "type": "generate_rows", "config": {
                "fields": [{"name": "tag", "type": "string"}],
                "values": ["b"], "limit": 60, "sequence_field": "n"
            }},
            {"name": "out", "type": "collect"}
        ],
        "hops": [{"from": "a", "to": "out"}, {"from": "b", "to": "out"}]
    }));
    let result = Scheduler::new(builtin_registry(), small_channels())
        .run(&def)
        .expect("run");
    let rows = result.rows("out");
    assert_eq!(rows.len(), 100);
    let from_a = rows
        .iter()
        .filter(|r| r.get(0) == Some(&Value::from("a")))
        .count();
    assert_eq!(from_a, 40);
}

#[test]
fn stopping_an_unbounded_source_ends_every_stage() {
    let def = pipeline(json!({
        "name": "stop",
        "stages": [
            {"name": "gen", "type": "generate_rows", "config": {
                "fields": [{"name": "tag", "type": "string"}],
                "values": ["t"]
            }},
            {"name": "pass", "type": "dummy", "copies": 2},
            {"name": "sink", "type": "dummy"}
        ],
        "hops": [{"from": "gen", "to": "pass"}, {"from": "pass", "to": "sink"}]
    }));
    let running = Scheduler::new(builtin_registry(), small_channels())
        .start(&def)
        .expect("start");
    while running
        .counters()
        .iter()
        .all(|(id, c)| id.stage != "sink" || c.read == 0)
    {
        std::thread::yield_now();
    }
    running.stop();
    assert!(running.is_stopped());
    let result = running.wait();
    assert!(result.stopped);
    assert!(result.success);
    assert_eq!(result.stages.len(), 4);
}

#[test]
fn mixed_row_layouts_are_rejected() {
    let def = pipeline(json!({
        "name": "mixing",
        "stages": [
            {"name": "a", "type": "values", "config": {
                "fields": [{"name": "x", "type": "integer"}], "rows": [[1]]
            }},
            {"name": "b", "type": "values", "config": {
                "fields": [{"name": "y", "type": "string"}], "rows": [["1"]]
            }},
            {"name": "join", "type": "dummy"}
        ],
        "hops": [{"from": "a", "to": "join"}, {"from": "b", "to": "join"}]
    }));
    let err = Scheduler::new(builtin_registry(), EngineConfig::default())
        .prepare(&def)
        .err()
        .expect("row mixing");
    assert!(err.to_string().contains("mixes row layouts"), "{err}");
}

#[test]
fn graph_errors_fail_before_any_stage_runs() {
    let scheduler = Scheduler::new(builtin_registry(), EngineConfig::default());

    let cyclic = pipeline(json!({
        "name": "cycle",
        "stages": [
            {"name": "a", "type": "dummy"},
            {"name": "b", "type": "dummy"}
        ],
        "hops": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
    }));
    let err = scheduler.prepare(&cyclic).err().expect("cycle");
    assert!(err.to_string().contains("cycle"), "{err}");

    let unknown_type = pipeline(json!({
        "name": "unknown",
        "stages": [{"name": "a", "type": "no_such_stage"}],
        "hops": []
    }));
    let err = scheduler.prepare(&unknown_type).err().expect("unknown type");
    assert!(err.to_string().contains("unknown stage type 'no_such_stage'"), "{err}");

    let orphan = pipeline(json!({
        "name": "orphan",
        "stages": [{"name": "a", "type": "dummy"}],
        "hops": []
    }));
    assert!(matches!(
        scheduler.prepare(&orphan).err(),
        Some(RowflowError::InvalidConfig(_))
    ));
}

/// Fails on the nth row it sees.
struct Tripwire {
    after: u64,
    seen: u64,
}

impl StageBehavior for Tripwire {
    fn initialize(&mut self, _ctx: &StageContext, input: &SchemaRef) -> rowflow_common::Result<SchemaRef> {
        Ok(input.clone())
    }

    fn process_row(
        &mut self,
        _ctx: &StageContext,
        row: Row,
        out: &mut dyn RowOutput,
    ) -> rowflow_common::Result<()> {
        self.seen += 1;
        if self.seen == self.after {
            return Err(RowflowError::Execution("tripwire".to_string()));
        }
        out.emit(row)
    }
}

#[test]
fn a_failing_stage_stops_the_whole_pipeline() {
    let mut registry = builtin_registry();
    registry.register_fn("tripwire", |_cfg| {
        Ok(Box::new(Tripwire { after: 5, seen: 0 }))
    });
    let def = pipeline(json!({
        "name": "failure",
        "stages": [
            {"name": "gen", "type": "generate_rows", "config": {
                "fields": [{"name": "tag", "type": "string"}],
                "values": ["t"]
            }},
            {"name": "trip", "type": "tripwire"},
            {"name": "out", "type": "collect"}
        ],
        "hops": [{"from": "gen", "to": "trip"}, {"from": "trip", "to": "out"}]
    }));
    let result = Scheduler::new(registry, small_channels())
        .run(&def)
        .expect("run");
    assert!(!result.success);
    assert!(result.stopped);
    assert_eq!(result.errors, 1);
    assert!(result.rows("out").len() <= 4);

    let failed = result
        .stages
        .iter()
        .filter_map(|s| s.failure.as_deref())
        .collect::<HashSet<_>>();
    assert_eq!(failed.len(), 1);
    assert!(failed.iter().all(|f| f.contains("tripwire")));
}

#[test]
fn errors_can_be_tolerated() {
    let mut registry = builtin_registry();
    registry.register_fn("tripwire", |_cfg| {
        Ok(Box::new(Tripwire { after: 3, seen: 0 }))
    });
    let def = pipeline(json!({
        "name": "tolerant",
        "require_zero_errors": false,
        "stages": [
            sequence_source(10),
            {"name": "trip", "type": "tripwire"}
        ],
        "hops": [{"from": "gen", "to": "trip"}]
    }));
    let result = Scheduler::new(registry, EngineConfig::default())
        .run(&def)
        .expect("run");
    assert_eq!(result.errors, 1);
    assert!(result.success);
}

/// Passes `limit` rows through, then panics.
struct Panicker {
    limit: u64,
    seen: u64,
}

impl StageBehavior for Panicker {
    fn initialize(&mut self, _ctx: &StageContext, input: &SchemaRef) -> rowflow_common::Result<SchemaRef> {
        Ok(input.clone())
    }

    fn process_row(
        &mut self,
        _ctx: &StageContext,
        row: Row,
        out: &mut dyn RowOutput,
    ) -> rowflow_common::Result<()> {
        self.seen += 1;
        assert!(self.seen <= self.limit, "row limit exceeded");
        out.emit(row)
    }
}

#[test]
fn a_panicking_stage_keeps_partial_groups_from_the_sink() {
    let mut registry = builtin_registry();
    registry.register_fn("panicker", |_cfg| {
        Ok(Box::new(Panicker { limit: 2, seen: 0 }))
    });
    let def = pipeline(json!({
        "name": "panic",
        "stages": [
            {"name": "src", "type": "values", "config": {
                "fields": [{"name": "k", "type": "string"}, {"name": "v", "type": "integer"}],
                "rows": [["A", 1], ["A", 2], ["A", 3], ["A", 4]]
            }},
            {"name": "boom", "type": "panicker"},
            {"name": "group", "type": "group_by", "config": {
                "group_fields": ["k"],
                "aggregates": [{"name": "total", "kind": "sum", "field": "v"}]
            }},
            {"name": "out", "type": "collect"}
        ],
        "hops": [
            {"from": "src", "to": "boom"},
            {"from": "boom", "to": "group"},
            {"from": "group", "to": "out"}
        ]
    }));
    for _ in 0..20 {
        let result = Scheduler::new(registry.clone(), small_channels())
            .run(&def)
            .expect("run");
        assert!(!result.success);
        assert!(result.stopped);
        assert!(result.rows("out").is_empty(), "{:?}", result.rows("out"));
        assert_eq!(result.stage_counters("group").written, 0);

        let boom = result.stage_counters("boom");
        assert_eq!(boom.errors, 1);
        let failure = result
            .stages
            .iter()
            .find_map(|s| s.failure.as_deref())
            .expect("failure recorded");
        assert!(failure.contains("stage panicked: row limit exceeded"), "{failure}");
    }
}
