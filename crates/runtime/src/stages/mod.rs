//! Built-in stage types.

pub mod collect;
pub mod dummy;
pub mod generate_rows;
pub mod group_by;
pub mod values;

use rowflow_execution::StageRegistry;

pub use collect::CollectStage;
pub use dummy::DummyStage;
pub use generate_rows::GenerateRowsStage;
pub use group_by::GroupByStage;
pub use values::ValuesStage;

/// Registry holding every built-in stage type.
pub fn builtin_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register_fn(values::TYPE_NAME, |cfg| Ok(Box::new(ValuesStage::from_json(cfg)?)));
    registry.register_fn(generate_rows::TYPE_NAME, |cfg| {
        Ok(Box::new(GenerateRowsStage::from_json(cfg)?))
    });
    registry.register_fn(dummy::TYPE_NAME, |_| Ok(Box::new(DummyStage)));
    registry.register_fn(group_by::TYPE_NAME, |cfg| {
        Ok(Box::new(GroupByStage::from_json(cfg)?))
    });
    registry.register_fn(collect::TYPE_NAME, |_| Ok(Box::new(CollectStage::default())));
    registry
}
