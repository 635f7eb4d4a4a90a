use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rowflow_common::{Result, RowflowError};
use serde::de::DeserializeOwned;

use crate::stage::StageBehavior;

/// Builds a fresh behavior for one stage instance from its JSON configuration.
pub trait StageFactory: Send + Sync {
    /// Stage type tag used in pipeline definitions.
    fn type_name(&self) -> &str;

    /// Parse `config` and return a new, uninitialized behavior.
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn StageBehavior>>;
}

type CreateFn = dyn Fn(&serde_json::Value) -> Result<Box<dyn StageBehavior>> + Send + Sync;

/// [`StageFactory`] backed by a closure.
pub struct FnStageFactory {
    name: String,
    create: Box<CreateFn>,
}

impl FnStageFactory {
    pub fn new<F>(name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn StageBehavior>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            create: Box::new(create),
        }
    }
}

impl StageFactory for FnStageFactory {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn StageBehavior>> {
        (self.create)(config)
    }
}

/// Stage-type table built at start-up and passed to the scheduler.
#[derive(Default, Clone)]
pub struct StageRegistry {
    factories: HashMap<String, Arc<dyn StageFactory>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("types", &self.names())
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a factory.
    ///
    /// Returns `true` when an existing factory with the same type name was replaced.
    pub fn register(&mut self, factory: Arc<dyn StageFactory>) -> bool {
        self.factories
            .insert(factory.type_name().to_string(), factory)
            .is_some()
    }

    /// Register a closure as the factory for `name`.
    pub fn register_fn<F>(&mut self, name: &str, create: F) -> bool
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn StageBehavior>> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnStageFactory::new(name, create)))
    }

    pub fn deregister(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StageFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.factories.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Create a behavior of type `name`; unknown types are configuration errors.
    pub fn create(&self, name: &str, config: &serde_json::Value) -> Result<Box<dyn StageBehavior>> {
        let factory = self.get(name).ok_or_else(|| {
            RowflowError::InvalidConfig(format!(
                "unknown stage type '{name}' (known: {})",
                self.names().join(", ")
            ))
        })?;
        factory.create(config)
    }
}

/// Deserialize a stage's JSON configuration into its typed form.
///
/// A JSON `null` is read as an empty object so all-default configs may be omitted.
pub fn parse_stage_config<T: DeserializeOwned>(
    stage_type: &str,
    config: &serde_json::Value,
) -> Result<T> {
    let value = if config.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| RowflowError::InvalidConfig(format!("{stage_type} config: {e}")))
}
