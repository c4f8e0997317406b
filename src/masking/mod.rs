//! Masking strategies
//!
//! Strategies are registered at compile time and looked up by key at runtime, the
//! same way erasure rules reference them (`"strategy": "hash"`).

mod strategies;

pub use strategies::{HashStrategy, NullRewriteStrategy, RandomStringRewriteStrategy, StringRewriteStrategy};

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::MaskingError;
use crate::policy::MaskingSpec;

pub trait MaskingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mask every value, keeping positions. `request_id` is the privacy request being
    /// processed; the hash strategy can fold it into its salt.
    fn mask(&self, values: &[Value], request_id: Option<&str>) -> Vec<Value>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationDescription {
    pub key: String,
    pub optional: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaskingStrategyDescription {
    pub name: String,
    pub description: String,
    pub configurations: Vec<ConfigurationDescription>,
}

type StrategyFactory = fn(&Value) -> Result<Box<dyn MaskingStrategy>, MaskingError>;

struct RegisteredStrategy {
    build: StrategyFactory,
    describe: fn() -> MaskingStrategyDescription,
}

pub struct MaskingStrategyRegistry {
    strategies: BTreeMap<&'static str, RegisteredStrategy>,
}

impl MaskingStrategyRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            strategies: BTreeMap::new(),
        };
        registry.register(NullRewriteStrategy::NAME, NullRewriteStrategy::from_config, NullRewriteStrategy::describe);
        registry.register(
            StringRewriteStrategy::NAME,
            StringRewriteStrategy::from_config,
            StringRewriteStrategy::describe,
        );
        registry.register(HashStrategy::NAME, HashStrategy::from_config, HashStrategy::describe);
        registry.register(
            RandomStringRewriteStrategy::NAME,
            RandomStringRewriteStrategy::from_config,
            RandomStringRewriteStrategy::describe,
        );
        registry
    }

    fn register(&mut self, name: &'static str, build: StrategyFactory, describe: fn() -> MaskingStrategyDescription) {
        self.strategies.insert(name, RegisteredStrategy { build, describe });
    }

    pub fn get_strategy(&self, name: &str, configuration: &Value) -> Result<Box<dyn MaskingStrategy>, MaskingError> {
        let registered = self
            .strategies
            .get(name)
            .ok_or_else(|| MaskingError::NoSuchStrategy(name.to_string()))?;
        (registered.build)(configuration)
    }

    pub fn descriptions(&self) -> Vec<MaskingStrategyDescription> {
        self.strategies.values().map(|s| (s.describe)()).collect()
    }

    /// Check every spec resolves to a strategy with a valid configuration.
    pub fn validate(&self, specs: &[MaskingSpec]) -> Result<(), MaskingError> {
        for spec in specs {
            self.get_strategy(&spec.strategy, &spec.configuration)?;
        }
        Ok(())
    }

    /// Run the specs in order, each one masking the output of the previous one.
    pub fn mask_values(
        &self,
        values: &[Value],
        specs: &[MaskingSpec],
        request_id: Option<&str>,
    ) -> Result<Vec<Value>, MaskingError> {
        if specs.len() > 1 {
            debug!("{} masking strategies requested; running in order", specs.len());
        }
        let mut masked = values.to_vec();
        for spec in specs {
            let strategy = self.get_strategy(&spec.strategy, &spec.configuration)?;
            debug!("Starting masking of {} value(s) with strategy {}", masked.len(), strategy.name());
            masked = strategy.mask(&masked, request_id);
        }
        Ok(masked)
    }
}

impl Default for MaskingStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
