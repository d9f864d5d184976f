//! Pluggable bail and resource strategies.
//!
//! Strategies are looked up by name in a [`StrategyRegistry`], a map from
//! identifier to factory. Unknown names and malformed settings fail at setup,
//! before any test is scheduled.
//!
//! # Built-in Strategies
//!
//! | Kind | Name | Behavior |
//! |------|------|----------|
//! | Bail | `never` | Never bails |
//! | Bail | `fast` | Bails on the first failure |
//! | Bail | `early` | Bails when the failed-attempt ratio exceeds `early_bail_threshold` |
//! | Resource | `none` | Admits every suite and attempt |
//!
//! # Custom Strategies
//!
//! ```
//! use testfleet::strategy::{BailInfo, BailPolicy, StrategyRegistry};
//! use testfleet::config::Config;
//!
//! struct TenFailures;
//!
//! impl BailPolicy for TenFailures {
//!     fn name(&self) -> &str { "ten-failures" }
//!     fn decide(&self, info: &BailInfo<'_>) -> bool { info.failed.len() >= 10 }
//! }
//!
//! let mut registry = StrategyRegistry::with_builtins();
//! registry.register_bail("ten-failures", |_config| Ok(Box::new(TenFailures)));
//!
//! let strategy = registry.build_bail("ten-failures", &Config::default()).unwrap();
//! assert_eq!(strategy.name(), "ten-failures");
//! ```

pub mod bail;
pub mod resource;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;

pub use bail::{BailInfo, BailPolicy, BailStrategy, EarlyBail, FastBail, NeverBail};
pub use resource::{NoResourceGate, ResourceClaim, ResourcePolicy, ResourceStrategy};

/// Errors raised while resolving or consulting strategies.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("Unknown bail strategy: {0}")]
    UnknownBail(String),

    #[error("Unknown resource strategy: {0}")]
    UnknownResource(String),

    /// The strategy exists but its settings are unusable.
    #[error("Invalid strategy '{name}': {reason}")]
    Invalid { name: String, reason: String },

    /// The resource strategy refused to let the suite start.
    #[error("Suite rejected by resource strategy: {0}")]
    SuiteRejected(String),
}

type BailFactory = Box<dyn Fn(&Config) -> Result<Box<dyn BailPolicy>, StrategyError> + Send + Sync>;
type ResourceFactory =
    Box<dyn Fn(&Config) -> Result<Box<dyn ResourcePolicy>, StrategyError> + Send + Sync>;

/// Name → factory map for bail and resource strategies.
pub struct StrategyRegistry {
    bail: HashMap<String, BailFactory>,
    resource: HashMap<String, ResourceFactory>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            bail: HashMap::new(),
            resource: HashMap::new(),
        }
    }

    /// A registry holding the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_bail("never", |_| Ok(Box::new(NeverBail)));
        registry.register_bail("fast", |_| Ok(Box::new(FastBail)));
        registry.register_bail("early", |config| {
            let threshold = config.testfleet.early_bail_threshold;
            if !(0.0..=1.0).contains(&threshold) {
                return Err(StrategyError::Invalid {
                    name: "early".to_string(),
                    reason: format!("early_bail_threshold must be within [0, 1], got {threshold}"),
                });
            }
            Ok(Box::new(EarlyBail::new(
                threshold,
                config.testfleet.early_bail_min_attempts,
            )))
        });
        registry.register_resource("none", |_| Ok(Box::new(NoResourceGate)));
        registry
    }

    pub fn register_bail<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> Result<Box<dyn BailPolicy>, StrategyError> + Send + Sync + 'static,
    {
        self.bail.insert(name.into(), Box::new(factory));
    }

    pub fn register_resource<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> Result<Box<dyn ResourcePolicy>, StrategyError> + Send + Sync + 'static,
    {
        self.resource.insert(name.into(), Box::new(factory));
    }

    pub fn build_bail(&self, name: &str, config: &Config) -> Result<BailStrategy, StrategyError> {
        let factory = self
            .bail
            .get(name)
            .ok_or_else(|| StrategyError::UnknownBail(name.to_string()))?;
        Ok(BailStrategy::new(factory(config)?))
    }

    pub fn build_resource(
        &self,
        name: &str,
        config: &Config,
    ) -> Result<ResourceStrategy, StrategyError> {
        let factory = self
            .resource
            .get(name)
            .ok_or_else(|| StrategyError::UnknownResource(name.to_string()))?;
        let mut policy = factory(config)?;
        policy.set_configuration(config);
        Ok(ResourceStrategy::new(Arc::from(policy)))
    }

    /// Registered bail strategy names, sorted.
    pub fn bail_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.bail.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
