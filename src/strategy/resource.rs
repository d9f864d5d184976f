//! Resource policies: admission control for the suite and for each attempt.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::Config;
use crate::test::{Browser, Test};

use super::StrategyError;

/// A claim on external resources made before a suite or attempt starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceClaim {
    pub test: String,
    pub browser: Browser,
}

impl From<&Test> for ResourceClaim {
    fn from(test: &Test) -> Self {
        Self {
            test: test.locator.clone(),
            browser: test.browser.clone(),
        }
    }
}

/// Admission control hooks.
///
/// Rejections carry a reason string; [`ResourceStrategy`] falls back to the
/// policy's `fail_reason` when the reason is empty.
#[async_trait]
pub trait ResourcePolicy: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn fail_reason(&self) -> Option<&str> {
        None
    }

    /// Receives the run configuration once, before any claim.
    fn set_configuration(&mut self, _config: &Config) {}

    async fn proceed_suite(&self, resources: &[ResourceClaim]) -> Result<(), String>;

    async fn proceed_test(&self, resource: &ResourceClaim) -> Result<(), String>;
}

/// Admits everything.
pub struct NoResourceGate;

#[async_trait]
impl ResourcePolicy for NoResourceGate {
    fn name(&self) -> &str {
        "none"
    }

    fn description(&self) -> Option<&str> {
        Some("No resource gating")
    }

    fn fail_reason(&self) -> Option<&str> {
        Some("never fails")
    }

    async fn proceed_suite(&self, _resources: &[ResourceClaim]) -> Result<(), String> {
        Ok(())
    }

    async fn proceed_test(&self, _resource: &ResourceClaim) -> Result<(), String> {
        Ok(())
    }
}

/// A shared handle to a resource policy.
#[derive(Clone)]
pub struct ResourceStrategy {
    policy: Arc<dyn ResourcePolicy>,
}

impl ResourceStrategy {
    pub fn new(policy: Arc<dyn ResourcePolicy>) -> Self {
        Self { policy }
    }

    pub fn name(&self) -> &str {
        self.policy.name()
    }

    pub fn get_description(&self) -> String {
        match self.policy.description() {
            Some(description) => description.to_string(),
            None => {
                warn!("Resource strategy '{}' has no description", self.name());
                String::new()
            }
        }
    }

    pub fn get_fail_reason(&self) -> String {
        match self.policy.fail_reason() {
            Some(reason) => reason.to_string(),
            None => {
                warn!("Resource strategy '{}' has no fail reason", self.name());
                String::new()
            }
        }
    }

    /// Gates the whole suite. A rejection is fatal to starting the run.
    pub async fn proceed_suite(&self, resources: &[ResourceClaim]) -> Result<(), StrategyError> {
        self.policy
            .proceed_suite(resources)
            .await
            .map_err(|reason| StrategyError::SuiteRejected(self.reason_or_default(reason)))
    }

    /// Gates one attempt. The error is the reason to record on the test.
    pub async fn proceed_test(&self, resource: &ResourceClaim) -> Result<(), String> {
        self.policy
            .proceed_test(resource)
            .await
            .map_err(|reason| self.reason_or_default(reason))
    }

    fn reason_or_default(&self, reason: String) -> String {
        if reason.is_empty() {
            self.get_fail_reason()
        } else {
            reason
        }
    }
}
