//! Bail policies: when to abandon the rest of a run.

use tracing::warn;

use crate::test::Test;

/// What a bail policy sees after each completed attempt.
///
/// `passed` and `failed` hold the tests currently in the runner's passed and
/// failed lists. A test that failed and later passed on retry is only in
/// `passed`.
#[derive(Debug)]
pub struct BailInfo<'a> {
    pub tests: &'a [Test],
    pub passed: Vec<&'a Test>,
    pub failed: Vec<&'a Test>,
}

impl BailInfo<'_> {
    /// Attempts completed by every passed or failed test.
    pub fn total_attempts(&self) -> u32 {
        self.passed
            .iter()
            .chain(self.failed.iter())
            .map(|t| t.attempts)
            .sum()
    }

    /// Attempts that did not pass.
    ///
    /// Every attempt of a failed test counts, and so does every attempt of a
    /// passed test beyond its first: a test that needed retries to pass
    /// still cost failed work.
    pub fn failed_attempts(&self) -> u32 {
        let failed: u32 = self.failed.iter().map(|t| t.attempts).sum();
        let retried: u32 = self
            .passed
            .iter()
            .map(|t| t.attempts.saturating_sub(1))
            .sum();
        failed + retried
    }
}

/// A bail decision function.
///
/// Implementations are registered by name in the
/// [`StrategyRegistry`](super::StrategyRegistry).
pub trait BailPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Human-readable reason printed when the policy fires.
    fn bail_reason(&self) -> Option<&str> {
        None
    }

    /// Returns `true` if the run should bail now.
    fn decide(&self, info: &BailInfo<'_>) -> bool;
}

/// Never bails.
pub struct NeverBail;

impl BailPolicy for NeverBail {
    fn name(&self) -> &str {
        "never"
    }

    fn description(&self) -> Option<&str> {
        Some("Run every test to completion regardless of failures")
    }

    fn bail_reason(&self) -> Option<&str> {
        Some("never bails")
    }

    fn decide(&self, _info: &BailInfo<'_>) -> bool {
        false
    }
}

/// Bails on the first terminal or retryable failure.
pub struct FastBail;

impl BailPolicy for FastBail {
    fn name(&self) -> &str {
        "fast"
    }

    fn description(&self) -> Option<&str> {
        Some("Bail as soon as any test fails")
    }

    fn bail_reason(&self) -> Option<&str> {
        Some("At least one test has failed")
    }

    fn decide(&self, info: &BailInfo<'_>) -> bool {
        !info.failed.is_empty()
    }
}

/// Bails once the failed-attempt ratio crosses a threshold.
///
/// Nothing fires until more than `min_attempts` attempts have completed.
pub struct EarlyBail {
    threshold: f64,
    min_attempts: u32,
    reason: String,
}

impl EarlyBail {
    pub fn new(threshold: f64, min_attempts: u32) -> Self {
        Self {
            threshold,
            min_attempts,
            reason: format!(
                "Failure ratio exceeded {:.0}% after more than {} attempts",
                threshold * 100.0,
                min_attempts
            ),
        }
    }
}

impl BailPolicy for EarlyBail {
    fn name(&self) -> &str {
        "early"
    }

    fn description(&self) -> Option<&str> {
        Some("Bail when the ratio of failed attempts exceeds a threshold")
    }

    fn bail_reason(&self) -> Option<&str> {
        Some(self.reason.as_str())
    }

    fn decide(&self, info: &BailInfo<'_>) -> bool {
        let total = info.total_attempts();
        if total <= self.min_attempts {
            return false;
        }
        let ratio = f64::from(info.failed_attempts()) / f64::from(total);
        ratio > self.threshold
    }
}

/// A bail policy plus its sticky `has_bailed` flag.
pub struct BailStrategy {
    policy: Box<dyn BailPolicy>,
    has_bailed: bool,
}

impl BailStrategy {
    pub fn new(policy: Box<dyn BailPolicy>) -> Self {
        Self {
            policy,
            has_bailed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.policy.name()
    }

    pub fn get_description(&self) -> String {
        match self.policy.description() {
            Some(description) => description.to_string(),
            None => {
                warn!("Bail strategy '{}' has no description", self.name());
                String::new()
            }
        }
    }

    pub fn get_bail_reason(&self) -> String {
        match self.policy.bail_reason() {
            Some(reason) => reason.to_string(),
            None => {
                warn!("Bail strategy '{}' has no bail reason", self.name());
                String::new()
            }
        }
    }

    /// Asks the policy whether to bail. Once it says yes, it stays yes.
    pub fn should_bail(&mut self, info: &BailInfo<'_>) -> bool {
        if !self.has_bailed {
            self.has_bailed = self.policy.decide(info);
        }
        self.has_bailed
    }

    pub fn has_bailed(&self) -> bool {
        self.has_bailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::Browser;

    fn test_with(attempts: u32, passed: bool) -> Test {
        let mut test = Test::new("t", Browser::new("b"), 10);
        for i in 0..attempts {
            if passed && i + 1 == attempts {
                test.pass();
            } else {
                test.fail("x");
            }
        }
        test
    }

    fn info<'a>(passed: &'a [Test], failed: &'a [Test]) -> BailInfo<'a> {
        BailInfo {
            tests: &[],
            passed: passed.iter().collect(),
            failed: failed.iter().collect(),
        }
    }

    #[test]
    fn test_ratio_counts_extra_attempts_of_passed_tests() {
        let passed = [test_with(3, true), test_with(1, true)];
        let failed = [test_with(2, false)];
        let info = info(&passed, &failed);

        assert_eq!(info.total_attempts(), 6);
        // 2 failed + (3 - 1) retries of the first passed test
        assert_eq!(info.failed_attempts(), 4);
    }

    #[test]
    fn test_fast_bail_on_any_failure() {
        let passed = [test_with(1, true)];
        assert!(!FastBail.decide(&info(&passed, &[])));
        let failed = [test_with(1, false)];
        assert!(FastBail.decide(&info(&passed, &failed)));
    }

    #[test]
    fn test_early_bail_requires_minimum_sample() {
        let policy = EarlyBail::new(0.1, 4);
        // 4 attempts, all failed: ratio 1.0 but not above the minimum.
        let failed: Vec<_> = (0..4).map(|_| test_with(1, false)).collect();
        assert!(!policy.decide(&info(&[], &failed)));

        let failed: Vec<_> = (0..5).map(|_| test_with(1, false)).collect();
        assert!(policy.decide(&info(&[], &failed)));
    }

    #[test]
    fn test_early_bail_threshold_is_strict() {
        let policy = EarlyBail::new(0.2, 4);
        let passed: Vec<_> = (0..8).map(|_| test_with(1, true)).collect();
        let failed = [test_with(2, false)];
        // 2 / 10 == 0.2, not above the threshold
        assert!(!policy.decide(&info(&passed, &failed)));

        let failed = [test_with(3, false)];
        // 3 / 11 > 0.2
        assert!(policy.decide(&info(&passed, &failed)));
    }

    #[test]
    fn test_should_bail_is_sticky() {
        let mut strategy = BailStrategy::new(Box::new(FastBail));
        let failed = [test_with(1, false)];
        assert!(strategy.should_bail(&info(&[], &failed)));
        assert!(strategy.should_bail(&info(&[], &[])));
        assert!(strategy.has_bailed());
    }

    #[test]
    fn test_never_bail() {
        let mut strategy = BailStrategy::new(Box::new(NeverBail));
        let failed: Vec<_> = (0..50).map(|_| test_with(1, false)).collect();
        assert!(!strategy.should_bail(&info(&[], &failed)));
        assert_eq!(strategy.name(), "never");
    }

    struct Silent;

    impl BailPolicy for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        fn decide(&self, _info: &BailInfo<'_>) -> bool {
            false
        }
    }

    #[test]
    fn test_missing_reason_is_empty_string() {
        let strategy = BailStrategy::new(Box::new(Silent));
        assert_eq!(strategy.get_bail_reason(), "");
        assert_eq!(strategy.get_description(), "");
    }
}
