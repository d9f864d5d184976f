//! Run coordination: scheduling, retries, bail and finalization.
//!
//! The [`TestRunner`] expands locators × browsers into [`Test`]s, feeds them
//! through a [`TestQueue`], and runs each dequeued attempt on its own task:
//!
//! ```text
//!                  ┌──────────── coordinator (single task) ────────────┐
//!                  │                                                   │
//!   TestQueue ──next_ready()──► spawn attempt task ──────────┐         │
//!       ▲          │                                         │         │
//!       │          │            allocator.get()              │         │
//!       │          │            resource.proceed_test()      │         │
//!       │          │            supervisor.run_test()        │         │
//!       │          │            allocator.release()          │         │
//!       │          │                                         ▼         │
//!       │          │                               mpsc completion     │
//!       │          │                                         │         │
//!       └─ enqueue(retry) ◄── record pass / fail ◄───────────┘         │
//!                  │                  │                                │
//!                  │            should_bail()? ──► early_terminate()   │
//!                  │                                + cancel sentries  │
//!                  └───────────────────────────────────────────────────┘
//! ```
//!
//! Attempt tasks never touch [`Test`] state. They send their outcome back to
//! the coordinator, which handles one completion at a time, including any
//! retry enqueue, before it checks whether the queue has drained.
//!
//! # Strictness
//!
//! | Level | Sentry timeout | Bail check |
//! |-------|----------------|------------|
//! | `BailNever` | no | no |
//! | `BailTimeOnly` | yes | no |
//! | `BailEarly` | yes | yes |
//! | `BailFast` | yes | yes (attempts forced to 1) |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testfleet::config::load_config;
//! use testfleet::framework::CommandFramework;
//! use testfleet::orchestrator::TestRunner;
//! use testfleet::report::ConsoleListener;
//! use testfleet::strategy::StrategyRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testfleet.toml"))?;
//!     let framework = CommandFramework::new(config.framework.clone())?;
//!
//!     let runner = TestRunner::new(&config, Arc::new(framework), &StrategyRegistry::default())?
//!         .with_listener(Arc::new(ConsoleListener::new()));
//!     let result = runner.run().await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod message;
pub mod queue;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocator::{AllocatorError, NetworkPortProbe, WorkerAllocator};
use crate::config::{Config, FleetConfig, TimingConfig};
use crate::framework::{BuildInfo, TestFramework};
use crate::report::{self, Listener};
use crate::strategy::{
    BailInfo, BailStrategy, ResourceClaim, ResourceStrategy, StrategyError, StrategyRegistry,
};
use crate::test::{Browser, Test, TestId, TestStatus};
use crate::trends::TrendStore;

pub use queue::{FIRST_RUN_PRIORITY, RETRY_PRIORITY, TestQueue};
pub use supervisor::{
    AttemptReport, KillReason, Supervisor, SupervisorError, SupervisorSettings, Termination,
};

/// Setup-time errors. Anything after the first attempt is folded into test
/// state instead.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("Listener failed to initialize: {0}")]
    Listener(#[source] anyhow::Error),

    #[error("Failed to build port probe: {0}")]
    Probe(#[source] anyhow::Error),

    #[error("No browsers configured")]
    NoBrowsers,
}

/// The bail and timeout policy of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    BailNever,
    BailTimeOnly,
    BailEarly,
    BailFast,
}

impl Strictness {
    pub fn from_config(config: &FleetConfig) -> Self {
        if config.bail_fast {
            Self::BailFast
        } else if config.bail_on_threshold || config.bail_strategy.is_some() {
            Self::BailEarly
        } else if config.bail_time_ms.is_some() {
            Self::BailTimeOnly
        } else {
            Self::BailNever
        }
    }

    /// Whether sentries kill overrunning or bailed attempts.
    pub fn enforces_timeout(self) -> bool {
        self != Self::BailNever
    }

    /// Whether the bail strategy is consulted after each completion.
    pub fn consults_bail(self) -> bool {
        matches!(self, Self::BailEarly | Self::BailFast)
    }

    /// Registry name used when no strategy is configured explicitly.
    pub fn default_bail_strategy(self) -> &'static str {
        match self {
            Self::BailFast => "fast",
            Self::BailEarly => "early",
            Self::BailNever | Self::BailTimeOnly => "never",
        }
    }
}

/// Aggregated results of a run.
///
/// `success()` is the success callback; anything else is the failure
/// callback, with the terminally failed tests in `failed_tests`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub total_tests: usize,
    pub passed: usize,
    /// Tests in the failed list when the run finished.
    pub failed: usize,
    /// Tests that needed more than one attempt.
    pub retried: usize,
    /// Tests that never got an attempt because the run bailed.
    pub not_run: usize,
    pub total_attempts: u32,
    pub bailed: bool,
    pub bail_reason: Option<String>,
    pub duration: Duration,
    pub failed_tests: Vec<Test>,
    /// Every test in its final state.
    pub tests: Vec<Test>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0 && !self.bailed
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Outcome of one attempt, as seen by the coordinator.
enum AttemptOutcome {
    Finished(AttemptReport),
    AllocationFailed(AllocatorError),
    Rejected(String),
    Infrastructure(SupervisorError),
}

struct Completion {
    test: TestId,
    worker_index: Option<usize>,
    outcome: AttemptOutcome,
}

/// Builds `locators × browsers`, attaching configured capabilities.
pub fn expand_tests(config: &Config, locators: &[String], browsers: &[String]) -> Vec<Test> {
    let max_attempts = config.testfleet.effective_max_attempts();
    locators
        .iter()
        .flat_map(|locator| {
            browsers.iter().map(move |id| {
                let mut browser = Browser::new(id);
                if let Some(capabilities) = config.browser_capabilities.get(id) {
                    browser = browser.with_capabilities(capabilities.clone());
                }
                Test::new(locator, browser, max_attempts)
            })
        })
        .collect()
}

/// The top-level coordinator of a run.
pub struct TestRunner {
    tests: Vec<Test>,
    strictness: Strictness,
    bail: BailStrategy,
    resource: ResourceStrategy,
    allocator: Arc<WorkerAllocator>,
    framework: Arc<dyn TestFramework>,
    listeners: Vec<Arc<dyn Listener>>,
    build: BuildInfo,
    max_workers: usize,
    bail_time: Duration,
    timing: TimingConfig,
    serial: bool,
    trends_path: Option<PathBuf>,
}

impl TestRunner {
    /// Builds a runner for the configured tests and browsers.
    pub fn new(
        config: &Config,
        framework: Arc<dyn TestFramework>,
        registry: &StrategyRegistry,
    ) -> Result<Self, RunnerError> {
        Self::with_tests(
            config,
            &config.testfleet.tests,
            &config.testfleet.browsers,
            framework,
            registry,
        )
    }

    /// Builds a runner for an explicit set of locators and browsers.
    ///
    /// Strategy names are resolved here, so an unknown or malformed
    /// strategy fails before anything is scheduled.
    pub fn with_tests(
        config: &Config,
        locators: &[String],
        browsers: &[String],
        framework: Arc<dyn TestFramework>,
        registry: &StrategyRegistry,
    ) -> Result<Self, RunnerError> {
        if browsers.is_empty() {
            return Err(RunnerError::NoBrowsers);
        }

        let fleet = &config.testfleet;
        let strictness = Strictness::from_config(fleet);
        let bail_name = fleet
            .bail_strategy
            .as_deref()
            .unwrap_or(strictness.default_bail_strategy());
        let bail = registry.build_bail(bail_name, config)?;
        let resource_name = fleet.resource_strategy.as_deref().unwrap_or("none");
        let resource = registry.build_resource(resource_name, config)?;

        let max_workers = fleet.effective_max_workers();
        let probe =
            NetworkPortProbe::new(config.ports.probe_timeout()).map_err(RunnerError::Probe)?;
        let allocator =
            WorkerAllocator::new(max_workers, &config.ports, &fleet.timing, Arc::new(probe));

        Ok(Self {
            tests: expand_tests(config, locators, browsers),
            strictness,
            bail,
            resource,
            allocator: Arc::new(allocator),
            framework,
            listeners: Vec::new(),
            build: BuildInfo {
                build_id: fleet
                    .build_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                temp_dir: fleet.resolved_temp_dir(),
            },
            max_workers,
            bail_time: fleet.bail_time(),
            timing: fleet.timing.clone(),
            serial: fleet.serial,
            trends_path: fleet.gather_trends.then(|| fleet.resolved_trends_path()),
        })
    }

    /// Replaces the default network-probing allocator.
    pub fn with_allocator(mut self, allocator: Arc<WorkerAllocator>) -> Self {
        self.max_workers = allocator.max_workers();
        self.allocator = allocator;
        self
    }

    /// Registers a listener. Listeners are flushed in registration order.
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn build_id(&self) -> &str {
        &self.build.build_id
    }

    /// Runs every test to a terminal state, or until the run bails.
    pub async fn run(mut self) -> Result<RunResult, RunnerError> {
        let start = Instant::now();

        info!(
            "Running {} tests with {} workers (strictness {:?}, bail strategy '{}', resource strategy '{}')",
            self.tests.len(),
            self.max_workers,
            self.strictness,
            self.bail.name(),
            self.resource.name()
        );

        if self.tests.is_empty() {
            warn!("No tests to run");
            self.initialize_listeners().await?;
            return Ok(self.finish(&TestQueue::new([], 1), start, &TrendStore::default()).await);
        }

        let claims: Vec<ResourceClaim> = self.tests.iter().map(ResourceClaim::from).collect();
        self.resource.proceed_suite(&claims).await?;

        self.initialize_listeners().await?;
        self.allocator.initialize().await?;

        let bail_token = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&self.framework),
            self.listeners.clone(),
            SupervisorSettings {
                stagger: self.timing.stagger(),
                sentry_interval: self.timing.sentry_interval(),
                kill_grace: self.timing.kill_grace(),
                bail_time: self.bail_time,
                enforce_timeout: self.strictness.enforces_timeout(),
                build: self.build.clone(),
            },
            bail_token.clone(),
        ));

        let mut queue = TestQueue::new((0..self.tests.len()).map(TestId), self.max_workers);
        let mut trends = TrendStore::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        queue.proceed();

        loop {
            while let Some(id) = queue.next_ready() {
                self.stage(id, &supervisor, &tx);
            }
            if queue.is_drained() {
                break;
            }
            let Some(completion) = rx.recv().await else {
                break;
            };
            queue.complete();
            self.handle_completion(completion, &mut queue, &mut trends);

            if self.strictness.consults_bail() && !self.bail.has_bailed() {
                let info = bail_info(&self.tests, &queue);
                if self.bail.should_bail(&info) {
                    let dropped = queue.early_terminate();
                    bail_token.cancel();
                    warn!(
                        "Bailing ({}): {}; dropped {} queued tests, waiting for {} in flight",
                        self.bail.name(),
                        self.bail.get_bail_reason(),
                        dropped,
                        queue.in_flight()
                    );
                }
            }
        }

        if self.bail.has_bailed() {
            tokio::time::sleep(self.timing.settle()).await;
        }
        self.allocator.teardown().await;

        Ok(self.finish(&queue, start, &trends).await)
    }

    async fn initialize_listeners(&self) -> Result<(), RunnerError> {
        for listener in &self.listeners {
            listener.initialize().await.map_err(RunnerError::Listener)?;
        }
        Ok(())
    }

    /// Marks the test as attempting and runs the attempt on its own task.
    fn stage(
        &mut self,
        id: TestId,
        supervisor: &Arc<Supervisor>,
        tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let test = &mut self.tests[id.0];
        test.start_attempt(None);
        debug!("Staging {} (attempt {})", test, test.attempts + 1);

        let snapshot = test.clone();
        let allocator = Arc::clone(&self.allocator);
        let resource = self.resource.clone();
        let supervisor = Arc::clone(supervisor);
        let tx = tx.clone();

        tokio::spawn(async move {
            let completion = run_attempt(id, snapshot, &allocator, &resource, &supervisor).await;
            if let Err(e) = tx.send(completion) {
                debug!("Coordinator gone, dropping completion of test {}", e.0.test.0);
            }
        });
    }

    fn handle_completion(
        &mut self,
        completion: Completion,
        queue: &mut TestQueue,
        trends: &mut TrendStore,
    ) {
        let id = completion.test;
        let test = &mut self.tests[id.0];
        test.worker_index = completion.worker_index;

        match completion.outcome {
            AttemptOutcome::Finished(report) => {
                if report.display_name.is_some() {
                    test.display_name = report.display_name;
                }
                test.stdout = report.stdout;
                test.stderr = report.stderr;
                match report.error {
                    None => test.pass(),
                    Some(error) => {
                        warn!("{} failed: {}", test, error);
                        test.fail(error);
                    }
                }
                test.running_time = Some(report.duration);
            }
            AttemptOutcome::AllocationFailed(e) => {
                warn!("{} could not get a worker: {}", test, e);
                test.fail(e.to_string());
            }
            AttemptOutcome::Rejected(reason) => {
                warn!("{} rejected by resource strategy: {}", test, reason);
                test.fail(format!("Resource strategy rejected test: {reason}"));
            }
            AttemptOutcome::Infrastructure(e) => {
                error!("Infrastructure error running {}: {}", test, e);
                test.fail(e.to_string());
            }
        }

        if self.serial {
            info!(
                "{} attempt {} output:\n--- stdout ---\n{}--- stderr ---\n{}",
                test, test.attempts, test.stdout, test.stderr
            );
        }

        if test.status == TestStatus::Passed {
            info!("{} passed (attempt {})", test, test.attempts);
            queue.record_pass(id);
            return;
        }

        queue.record_fail(id);
        if self.trends_path.is_some() {
            trends.record_failure(&test.to_string());
        }
        if test.can_retry() && !self.bail.has_bailed() {
            info!(
                "Retrying {} ({}/{} attempts used)",
                test, test.attempts, test.max_attempts
            );
            queue.enqueue(id, RETRY_PRIORITY);
        }
    }

    /// Prints the summary, persists trends and flushes listeners in order.
    async fn finish(self, queue: &TestQueue, start: Instant, trends: &TrendStore) -> RunResult {
        let failed_tests: Vec<Test> = queue
            .failed_tests()
            .iter()
            .map(|id| self.tests[id.0].clone())
            .collect();
        let bailed = self.bail.has_bailed();

        let result = RunResult {
            total_tests: self.tests.len(),
            passed: queue.passed_tests().len(),
            failed: failed_tests.len(),
            retried: self.tests.iter().filter(|t| t.attempts > 1).count(),
            not_run: self.tests.iter().filter(|t| t.attempts == 0).count(),
            total_attempts: self.tests.iter().map(|t| t.attempts).sum(),
            bailed,
            bail_reason: bailed.then(|| self.bail.get_bail_reason()),
            duration: start.elapsed(),
            failed_tests,
            tests: self.tests,
        };

        report::print_summary(&result);

        if let Some(path) = &self.trends_path
            && !trends.is_empty()
        {
            match trends.merge_into(path) {
                Ok(()) => info!("Saved failure trends to {}", path.display()),
                Err(e) => warn!("Failed to save failure trends: {:#}", e),
            }
        }

        for listener in &self.listeners {
            if let Err(e) = listener.flush().await {
                warn!("Listener flush failed: {:#}", e);
            }
        }

        if result.success() {
            info!("All {} tests passed", result.total_tests);
        } else {
            warn!(
                "Run failed: {} failed, {} not run",
                result.failed, result.not_run
            );
        }
        result
    }
}

async fn run_attempt(
    id: TestId,
    test: Test,
    allocator: &WorkerAllocator,
    resource: &ResourceStrategy,
    supervisor: &Supervisor,
) -> Completion {
    if supervisor.has_bailed() {
        return Completion {
            test: id,
            worker_index: None,
            outcome: AttemptOutcome::Finished(AttemptReport::bailed_before_launch()),
        };
    }

    let worker = match allocator.get().await {
        Ok(worker) => worker,
        Err(e) => {
            return Completion {
                test: id,
                worker_index: None,
                outcome: AttemptOutcome::AllocationFailed(e),
            };
        }
    };

    let outcome = match resource.proceed_test(&ResourceClaim::from(&test)).await {
        Err(reason) => AttemptOutcome::Rejected(reason),
        Ok(()) => match supervisor.run_test(&test, &worker).await {
            Ok(report) => AttemptOutcome::Finished(report),
            Err(e) => AttemptOutcome::Infrastructure(e),
        },
    };

    allocator.release(&worker).await;

    Completion {
        test: id,
        worker_index: Some(worker.index),
        outcome,
    }
}

fn bail_info<'a>(tests: &'a [Test], queue: &TestQueue) -> BailInfo<'a> {
    BailInfo {
        tests,
        passed: queue.passed_tests().iter().map(|id| &tests[id.0]).collect(),
        failed: queue.failed_tests().iter().map(|id| &tests[id.0]).collect(),
    }
}
