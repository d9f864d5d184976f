//! End-to-end runs with real `sh -c` child processes.

#![cfg(unix)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use testfleet::allocator::{PortProbe, WorkerAllocator};
use testfleet::config::{Config, FrameworkConfig, TimingConfig};
use testfleet::framework::{
    Command, CommandFramework, FrameworkError, FrameworkResult, TestFramework, TestRun,
};
use testfleet::orchestrator::message::{ChildMessage, StatusKind};
use testfleet::orchestrator::{RunResult, RunnerError, Strictness, TestRunner};
use testfleet::report::{Listener, MessageSource};
use testfleet::strategy::{ResourceClaim, ResourcePolicy, StrategyError, StrategyRegistry};
use testfleet::test::{Test, TestStatus};
use testfleet::trends::TrendStore;

struct AlwaysFree;

#[async_trait]
impl PortProbe for AlwaysFree {
    async fn is_free(&self, _port: u16) -> bool {
        true
    }
}

struct AlwaysBusy;

#[async_trait]
impl PortProbe for AlwaysBusy {
    async fn is_free(&self, _port: u16) -> bool {
        false
    }
}

#[derive(Default)]
struct Recorder {
    messages: Arc<Mutex<Vec<(String, ChildMessage)>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    attempts: Mutex<usize>,
}

#[async_trait]
impl Listener for Recorder {
    fn listen_to(&self, run: &TestRun, _test: &Test, mut source: MessageSource) {
        *self.attempts.lock().unwrap() += 1;
        let messages = Arc::clone(&self.messages);
        let name = run.test_name.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = source.recv().await {
                messages.lock().unwrap().push((name.clone(), message));
            }
        });
        self.handles.lock().unwrap().push(handle);
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

fn config(temp: &Path) -> Config {
    let mut config = Config::default();
    config.testfleet.temp_dir = Some(temp.to_path_buf());
    config.testfleet.browsers = vec!["sh".to_string()];
    config.testfleet.timing = TimingConfig {
        stagger_ms: 0,
        sentry_interval_ms: 20,
        kill_grace_ms: 200,
        worker_poll_ms: 5,
        allocation_backoff_ms: 5,
        settle_ms: 10,
    };
    config.framework = FrameworkConfig {
        command: "sh -c".to_string(),
        args: vec!["{test}".to_string()],
        ..Default::default()
    };
    config
}

fn allocator(config: &Config) -> Arc<WorkerAllocator> {
    Arc::new(WorkerAllocator::new(
        config.testfleet.effective_max_workers(),
        &config.ports,
        &config.testfleet.timing,
        Arc::new(AlwaysFree),
    ))
}

fn runner(config: &Config, tests: &[String], registry: &StrategyRegistry) -> TestRunner {
    let framework = CommandFramework::new(config.framework.clone()).unwrap();
    TestRunner::with_tests(
        config,
        tests,
        &config.testfleet.browsers,
        Arc::new(framework),
        registry,
    )
    .unwrap()
}

async fn run(config: &Config, tests: &[String]) -> RunResult {
    runner(config, tests, &StrategyRegistry::default())
        .with_allocator(allocator(config))
        .run()
        .await
        .unwrap()
}

fn scripts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_zero_tests_succeed_without_workers() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let allocator = allocator(&config);

    let result = runner(&config, &[], &StrategyRegistry::default())
        .with_allocator(Arc::clone(&allocator))
        .run()
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.total_tests, 0);
    assert_eq!(allocator.peak_occupied(), 0);
}

#[tokio::test]
async fn test_single_passing_test() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_workers = 1;

    let result = run(&config, &scripts(&["exit 0"])).await;

    assert!(result.success());
    assert_eq!(result.passed, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(result.tests[0].attempts, 1);
    assert_eq!(result.tests[0].worker_index, Some(1));
}

#[tokio::test]
async fn test_always_failing_test_uses_every_attempt() {
    let temp = tempfile::tempdir().unwrap();
    let trends_path = temp.path().join("trends.json");
    let mut config = config(temp.path());
    config.testfleet.max_test_attempts = 3;
    config.testfleet.gather_trends = true;
    config.testfleet.trends_path = trends_path.clone();

    let result = run(&config, &scripts(&["exit 1"])).await;

    assert!(!result.success());
    assert_eq!(result.exit_code(), 1);
    let test = &result.tests[0];
    assert_eq!(test.attempts, 3);
    assert_eq!(test.status, TestStatus::Failed);
    assert!(test.is_terminal());
    assert_eq!(test.error.as_deref(), Some("Test exited with code 1"));
    assert_eq!(result.failed_tests.len(), 1);
    assert_eq!(result.failed_tests[0].locator, "exit 1");

    let trends = TrendStore::load(&trends_path);
    assert_eq!(trends.failures("exit 1 @sh"), 3);
}

#[tokio::test]
async fn test_flaky_test_passes_on_retry() {
    let temp = tempfile::tempdir().unwrap();
    let marker = temp.path().join("ran-once");
    let config = config(temp.path());
    let script = format!(
        "if [ -f '{m}' ]; then exit 0; else touch '{m}'; exit 1; fi",
        m = marker.display()
    );

    let result = run(&config, &[script]).await;

    assert!(result.success());
    assert_eq!(result.passed, 1);
    assert_eq!(result.retried, 1);
    assert_eq!(result.tests[0].attempts, 2);
    assert!(result.failed_tests.is_empty());
}

#[tokio::test]
async fn test_fourteen_tests_two_failing_never_bail() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_workers = 8;

    let mut tests: Vec<String> = (0..12).map(|i| format!("sleep 0.05; exit 0 # ok-{i}")).collect();
    tests.push("exit 1 # bad-a".to_string());
    tests.push("exit 2 # bad-b".to_string());

    let allocator = allocator(&config);
    let runner = runner(&config, &tests, &StrategyRegistry::default());
    assert_eq!(runner.strictness(), Strictness::BailNever);
    let result = runner
        .with_allocator(Arc::clone(&allocator))
        .run()
        .await
        .unwrap();

    assert!(!result.success());
    assert_eq!(result.total_tests, 14);
    assert_eq!(result.passed, 12);
    let mut failed: Vec<_> = result
        .failed_tests
        .iter()
        .map(|t| t.locator.as_str())
        .collect();
    failed.sort_unstable();
    assert_eq!(failed, vec!["exit 1 # bad-a", "exit 2 # bad-b"]);
    assert!(result.tests.iter().all(Test::is_terminal));
    assert!(result.tests.iter().all(|t| t.attempts <= t.max_attempts));
    assert!(allocator.peak_occupied() <= 8);
    assert_eq!(allocator.occupied_count(), 0);
}

#[tokio::test]
async fn test_bail_fast_stops_scheduling() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_workers = 1;
    config.testfleet.bail_fast = true;

    let result = run(&config, &scripts(&["exit 1", "exit 0", "exit 0"])).await;

    assert!(result.bailed);
    assert!(!result.success());
    assert_eq!(result.failed, 1);
    assert_eq!(result.not_run, 2);
    assert_eq!(result.tests[0].attempts, 1);
    assert_eq!(
        result.bail_reason.as_deref(),
        Some("At least one test has failed")
    );
}

#[tokio::test]
async fn test_early_bail_after_minimum_sample() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_workers = 1;
    config.testfleet.max_test_attempts = 1;
    config.testfleet.bail_on_threshold = true;
    config.testfleet.early_bail_threshold = 0.5;
    config.testfleet.early_bail_min_attempts = 2;

    let tests: Vec<String> = (0..5).map(|i| format!("exit 1 # {i}")).collect();
    let result = run(&config, &tests).await;

    assert!(result.bailed);
    assert_eq!(result.total_attempts, 3);
    assert_eq!(result.not_run, 2);
}

#[tokio::test]
async fn test_sentry_kills_hung_test_and_finishes_it_for_listeners() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_test_attempts = 1;
    config.testfleet.bail_time_ms = Some(200);

    let script =
        r#"echo '{"type":"worker-status","status":"started","name":"Hangs"}'; sleep 30"#.to_string();
    let recorder = Arc::new(Recorder::default());
    let runner = runner(&config, &[script], &StrategyRegistry::default());
    assert_eq!(runner.strictness(), Strictness::BailTimeOnly);

    let result = runner
        .with_allocator(allocator(&config))
        .with_listener(Arc::clone(&recorder) as Arc<dyn Listener>)
        .run()
        .await
        .unwrap();

    assert_eq!(result.failed, 1);
    let error = result.tests[0].error.clone().unwrap();
    assert!(error.contains("Killed by sentry"), "{error}");

    let messages = recorder.messages.lock().unwrap();
    let statuses: Vec<_> = messages
        .iter()
        .filter_map(|(_, m)| m.status())
        .map(|s| (s.status, s.passed))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (StatusKind::Started, None),
            (StatusKind::Finished, Some(false))
        ]
    );
    assert_eq!(*recorder.attempts.lock().unwrap(), 1);
}

struct RejectAll;

#[async_trait]
impl ResourcePolicy for RejectAll {
    fn name(&self) -> &str {
        "reject-tests"
    }

    fn fail_reason(&self) -> Option<&str> {
        Some("no capacity")
    }

    async fn proceed_suite(&self, resources: &[ResourceClaim]) -> Result<(), String> {
        if resources.len() > 10 {
            Err("suite too large".to_string())
        } else {
            Ok(())
        }
    }

    async fn proceed_test(&self, _resource: &ResourceClaim) -> Result<(), String> {
        Err(String::new())
    }
}

#[tokio::test]
async fn test_resource_gate_rejects_attempts() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.resource_strategy = Some("reject-tests".to_string());
    config.testfleet.max_test_attempts = 2;

    let mut registry = StrategyRegistry::with_builtins();
    registry.register_resource("reject-tests", |_| Ok(Box::new(RejectAll)));

    let result = runner(&config, &scripts(&["exit 0"]), &registry)
        .with_allocator(allocator(&config))
        .run()
        .await
        .unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.tests[0].attempts, 2);
    assert_eq!(
        result.tests[0].error.as_deref(),
        Some("Resource strategy rejected test: no capacity")
    );

    let tests: Vec<String> = (0..11).map(|i| format!("exit 0 # {i}")).collect();
    let outcome = runner(&config, &tests, &registry)
        .with_allocator(allocator(&config))
        .run()
        .await;
    assert!(matches!(
        outcome,
        Err(RunnerError::Strategy(StrategyError::SuiteRejected(reason))) if reason == "suite too large"
    ));
}

#[tokio::test]
async fn test_allocation_exhaustion_fails_the_test() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_test_attempts = 2;
    config.ports.acquire_attempts = 2;

    let allocator = Arc::new(WorkerAllocator::new(
        config.testfleet.effective_max_workers(),
        &config.ports,
        &config.testfleet.timing,
        Arc::new(AlwaysBusy),
    ));
    let result = runner(&config, &scripts(&["exit 0"]), &StrategyRegistry::default())
        .with_allocator(Arc::clone(&allocator))
        .run()
        .await
        .unwrap();

    assert!(!result.success());
    assert_eq!(result.failed, 1);
    let test = &result.tests[0];
    assert_eq!(test.attempts, 2);
    assert_eq!(test.status, TestStatus::Failed);
    assert_eq!(test.worker_index, None);
    assert_eq!(
        test.error.as_deref(),
        Some("Could not allocate a worker after 2 attempts")
    );
    assert_eq!(allocator.occupied_count(), 0);
}

/// Runs locators through `sh -c`, except one that cannot be rendered.
struct BrokenFor {
    locator: &'static str,
    inner: CommandFramework,
}

impl TestFramework for BrokenFor {
    fn name(&self) -> &str {
        "broken-for"
    }

    fn produce_command(&self, test: &Test, run: &TestRun) -> FrameworkResult<Command> {
        if test.locator == self.locator {
            return Err(FrameworkError::Template(format!(
                "cannot render {}",
                test.locator
            )));
        }
        self.inner.produce_command(test, run)
    }
}

#[tokio::test]
async fn test_infrastructure_error_fails_test_and_run_drains() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = config(temp.path());
    config.testfleet.max_test_attempts = 2;

    let framework = BrokenFor {
        locator: "broken",
        inner: CommandFramework::new(config.framework.clone()).unwrap(),
    };
    let allocator = allocator(&config);
    let result = TestRunner::with_tests(
        &config,
        &scripts(&["exit 0", "broken", "sleep 0.05; exit 0"]),
        &config.testfleet.browsers,
        Arc::new(framework),
        &StrategyRegistry::default(),
    )
    .unwrap()
    .with_allocator(Arc::clone(&allocator))
    .run()
    .await
    .unwrap();

    assert_eq!(result.passed, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.not_run, 0);
    assert!(result.tests.iter().all(Test::is_terminal));

    let broken = &result.tests[1];
    assert_eq!(broken.attempts, 2);
    assert_eq!(
        broken.error.as_deref(),
        Some("Failed to render template: cannot render broken")
    );
    assert_eq!(allocator.occupied_count(), 0);
}

/// Logs lifecycle calls into a shared journal.
struct Journal {
    name: &'static str,
    fail_flush: bool,
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    fn new(name: &'static str, fail_flush: bool, entries: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_flush,
            entries: Arc::clone(entries),
        })
    }
}

#[async_trait]
impl Listener for Journal {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push(format!("{} initialize", self.name));
        Ok(())
    }

    fn listen_to(&self, _run: &TestRun, _test: &Test, _source: MessageSource) {}

    async fn flush(&self) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push(format!("{} flush", self.name));
        if self.fail_flush {
            anyhow::bail!("{} could not write its report", self.name);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_listeners_flush_in_order_past_failures() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let entries = Arc::new(Mutex::new(Vec::new()));

    let result = runner(&config, &scripts(&["exit 0"]), &StrategyRegistry::default())
        .with_allocator(allocator(&config))
        .with_listener(Journal::new("first", true, &entries))
        .with_listener(Journal::new("second", false, &entries))
        .with_listener(Journal::new("third", true, &entries))
        .run()
        .await
        .unwrap();

    assert!(result.success());
    let entries = entries.lock().unwrap();
    let flushes: Vec<_> = entries
        .iter()
        .filter(|e| e.ends_with("flush"))
        .map(String::as_str)
        .collect();
    assert_eq!(flushes, vec!["first flush", "second flush", "third flush"]);
}

#[tokio::test]
async fn test_zero_tests_keep_listener_lifecycle_balanced() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let entries = Arc::new(Mutex::new(Vec::new()));

    let result = runner(&config, &[], &StrategyRegistry::default())
        .with_allocator(allocator(&config))
        .with_listener(Journal::new("only", false, &entries))
        .run()
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(
        *entries.lock().unwrap(),
        vec!["only initialize".to_string(), "only flush".to_string()]
    );
}

#[tokio::test]
async fn test_no_attempt_launches_after_bail() {
    let temp = tempfile::tempdir().unwrap();
    let marker = temp.path().join("launched-after-bail");
    let mut config = config(temp.path());
    config.testfleet.max_workers = 2;
    config.testfleet.bail_fast = true;
    config.testfleet.timing.stagger_ms = 300;

    let tests = vec![
        "exit 0".to_string(),
        "sleep 0.1; exit 1".to_string(),
        format!("touch '{}'", marker.display()),
    ];
    let result = run(&config, &tests).await;

    assert!(result.bailed);
    assert!(!marker.exists());
    assert_ne!(result.tests[2].status, TestStatus::Passed);
}
