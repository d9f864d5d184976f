//! Configuration schema definitions for testfleet.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section has defaults, so a minimal file
//! only needs to name the command that runs a single test.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FleetConfig            - Workers, attempts, bail policy, suite inputs
//! │   └── TimingConfig       - Stagger, sentry, grace and polling intervals
//! ├── PortConfig             - Port range handed out to worker slots
//! ├── FrameworkConfig        - Command template that runs one test
//! └── browser_capabilities   - Free-form descriptor per browser id
//! ```
//!
//! The configuration is built once at startup and passed by reference into
//! the allocator, queue, supervisor and strategies. Nothing reads settings
//! from ambient global state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for testfleet.
///
/// # TOML Structure
///
/// ```toml
/// [testfleet]
/// max_workers = 4
/// max_test_attempts = 2
/// browsers = ["chrome", "firefox"]
///
/// [ports]
/// start = 12000
///
/// [framework]
/// command = "node run-test.js"
/// args = ["{test}", "--browser", "{browser}"]
/// ```
///
/// # Example
///
/// ```
/// use testfleet::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [testfleet]
///     max_workers = 2
///
///     [framework]
///     command = "echo"
/// "#).unwrap();
/// assert_eq!(config.testfleet.max_workers, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core execution settings.
    #[serde(default)]
    pub testfleet: FleetConfig,

    /// Port range used by the worker allocator.
    #[serde(default)]
    pub ports: PortConfig,

    /// How a single test is turned into a command line.
    #[serde(default)]
    pub framework: FrameworkConfig,

    /// Provider-specific capability descriptors keyed by browser id.
    ///
    /// The descriptor is handed to the child as JSON in
    /// `TESTFLEET_BROWSER_CAPABILITIES`.
    #[serde(default)]
    pub browser_capabilities: HashMap<String, serde_json::Value>,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_workers` | 3 |
/// | `max_test_attempts` | 3 |
/// | `bail_fast` | false |
/// | `bail_on_threshold` | false |
/// | `bail_time_ms` | unset (300000 applied) |
/// | `early_bail_threshold` | 0.1 |
/// | `early_bail_min_attempts` | 10 |
/// | `serial` | false |
/// | `gather_trends` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    /// Number of worker slots, and therefore of concurrently running
    /// test processes.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Attempts allowed per test before it is terminally failed.
    #[serde(default = "default_max_test_attempts")]
    pub max_test_attempts: u32,

    /// Bail the whole run on the first failure. Forces one attempt per test.
    #[serde(default)]
    pub bail_fast: bool,

    /// Bail when the failed-attempt ratio crosses `early_bail_threshold`.
    #[serde(default)]
    pub bail_on_threshold: bool,

    /// Long-running test threshold in milliseconds.
    ///
    /// Setting this explicitly (with no other bail flag) selects the
    /// time-only strictness level.
    #[serde(default)]
    pub bail_time_ms: Option<u64>,

    /// Failed-attempt ratio above which an early bail fires.
    #[serde(default = "default_early_bail_threshold")]
    pub early_bail_threshold: f64,

    /// Minimum attempts that must have completed before an early bail can fire.
    #[serde(default = "default_early_bail_min_attempts")]
    pub early_bail_min_attempts: u32,

    /// Run one test at a time and log every attempt's output.
    #[serde(default)]
    pub serial: bool,

    /// Persist per-test failure counts across runs.
    #[serde(default)]
    pub gather_trends: bool,

    /// Where trend counts are stored.
    #[serde(default = "default_trends_path")]
    pub trends_path: PathBuf,

    /// Parent directory of the per-attempt temp asset directories.
    ///
    /// Defaults to the system temp directory. `~` is expanded.
    pub temp_dir: Option<PathBuf>,

    /// Identifier of this build. A fresh uuid is used when unset.
    pub build_id: Option<String>,

    /// Registry name of the bail strategy. Derived from the bail flags when unset.
    pub bail_strategy: Option<String>,

    /// Registry name of the resource strategy. Defaults to `none`.
    pub resource_strategy: Option<String>,

    /// Browsers every test is run against.
    #[serde(default = "default_browsers")]
    pub browsers: Vec<String>,

    /// Test locators to run when none are given on the command line.
    #[serde(default)]
    pub tests: Vec<String>,

    /// Intervals and delays used by the scheduler and supervisor.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_test_attempts: default_max_test_attempts(),
            bail_fast: false,
            bail_on_threshold: false,
            bail_time_ms: None,
            early_bail_threshold: default_early_bail_threshold(),
            early_bail_min_attempts: default_early_bail_min_attempts(),
            serial: false,
            gather_trends: false,
            trends_path: default_trends_path(),
            temp_dir: None,
            build_id: None,
            bail_strategy: None,
            resource_strategy: None,
            browsers: default_browsers(),
            tests: Vec::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Worker count after applying `serial`.
    pub fn effective_max_workers(&self) -> usize {
        if self.serial {
            1
        } else {
            self.max_workers.max(1)
        }
    }

    /// Attempt limit after applying `bail_fast`.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.bail_fast {
            1
        } else {
            self.max_test_attempts.max(1)
        }
    }

    /// The long-running test threshold.
    pub fn bail_time(&self) -> Duration {
        Duration::from_millis(self.bail_time_ms.unwrap_or(DEFAULT_BAIL_TIME_MS))
    }

    /// Temp directory with `~` expanded.
    pub fn resolved_temp_dir(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).into_owned()),
            None => std::env::temp_dir(),
        }
    }

    /// Trend file path with `~` expanded.
    pub fn resolved_trends_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.trends_path.to_string_lossy()).into_owned())
    }
}

/// Default long-running test threshold: five minutes.
pub const DEFAULT_BAIL_TIME_MS: u64 = 5 * 60 * 1000;

fn default_max_workers() -> usize {
    3
}

fn default_max_test_attempts() -> u32 {
    3
}

fn default_early_bail_threshold() -> f64 {
    0.1
}

fn default_early_bail_min_attempts() -> u32 {
    10
}

fn default_trends_path() -> PathBuf {
    PathBuf::from(".testfleet/trends.json")
}

fn default_browsers() -> Vec<String> {
    vec!["default".to_string()]
}

/// Intervals and delays, all in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Delay before spawning each test process.
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// How often a running attempt's sentry checks for timeout or bail.
    #[serde(default = "default_sentry_interval_ms")]
    pub sentry_interval_ms: u64,

    /// Time a signalled process gets to exit before it is force killed.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Poll interval while waiting for an idle worker slot.
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,

    /// Backoff after a worker slot's ports turned out to be busy.
    #[serde(default = "default_allocation_backoff_ms")]
    pub allocation_backoff_ms: u64,

    /// Pause after a bail before the run is finalized.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stagger_ms: default_stagger_ms(),
            sentry_interval_ms: default_sentry_interval_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            worker_poll_ms: default_worker_poll_ms(),
            allocation_backoff_ms: default_allocation_backoff_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl TimingConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn sentry_interval(&self) -> Duration {
        Duration::from_millis(self.sentry_interval_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms.max(1))
    }

    pub fn allocation_backoff(&self) -> Duration {
        Duration::from_millis(self.allocation_backoff_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn default_stagger_ms() -> u64 {
    100
}

fn default_sentry_interval_ms() -> u64 {
    1000
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_worker_poll_ms() -> u64 {
    50
}

fn default_allocation_backoff_ms() -> u64 {
    200
}

fn default_settle_ms() -> u64 {
    1000
}

/// Port range handed out to worker slots.
///
/// Each acquisition takes the next `spacing`-wide block from a cursor that
/// walks `[start, start + range)` and wraps back to `start`. The worker's
/// mocking port is the block base, its automation server port is base + 1.
///
/// # Example
///
/// ```toml
/// [ports]
/// start = 12000
/// range = 2000
/// spacing = 3
/// tunnels = ["tunnel-a", "tunnel-b"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortConfig {
    /// First port of the range.
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// Number of ports in the range.
    #[serde(default = "default_port_range")]
    pub range: u16,

    /// Distance between consecutive port blocks. Must be at least 2.
    #[serde(default = "default_port_spacing")]
    pub spacing: u16,

    /// Port-contention retries before a worker acquisition fails.
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// Timeout for each HTTP or TCP probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Tunnel identifiers assigned round-robin to worker slots.
    #[serde(default)]
    pub tunnels: Vec<String>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            range: default_port_range(),
            spacing: default_port_spacing(),
            acquire_attempts: default_acquire_attempts(),
            probe_timeout_ms: default_probe_timeout_ms(),
            tunnels: Vec::new(),
        }
    }
}

impl PortConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }
}

fn default_port_start() -> u16 {
    12000
}

fn default_port_range() -> u16 {
    2000
}

fn default_port_spacing() -> u16 {
    3
}

fn default_acquire_attempts() -> u32 {
    100
}

fn default_probe_timeout_ms() -> u64 {
    500
}

/// Command template that runs a single test.
///
/// `{test}`, `{browser}`, `{worker}`, `{mocking_port}`, `{selenium_port}`
/// and `{temp_dir}` are substituted in `args` and `env` values.
///
/// # Example
///
/// ```toml
/// [framework]
/// command = "node ./node_modules/.bin/mocha"
/// args = ["{test}", "--reporter", "spec"]
/// working_dir = "/app"
///
/// [framework.env]
/// SELENIUM_URL = "http://localhost:{selenium_port}/wd/hub"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameworkConfig {
    /// Program plus leading arguments, split with shell quoting rules.
    #[serde(default = "default_command")]
    pub command: String,

    /// Per-test arguments appended after `command`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment for every test process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory of the test processes.
    pub working_dir: Option<PathBuf>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: HashMap::new(),
            working_dir: None,
        }
    }
}

fn default_command() -> String {
    "echo".to_string()
}

fn default_args() -> Vec<String> {
    vec!["{test}".to_string()]
}
