//! The adapter boundary between the engine and a concrete test framework.
//!
//! The engine never knows how a mocha, nightwatch or protractor test is
//! launched. It asks a [`TestFramework`] to turn a [`Test`] and its per-attempt
//! [`TestRun`] context into a [`Command`], then spawns and supervises that
//! command itself.
//!
//! ```text
//!  Test + Worker ──► TestRun::new() ──► TestRun (ports, temp dir, build ids)
//!                                          │
//!                 TestFramework::produce_command(test, run)
//!                                          │
//!                                          ▼
//!                        Command { program, args, env } ──► TestRun::apply_env()
//!                                                               │
//!                                                               ▼
//!                                                          Supervisor spawn
//! ```

use std::path::PathBuf;

use crate::allocator::Worker;
use crate::config::FrameworkConfig;
use crate::test::Test;

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors raised while rendering a test into a command.
///
/// These surface as infrastructure errors for the attempt, never as
/// ordinary test failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// The configured command string could not be parsed.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A template placeholder could not be rendered.
    #[error("Failed to render template: {0}")]
    Template(String),

    /// Other adapter-specific errors.
    #[error("Framework error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A command to execute for one test attempt.
///
/// # Example
///
/// ```
/// use testfleet::framework::Command;
///
/// let cmd = Command::new("node")
///     .arg("run.js")
///     .args(["tests/login.js", "--browser", "chrome"])
///     .env("NODE_ENV", "test");
///
/// assert_eq!(cmd.program, "node");
/// assert_eq!(cmd.args.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for the process. Inherited when `None`.
    pub working_dir: Option<PathBuf>,

    /// Environment variables layered over the parent environment.
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable. Later values win over earlier ones.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted rendering, for logs.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|s| shell_words::quote(s).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Identifiers of the build a run belongs to.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub build_id: String,
    pub temp_dir: PathBuf,
}

/// The execution context of a single attempt.
///
/// Built fresh for every attempt from the test and the worker that holds it,
/// and discarded once the attempt resolves.
#[derive(Debug, Clone)]
pub struct TestRun {
    /// Canonical test string, `<locator> @<browser>`.
    pub test_name: String,
    pub browser: String,
    pub worker_index: usize,
    /// Port for the mocking server, the worker's port offset.
    pub mocking_port: u16,
    /// Port for the local automation server, offset + 1.
    pub selenium_port: u16,
    pub build_id: String,
    /// Unique per attempt.
    pub child_build_id: String,
    pub temp_assets_dir: PathBuf,
    pub capabilities: Option<serde_json::Value>,
    pub worker_token: Option<String>,
    pub tunnel_id: Option<String>,
}

impl TestRun {
    pub fn new(test: &Test, worker: &Worker, build: &BuildInfo) -> Self {
        let child_build_id = uuid::Uuid::new_v4().simple().to_string();
        let temp_assets_dir = build.temp_dir.join(format!(
            "build-{}_{}_temp_assets",
            build.build_id, child_build_id
        ));

        Self {
            test_name: test.to_string(),
            browser: test.browser.id.clone(),
            worker_index: worker.index,
            mocking_port: worker.port_offset,
            selenium_port: worker.port_offset.saturating_add(1),
            build_id: build.build_id.clone(),
            child_build_id,
            temp_assets_dir,
            capabilities: test.browser.capabilities.clone(),
            worker_token: worker.token.clone(),
            tunnel_id: worker.tunnel_id.clone(),
        }
    }

    /// Injects the engine-owned environment into a framework command.
    pub fn apply_env(&self, mut cmd: Command) -> Command {
        cmd = cmd
            .env("TESTFLEET_WORKER_INDEX", self.worker_index.to_string())
            .env("TESTFLEET_MOCKING_PORT", self.mocking_port.to_string())
            .env("TESTFLEET_SELENIUM_PORT", self.selenium_port.to_string())
            .env(
                "TESTFLEET_TEMP_ASSETS_DIR",
                self.temp_assets_dir.to_string_lossy(),
            )
            .env("TESTFLEET_BUILD_ID", &self.build_id)
            .env("TESTFLEET_CHILD_BUILD_ID", &self.child_build_id)
            .env("TESTFLEET_BROWSER", &self.browser);

        if let Some(capabilities) = &self.capabilities {
            cmd = cmd.env("TESTFLEET_BROWSER_CAPABILITIES", capabilities.to_string());
        }
        if let Some(token) = &self.worker_token {
            cmd = cmd.env("TESTFLEET_WORKER_TOKEN", token);
        }
        if let Some(tunnel) = &self.tunnel_id {
            cmd = cmd.env("TESTFLEET_TUNNEL_ID", tunnel);
        }
        cmd
    }
}

/// Translates a test into the command line that runs it.
///
/// Implementations must be cheap and side-effect free: they are called once
/// per attempt on the attempt's own task.
pub trait TestFramework: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Produces the command for one attempt of `test` in `run`.
    fn produce_command(&self, test: &Test, run: &TestRun) -> FrameworkResult<Command>;
}

/// A framework adapter driven entirely by [`FrameworkConfig`].
///
/// # Example
///
/// ```
/// use testfleet::config::FrameworkConfig;
/// use testfleet::framework::CommandFramework;
///
/// let framework = CommandFramework::new(FrameworkConfig {
///     command: "node run.js".to_string(),
///     args: vec!["{test}".to_string(), "--browser={browser}".to_string()],
///     ..Default::default()
/// }).unwrap();
/// ```
pub struct CommandFramework {
    program: String,
    leading_args: Vec<String>,
    config: FrameworkConfig,
}

impl CommandFramework {
    /// Parses the configured command string.
    pub fn new(config: FrameworkConfig) -> FrameworkResult<Self> {
        let mut words = shell_words::split(&config.command)
            .map_err(|e| FrameworkError::InvalidCommand(format!("{}: {}", config.command, e)))?;
        if words.is_empty() {
            return Err(FrameworkError::InvalidCommand(
                "command must not be empty".to_string(),
            ));
        }
        let program = words.remove(0);

        Ok(Self {
            program,
            leading_args: words,
            config,
        })
    }

    fn render(template: &str, test: &Test, run: &TestRun) -> FrameworkResult<String> {
        let rendered = template
            .replace("{test}", &test.locator)
            .replace("{browser}", &test.browser.id)
            .replace("{worker}", &run.worker_index.to_string())
            .replace("{mocking_port}", &run.mocking_port.to_string())
            .replace("{selenium_port}", &run.selenium_port.to_string())
            .replace("{temp_dir}", &run.temp_assets_dir.to_string_lossy());

        if let Some(start) = rendered.find('{')
            && let Some(len) = rendered[start..].find('}')
        {
            let placeholder = &rendered[start..=start + len];
            if placeholder.len() > 2
                && placeholder[1..placeholder.len() - 1]
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(FrameworkError::Template(format!(
                    "unknown placeholder {} in '{}'",
                    placeholder, template
                )));
            }
        }

        Ok(rendered)
    }
}

impl TestFramework for CommandFramework {
    fn name(&self) -> &str {
        "command"
    }

    fn produce_command(&self, test: &Test, run: &TestRun) -> FrameworkResult<Command> {
        let mut cmd = Command::new(&self.program).args(self.leading_args.iter().cloned());

        for arg in &self.config.args {
            cmd = cmd.arg(Self::render(arg, test, run)?);
        }

        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd = cmd.env(key, Self::render(value, test, run)?);
        }

        if let Some(dir) = &self.config.working_dir {
            cmd = cmd.working_dir(dir);
        }

        Ok(cmd)
    }
}
