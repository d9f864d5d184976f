//! testfleet CLI - run browser tests across a bounded pool of workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testfleet::config::{self, Config};
use testfleet::framework::CommandFramework;
use testfleet::orchestrator::{Strictness, TestRunner};
use testfleet::report::ConsoleListener;
use testfleet::strategy::StrategyRegistry;

#[derive(Parser)]
#[command(name = "testfleet")]
#[command(about = "Run browser tests in parallel with retries and bail policies", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testfleet.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run(RunArgs),

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Command that runs one test; `{test}` and `{browser}` are substituted
        #[arg(long, default_value = "node run-test.js")]
        command: String,

        /// Where to write the configuration
        #[arg(short, long, default_value = "testfleet.toml")]
        output: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Test locators; overrides `tests` from the config
    tests: Vec<String>,

    /// Browsers to run against; overrides `browsers` from the config
    #[arg(short, long = "browser")]
    browsers: Vec<String>,

    /// Override maximum concurrent workers
    #[arg(short = 'w', long)]
    max_workers: Option<usize>,

    /// Override maximum attempts per test
    #[arg(short = 'a', long)]
    max_attempts: Option<u32>,

    /// Bail on the first failure (forces one attempt per test)
    #[arg(long)]
    bail_fast: bool,

    /// Bail when the failed-attempt ratio crosses the configured threshold
    #[arg(long)]
    bail_early: bool,

    /// Kill tests that run longer than this many milliseconds
    #[arg(long)]
    bail_time: Option<u64>,

    /// Run one test at a time with verbose per-test output
    #[arg(long)]
    serial: bool,

    /// Record failure counts in the trends file
    #[arg(long)]
    gather_trends: bool,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        let fleet = &mut config.testfleet;
        if !self.tests.is_empty() {
            fleet.tests = self.tests;
        }
        if !self.browsers.is_empty() {
            fleet.browsers = self.browsers;
        }
        if let Some(workers) = self.max_workers {
            fleet.max_workers = workers;
        }
        if let Some(attempts) = self.max_attempts {
            fleet.max_test_attempts = attempts;
        }
        if let Some(ms) = self.bail_time {
            fleet.bail_time_ms = Some(ms);
        }
        fleet.bail_fast |= self.bail_fast;
        fleet.bail_on_threshold |= self.bail_early;
        fleet.serial |= self.serial;
        fleet.gather_trends |= self.gather_trends;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run_tests(&cli.config, args).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { command, output } => init_config(&command, &output),
    }
}

fn load(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        info!(
            "No configuration at {}, using defaults",
            config_path.display()
        );
        return Ok(Config::default());
    }
    config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

async fn run_tests(config_path: &Path, args: RunArgs) -> Result<()> {
    let mut config = load(config_path)?;
    args.apply(&mut config);

    let framework = CommandFramework::new(config.framework.clone())?;
    let runner = TestRunner::new(
        &config,
        Arc::new(framework),
        &StrategyRegistry::with_builtins(),
    )?
    .with_listener(Arc::new(ConsoleListener::new()));

    info!("Build {}", runner.build_id());
    let result = runner.run().await?;
    std::process::exit(result.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        let framework = CommandFramework::new(config.framework.clone())?;
        TestRunner::new(
            &config,
            Arc::new(framework),
            &StrategyRegistry::with_builtins(),
        )?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            let fleet = &config.testfleet;
            let strictness = Strictness::from_config(fleet);
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max workers: {}", fleet.effective_max_workers());
            println!("  Max attempts: {}", fleet.effective_max_attempts());
            println!("  Strictness: {:?}", strictness);
            println!(
                "  Bail strategy: {}",
                fleet
                    .bail_strategy
                    .as_deref()
                    .unwrap_or(strictness.default_bail_strategy())
            );
            println!("  Bail time: {}ms", fleet.bail_time().as_millis());
            println!(
                "  Ports: {}..{} (spacing {})",
                config.ports.start,
                u32::from(config.ports.start) + u32::from(config.ports.range),
                config.ports.spacing
            );
            println!("  Tests: {}", fleet.tests.len());
            println!("  Browsers: {}", fleet.browsers.join(", "));
            println!("  Command: {}", config.framework.command);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(command: &str, path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    let config = format!(
        r#"# testfleet configuration file

[testfleet]
max_workers = 3
max_test_attempts = 3
bail_fast = false
bail_on_threshold = false
early_bail_threshold = 0.1
early_bail_min_attempts = 10
browsers = ["chrome"]
tests = []

[ports]
start = 12000
range = 2000
spacing = 3

[framework]
command = {command}
args = ["{{test}}", "--browser", "{{browser}}"]
"#,
        command = toml::Value::String(command.to_string())
    );

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  testfleet run");

    Ok(())
}
