//! testfleet: a bounded-concurrency test execution engine.
//!
//! testfleet runs one external process per (test × browser) attempt across a
//! fixed pool of workers, retries failures, kills overrunning tests, and can
//! abandon a run early when a bail policy fires.
//!
//! # Architecture
//!
//! - **Allocator**: worker slots, each holding a contention-checked port pair
//! - **Orchestrator**: the priority queue, the per-attempt process supervisor
//!   and the coordinating [`TestRunner`]
//! - **Strategy**: pluggable bail and resource policies, resolved by name
//! - **Framework**: turns a test into a command line
//! - **Report**: listeners fed by the child's JSON-line messages, and the
//!   run summary
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testfleet::config::load_config;
//! use testfleet::framework::CommandFramework;
//! use testfleet::orchestrator::TestRunner;
//! use testfleet::strategy::StrategyRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testfleet.toml"))?;
//!     let framework = Arc::new(CommandFramework::new(config.framework.clone())?);
//!     let result = TestRunner::new(&config, framework, &StrategyRegistry::default())?
//!         .run()
//!         .await?;
//!     println!("{} passed, {} failed", result.passed, result.failed);
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod config;
pub mod framework;
pub mod orchestrator;
pub mod report;
pub mod strategy;
pub mod trends;

// Re-export commonly used types
pub use allocator::{Worker, WorkerAllocator};
pub use config::{Config, load_config};
pub use framework::{Command, TestFramework, TestRun};
pub use orchestrator::{RunResult, Strictness, TestRunner};
pub use report::Listener;
pub use strategy::StrategyRegistry;
pub use test::{Browser, Test, TestStatus};
