//! Listeners and console output.
//!
//! A [`Listener`] observes every attempt through the stream of messages its
//! child process prints. The runner initializes all listeners before the
//! first attempt, hands each one a fresh [`MessageSource`] per attempt, and
//! flushes them one after another once the run has drained.
//!
//! The source closes when the attempt resolves. If the child reported
//! `started` but never `finished`, a synthesized `finished` message with
//! `passed: false` is delivered before the close.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::framework::TestRun;
use crate::orchestrator::RunResult;
use crate::orchestrator::message::{ChildMessage, StatusKind};
use crate::test::Test;

/// Per-attempt stream of messages from the child.
pub type MessageSource = mpsc::UnboundedReceiver<ChildMessage>;

/// Observer of test attempts.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Called once before any attempt. An error aborts the run.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per attempt, right after the child has been spawned.
    fn listen_to(&self, run: &TestRun, test: &Test, source: MessageSource);

    /// Called once after the run has drained. Errors are logged.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints `worker-status` transitions as they happen.
#[derive(Default)]
pub struct ConsoleListener {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsoleListener {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Listener for ConsoleListener {
    fn listen_to(&self, run: &TestRun, _test: &Test, mut source: MessageSource) {
        let label = format!("[worker {} · {}]", run.worker_index, run.browser);
        let handle = tokio::spawn(async move {
            while let Some(message) = source.recv().await {
                let Some(status) = message.status() else {
                    continue;
                };
                match (status.status, status.passed) {
                    (StatusKind::Started, _) => {
                        println!("{} {}", console::style(&label).dim(), status.name);
                    }
                    (StatusKind::Finished, Some(true)) => {
                        println!(
                            "{} {} {}",
                            console::style(&label).dim(),
                            console::style("✓").green(),
                            status.name
                        );
                    }
                    (StatusKind::Finished, _) => {
                        println!(
                            "{} {} {}",
                            console::style(&label).dim(),
                            console::style("✗").red(),
                            status.name
                        );
                    }
                }
            }
        });
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let pending: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => anyhow::bail!("console listener state poisoned"),
        };
        for handle in pending {
            handle.await?;
        }
        Ok(())
    }
}

/// Prints a summary of the run to the console.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Test Results:");
    println!("  Total:    {}", result.total_tests);
    println!("  Passed:   {}", console::style(result.passed).green());
    println!("  Failed:   {}", console::style(result.failed).red());

    if result.retried > 0 {
        println!("  Retried:  {}", console::style(result.retried).yellow());
    }

    if result.not_run > 0 {
        println!("  Not Run:  {}", console::style(result.not_run).red().bold());
    }

    println!("  Attempts: {}", result.total_attempts);
    println!("  Duration: {:?}", result.duration);

    if !result.failed_tests.is_empty() {
        println!();
        println!("Failed tests:");
        for test in &result.failed_tests {
            println!(
                "  {} {} ({} attempt{})",
                console::style("✗").red(),
                test,
                test.attempts,
                if test.attempts == 1 { "" } else { "s" }
            );
            if let Some(error) = &test.error {
                println!("      {}", console::style(error).dim());
            }
        }
    }

    println!();
    if let Some(reason) = &result.bail_reason {
        println!(
            "{} {}",
            console::style("Bailed:").red().bold(),
            console::style(reason).red()
        );
    }

    if result.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}
