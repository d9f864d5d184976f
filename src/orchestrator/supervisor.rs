//! Spawns and supervises the child process of one attempt.
//!
//! The supervisor owns everything between "a worker has been allocated" and
//! "the attempt has an outcome":
//!
//! 1. Build the [`TestRun`] context and create its temp assets directory.
//! 2. Ask the framework adapter for a command and inject the run environment.
//! 3. Wait out the stagger delay, then spawn the child in its own process group.
//! 4. Stream stdout and stderr, forwarding JSON-line messages to listeners.
//! 5. Every sentry interval, kill the child if it overran the bail time or
//!    the run has bailed.
//!
//! Each attempt resolves exactly once. The resolution is whichever of
//! "child exited and output closed" or "sentry fired" happens first; the
//! loop below breaks on it and nothing after the break can resolve again.
//!
//! ```text
//!           ┌───────────── output line ──────────────┐
//!           │                                        │
//!  spawn ──►├── child.wait() ── exit + EOF ──► Exited / Crashed
//!           │
//!           └── sentry tick ── overran / bailed ──► SIGTERM ─ grace ─ SIGKILL ──► Killed
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::Worker;
use crate::framework::{BuildInfo, Command, FrameworkError, TestFramework, TestRun};
use crate::report::Listener;
use crate::test::Test;

use super::message::{ChildMessage, StatusKind, WorkerStatus};

/// Infrastructure failures of an attempt.
///
/// These are distinct from a test failing: the child never got to run.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error("Failed to create temp assets directory {path}: {source}")]
    TempDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why the sentry killed a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout(Duration),
    Bailed,
}

/// How an attempt's child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own. `None` means it was terminated by a signal.
    Exited(Option<i32>),
    /// Exited after reporting `started` but without reporting `finished`.
    Crashed(Option<i32>),
    Killed(KillReason),
}

impl Termination {
    /// The failure message for this termination, or `None` for a pass.
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Exited(Some(0)) => None,
            Self::Exited(Some(code)) => Some(format!("Test exited with code {code}")),
            Self::Exited(None) => Some("Test was terminated by a signal".to_string()),
            Self::Crashed(code) => Some(format!(
                "Test process crashed before reporting finished (exit code {})",
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            )),
            Self::Killed(KillReason::Timeout(limit)) => Some(format!(
                "Killed by sentry: test ran longer than {}ms",
                limit.as_millis()
            )),
            Self::Killed(KillReason::Bailed) => {
                Some("Killed by sentry: the run has bailed".to_string())
            }
        }
    }
}

/// Everything the runner needs to record one finished attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub termination: Termination,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    /// Name from the child's `started` message, if any.
    pub display_name: Option<String>,
    pub duration: Duration,
}

impl AttemptReport {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    /// Report for an attempt whose child was never launched because the run
    /// bailed first.
    pub fn bailed_before_launch() -> Self {
        let termination = Termination::Killed(KillReason::Bailed);
        Self {
            error: termination.error(),
            termination,
            stdout: String::new(),
            stderr: String::new(),
            display_name: None,
            duration: Duration::ZERO,
        }
    }
}

/// Timing and policy knobs for supervision.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub stagger: Duration,
    pub sentry_interval: Duration,
    pub kill_grace: Duration,
    pub bail_time: Duration,
    /// Whether the sentry kills children at all. Off for `BailNever`.
    pub enforce_timeout: bool,
    pub build: BuildInfo,
}

/// One raw line of child output, without its trailing newline.
enum OutputLine {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// What ended the monitoring loop.
enum Resolution {
    Exited(Option<i32>),
    Kill(KillReason),
}

/// Launches and watches child processes. Shared by every attempt task.
pub struct Supervisor {
    framework: Arc<dyn TestFramework>,
    listeners: Vec<Arc<dyn Listener>>,
    settings: SupervisorSettings,
    bail: CancellationToken,
}

impl Supervisor {
    pub fn new(
        framework: Arc<dyn TestFramework>,
        listeners: Vec<Arc<dyn Listener>>,
        settings: SupervisorSettings,
        bail: CancellationToken,
    ) -> Self {
        Self {
            framework,
            listeners,
            settings,
            bail,
        }
    }

    /// Runs one attempt of `test` on `worker` to completion.
    ///
    /// `Err` is returned only when the child could not be started.
    pub async fn run_test(
        &self,
        test: &Test,
        worker: &Worker,
    ) -> Result<AttemptReport, SupervisorError> {
        let run = TestRun::new(test, worker, &self.settings.build);

        tokio::fs::create_dir_all(&run.temp_assets_dir)
            .await
            .map_err(|source| SupervisorError::TempDir {
                path: run.temp_assets_dir.display().to_string(),
                source,
            })?;

        let cmd = run.apply_env(self.framework.produce_command(test, &run)?);

        if !self.settings.stagger.is_zero() {
            tokio::time::sleep(self.settings.stagger).await;
        }
        if self.has_bailed() {
            info!("Not launching {}: the run has bailed", run.test_name);
            return Ok(AttemptReport::bailed_before_launch());
        }

        debug!(
            "Worker {} launching {}: {}",
            worker.index,
            run.test_name,
            cmd.to_shell_string()
        );
        let mut child = spawn(&cmd)?;

        let senders: Vec<_> = self
            .listeners
            .iter()
            .map(|listener| {
                let (tx, rx) = mpsc::unbounded_channel();
                listener.listen_to(&run, test, rx);
                tx
            })
            .collect();

        let report = self.monitor(&mut child, &run, &senders).await;
        drop(senders);
        Ok(report)
    }

    pub fn has_bailed(&self) -> bool {
        self.bail.is_cancelled()
    }

    async fn monitor(
        &self,
        child: &mut Child,
        run: &TestRun,
        senders: &[mpsc::UnboundedSender<ChildMessage>],
    ) -> AttemptReport {
        let started_at = Instant::now();
        let pid = child.id();

        let stdout_stream = match child.stdout.take() {
            Some(stdout) => output_lines(stdout, OutputLine::Stdout),
            None => stream::empty::<OutputLine>().boxed(),
        };
        let stderr_stream = match child.stderr.take() {
            Some(stderr) => output_lines(stderr, OutputLine::Stderr),
            None => stream::empty::<OutputLine>().boxed(),
        };
        let mut output = stream::select(stdout_stream, stderr_stream);

        let mut sentry = tokio::time::interval(self.settings.sentry_interval);
        sentry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sentry.tick().await;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut display_name: Option<String> = None;
        let mut started = false;
        let mut finished = false;
        let mut output_open = true;
        let mut exit: Option<Option<i32>> = None;

        let resolution = loop {
            if let Some(code) = exit
                && !output_open
            {
                break Resolution::Exited(code);
            }

            tokio::select! {
                line = output.next(), if output_open => match line {
                    Some(OutputLine::Stdout(bytes)) => {
                        if let Some(message) = std::str::from_utf8(&bytes)
                            .ok()
                            .and_then(ChildMessage::parse)
                        {
                            if let Some(status) = message.status() {
                                match status.status {
                                    StatusKind::Started => {
                                        started = true;
                                        display_name = Some(status.name.clone());
                                    }
                                    StatusKind::Finished => finished = true,
                                }
                            }
                            broadcast(senders, &message);
                        }
                        stdout.push_str(&String::from_utf8_lossy(&bytes));
                        stdout.push('\n');
                    }
                    Some(OutputLine::Stderr(bytes)) => {
                        stderr.push_str(&String::from_utf8_lossy(&bytes));
                        stderr.push('\n');
                    }
                    None => output_open = false,
                },
                status = child.wait(), if exit.is_none() => {
                    exit = Some(match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!("Failed to wait on {}: {}", run.test_name, e);
                            None
                        }
                    });
                }
                _ = sentry.tick() => {
                    if let Some(reason) = self.sentry_check(started_at) {
                        break Resolution::Kill(reason);
                    }
                }
            }
        };

        let termination = match resolution {
            Resolution::Exited(code) if started && !finished => Termination::Crashed(code),
            Resolution::Exited(code) => Termination::Exited(code),
            Resolution::Kill(reason) => {
                info!(
                    "Sentry killing {} on worker {} ({:?})",
                    run.test_name, run.worker_index, reason
                );
                self.terminate(child, pid).await;
                Termination::Killed(reason)
            }
        };

        if started && !finished {
            let name = display_name.clone().unwrap_or_else(|| run.test_name.clone());
            broadcast(
                senders,
                &ChildMessage::Status(WorkerStatus::synthesized_finish(name)),
            );
        }

        AttemptReport {
            error: termination.error(),
            termination,
            stdout,
            stderr,
            display_name,
            duration: started_at.elapsed(),
        }
    }

    fn sentry_check(&self, started_at: Instant) -> Option<KillReason> {
        if !self.settings.enforce_timeout {
            return None;
        }
        if self.bail.is_cancelled() {
            return Some(KillReason::Bailed);
        }
        if started_at.elapsed() > self.settings.bail_time {
            return Some(KillReason::Timeout(self.settings.bail_time));
        }
        None
    }

    /// SIGTERM to the whole process group, then SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        signal_group(child, pid, GroupSignal::Terminate);

        match tokio::time::timeout(self.settings.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Child exited after SIGTERM with {:?}", status.code());
                // Grandchildren may still hold the group.
                signal_group(child, pid, GroupSignal::Kill);
            }
            _ => {
                warn!(
                    "Child did not exit within {}ms of SIGTERM, sending SIGKILL",
                    self.settings.kill_grace.as_millis()
                );
                signal_group(child, pid, GroupSignal::Kill);
                let _ = tokio::time::timeout(self.settings.kill_grace, child.wait()).await;
            }
        }
    }
}

/// Splits a pipe into raw lines. A read error is logged and ends the stream.
fn output_lines<R>(reader: R, wrap: fn(Vec<u8>) -> OutputLine) -> BoxStream<'static, OutputLine>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio_stream::wrappers::SplitStream::new(BufReader::new(reader).split(b'\n'))
        .scan((), move |_, segment| async move {
            match segment {
                Ok(bytes) => Some(wrap(bytes)),
                Err(e) => {
                    warn!("Failed to read child output: {}", e);
                    None
                }
            }
        })
        .boxed()
}

fn broadcast(senders: &[mpsc::UnboundedSender<ChildMessage>], message: &ChildMessage) {
    for tx in senders {
        // A listener that dropped its receiver just stops getting messages.
        let _ = tx.send(message.clone());
    }
}

fn spawn(cmd: &Command) -> Result<Child, SupervisorError> {
    let mut process = tokio::process::Command::new(&cmd.program);
    process.args(&cmd.args);
    for (key, value) in &cmd.env {
        process.env(key, value);
    }
    if let Some(dir) = &cmd.working_dir {
        process.current_dir(dir);
    }
    process
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    process.process_group(0);

    process.spawn().map_err(|source| SupervisorError::Spawn {
        command: cmd.to_shell_string(),
        source,
    })
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), sig) {
            debug!("killpg({}, {:?}) failed: {}", pid, sig, e);
        }
    }
    if matches!(signal, GroupSignal::Kill) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: GroupSignal) {
    let _ = child.start_kill();
}
