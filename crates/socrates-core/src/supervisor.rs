//! Subject process supervision.
//!
//! A liveness run walks this state machine:
//!
//! ```text
//! SPAWNED ─► RUNNING ◄─► polled ─┬─► EXITED_EARLY ──┐
//!                                └─► TIMED_OUT_ALIVE ┴─► REAPED (stray sweep)
//! ```
//!
//! The supervisor polls at a fixed tick until the wall-clock deadline. An
//! exit observed at any tick is a premature exit and ends the run at once.
//! A subject still alive at the deadline is killed, which counts as a pass:
//! liveness tests prove the ability to survive, not to finish.
//!
//! Each tick also checks host load, and the first overloaded tick emits a
//! single advisory for the run. After every run, strays sharing the
//! subject's executable name are swept.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reaper::{SweepReport, process_name_for, sweep_strays};
use crate::system_load::SystemLoadMonitor;
use crate::verdict::{Failure, TestVerdict};

// =============================================================================
// Commands and sinks
// =============================================================================

/// What to run: a subject executable and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SubjectCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Name the subject's processes carry in the process table.
    #[must_use]
    pub fn process_name(&self) -> String {
        process_name_for(&self.program)
    }
}

impl std::fmt::Display for SubjectCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Where a liveness subject's stdout goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// Thrown away.
    Discard,
    /// Written to a file, created (with parents) or truncated.
    File(PathBuf),
}

impl OutputSink {
    fn open(&self) -> Result<Stdio> {
        match self {
            Self::Discard => Ok(Stdio::null()),
            Self::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Ok(Stdio::from(File::create(path)?))
            }
        }
    }
}

// =============================================================================
// Subject process
// =============================================================================

/// A running subject, owned by exactly one supervising call.
///
/// Dropping the handle kills the process, so an aborted run never leaks it.
#[derive(Debug)]
pub struct SubjectProcess {
    executable_path: PathBuf,
    pid: u32,
    started_at: Instant,
    child: Child,
}

/// How a captured subject ended.
#[derive(Debug)]
pub enum Captured {
    /// The subject exited; everything it printed.
    Exited { stdout: Vec<u8>, status: ExitStatus },
    /// The subject outlived the limit and was killed.
    TimedOut,
}

impl SubjectProcess {
    /// Spawn `command` with stdout routed to `stdout`.
    pub fn spawn(command: &SubjectCommand, stdout: Stdio) -> Result<Self> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: command.program.clone(),
                source,
            })?;
        let started_at = Instant::now();
        let pid = child
            .id()
            .ok_or_else(|| Error::Runtime("subject exited before its pid was read".into()))?;
        debug!(pid, subject = %command, "subject spawned");
        Ok(Self {
            executable_path: command.program.clone(),
            pid,
            started_at,
            child,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Kill the subject and reap it.
    pub async fn kill(mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| Error::Runtime("subject stdout was not piped".into()))
    }

    /// Wait for the subject's own exit, reading stdout meanwhile so a full
    /// pipe never stalls it. EOF is not awaited: anything that inherited the
    /// pipe may still hold it open.
    async fn wait_reading(
        &mut self,
        stdout: &mut ChildStdout,
        buf: &mut Vec<u8>,
    ) -> std::io::Result<ExitStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut eof = false;
        loop {
            tokio::select! {
                status = self.child.wait() => return status,
                read = stdout.read(&mut chunk), if !eof => match read? {
                    0 => eof = true,
                    n => buf.extend_from_slice(&chunk[..n]),
                },
            }
        }
    }
}

const READ_CHUNK: usize = 8192;
/// A drain read that stalls this long means only a leaked writer is left.
const DRAIN_IDLE: Duration = Duration::from_millis(200);
const DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Read what is left in the pipe after the subject exited.
async fn drain(stdout: &mut ChildStdout, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let deadline = tokio::time::Instant::now() + DRAIN_LIMIT;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let idle = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .min(DRAIN_IDLE);
        match tokio::time::timeout(idle, stdout.read(&mut chunk)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(bytes = buf.len(), "stdout still held open after exit, stopped draining");
                return Ok(());
            }
        }
    }
}

/// A captured run: how it ended plus the stray sweep that followed.
#[derive(Debug)]
pub struct CaptureReport {
    pub pid: u32,
    pub captured: Captured,
    pub sweep: SweepReport,
}

// =============================================================================
// Run reports
// =============================================================================

/// Terminal state of a monitored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The subject exited before the deadline.
    ExitedEarly { after_ms: u64, exit_code: Option<i32> },
    /// The subject was alive at the deadline and was killed.
    TimedOutAlive { ran_for_ms: u64 },
}

/// Everything observed during one monitored run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub pid: u32,
    pub outcome: RunOutcome,
    /// The host was overloaded at some tick of this run.
    pub overload_advisory: bool,
    pub sweep: SweepReport,
}

impl RunReport {
    #[must_use]
    pub const fn survived(&self) -> bool {
        matches!(self.outcome, RunOutcome::TimedOutAlive { .. })
    }

    /// Liveness verdict for this run.
    #[must_use]
    pub fn verdict(&self, repetition: u32) -> TestVerdict {
        match self.outcome {
            RunOutcome::TimedOutAlive { .. } => TestVerdict::pass(),
            RunOutcome::ExitedEarly {
                after_ms,
                exit_code,
            } => TestVerdict::fail(Failure::PrematureExit {
                repetition,
                after_ms,
                exit_code,
            }),
        }
    }
}

fn exited_early(subject: &SubjectProcess, status: ExitStatus) -> RunOutcome {
    RunOutcome::ExitedEarly {
        after_ms: subject.elapsed().as_millis() as u64,
        exit_code: status.code(),
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Spawns, polls, kills, and cleans up after subjects.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    poll_interval: Duration,
    load: Arc<SystemLoadMonitor>,
}

impl ProcessSupervisor {
    /// `poll_interval` is the liveness tick; it must be non-zero.
    #[must_use]
    pub fn new(poll_interval: Duration, load: Arc<SystemLoadMonitor>) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            load,
        }
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn load_monitor(&self) -> &Arc<SystemLoadMonitor> {
        &self.load
    }

    /// Run `command` and require it to stay alive for `timeout`.
    ///
    /// Returns `Err` only for harness faults (the subject could not be
    /// spawned, the sink could not be opened); a subject that dies early
    /// is a normal [`RunOutcome::ExitedEarly`].
    pub async fn run_and_monitor(
        &self,
        command: &SubjectCommand,
        timeout: Duration,
        sink: &OutputSink,
    ) -> Result<RunReport> {
        let mut subject = SubjectProcess::spawn(command, sink.open()?)?;
        let pid = subject.pid();
        let deadline = subject.started_at + timeout;
        let mut overload_advisory = false;

        let early_exit = loop {
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let step = (deadline - now).min(self.poll_interval);
            let (_, overloaded) = tokio::join!(
                tokio::time::sleep(step),
                self.check_load(overload_advisory)
            );
            if overloaded && !overload_advisory {
                overload_advisory = true;
                warn!(pid, "CPU overloaded, results may be wrong");
            }
            if let Some(status) = subject.try_exit()? {
                break Some(exited_early(&subject, status));
            }
        };

        let outcome = match early_exit {
            Some(outcome) => outcome,
            None => self.finish_alive(subject).await?,
        };

        match outcome {
            RunOutcome::ExitedEarly {
                after_ms,
                exit_code,
            } => info!(pid, after_ms, ?exit_code, "subject exited early"),
            RunOutcome::TimedOutAlive { ran_for_ms } => {
                debug!(pid, ran_for_ms, "subject survived, killed at deadline");
            }
        }

        let sweep = self.sweep(command).await;
        Ok(RunReport {
            pid,
            outcome,
            overload_advisory,
            sweep,
        })
    }

    /// Run `command` to completion, collecting everything it prints.
    ///
    /// Only the subject's own exit is bounded by `limit`; a subject still
    /// running then is killed and reported as [`Captured::TimedOut`]. Strays
    /// are swept before the pipe is drained, because a leaked child that
    /// inherited stdout keeps its write end open.
    pub async fn capture(&self, command: &SubjectCommand, limit: Duration) -> Result<CaptureReport> {
        let mut subject = SubjectProcess::spawn(command, Stdio::piped())?;
        let pid = subject.pid();
        let mut stdout = subject.take_stdout()?;
        let mut buf = Vec::new();

        let waited =
            tokio::time::timeout(limit, subject.wait_reading(&mut stdout, &mut buf)).await;
        let status = match waited {
            Ok(status) => Some(status),
            Err(_) => {
                warn!(pid, limit_secs = limit.as_secs(), "subject did not exit, killing");
                subject.kill().await?;
                None
            }
        };

        let sweep = self.sweep(command).await;
        let captured = match status {
            Some(status) => {
                let status = status?;
                drain(&mut stdout, &mut buf).await?;
                Captured::Exited { stdout: buf, status }
            }
            None => Captured::TimedOut,
        };
        Ok(CaptureReport {
            pid,
            captured,
            sweep,
        })
    }

    /// Sweep strays of `command`'s executable.
    pub async fn sweep(&self, command: &SubjectCommand) -> SweepReport {
        sweep_strays(command.process_name()).await
    }

    /// Final exit check at the deadline, then kill a survivor.
    async fn finish_alive(&self, mut subject: SubjectProcess) -> Result<RunOutcome> {
        if let Some(status) = subject.try_exit()? {
            return Ok(exited_early(&subject, status));
        }
        let ran_for_ms = subject.elapsed().as_millis() as u64;
        subject.kill().await?;
        Ok(RunOutcome::TimedOutAlive { ran_for_ms })
    }

    /// Load check on the blocking pool; skipped once the advisory was issued.
    async fn check_load(&self, already_warned: bool) -> bool {
        if already_warned {
            return true;
        }
        let load = Arc::clone(&self.load);
        tokio::task::spawn_blocking(move || load.is_overloaded())
            .await
            .unwrap_or(false)
    }
}
