//! Stray subject process sweep.
//!
//! Subjects that fork (the `philo_bonus` variant runs one process per
//! philosopher) can leave children behind when the harness kills the
//! parent. Those strays burn CPU and skew the next trial, so after every
//! monitored run the process table is scanned for anything still running
//! under the subject's executable name, and each match is terminated.
//!
//! The sweep is keyed by name only, never by a process handle: the whole
//! point is to catch processes the harness lost track of.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long a SIGTERM'd stray gets before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Poll cadence while waiting for a stray to vanish.
const VANISH_POLL: Duration = Duration::from_millis(10);

/// Linux truncates `comm` to 15 bytes (TASK_COMM_LEN - 1).
#[cfg(target_os = "linux")]
const COMM_MAX_LEN: usize = 15;

/// Summary of a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Number of live processes matching the name.
    pub scanned: usize,
    /// Number of strays terminated.
    pub terminated: usize,
    /// PIDs that were terminated.
    pub terminated_pids: Vec<u32>,
    /// Errors encountered during the sweep.
    pub errors: Vec<String>,
}

impl SweepReport {
    /// True when the sweep found nothing to do.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.terminated == 0 && self.errors.is_empty()
    }
}

/// The name a process table entry carries for `executable`.
///
/// This is the basename, truncated the way the kernel truncates it.
#[must_use]
pub fn process_name_for(executable: &Path) -> String {
    let base = executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string_lossy().into_owned());
    truncate_comm(&base).to_string()
}

#[cfg(target_os = "linux")]
fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_MAX_LEN {
        return name;
    }
    let mut end = COMM_MAX_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(not(target_os = "linux"))]
fn truncate_comm(name: &str) -> &str {
    name
}

/// Find and terminate every running process named `name`.
///
/// Blocks for up to [`TERMINATE_GRACE`] per stubborn process. Running it
/// when nothing matches is a no-op; a process that disappears between the
/// scan and the kill is not an error.
pub fn find_and_terminate_by_name(name: &str) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let pids = find_processes_by_name(name)?;
    report.scanned = pids.len();

    for pid in pids {
        match terminate(pid) {
            Ok(true) => {
                report.terminated += 1;
                report.terminated_pids.push(pid);
            }
            Ok(false) => debug!(pid, "stray already gone"),
            Err(e) => report.errors.push(format!("failed to terminate pid {pid}: {e}")),
        }
    }

    if report.terminated > 0 {
        warn!(
            subject = name,
            killed = report.terminated,
            pids = ?report.terminated_pids,
            "terminated stray subject processes"
        );
    }
    for err in &report.errors {
        warn!(subject = name, error = %err, "stray sweep error");
    }

    Ok(report)
}

/// Async wrapper running the sweep on the blocking pool.
pub async fn sweep_strays(name: String) -> SweepReport {
    tokio::task::spawn_blocking(move || find_and_terminate_by_name(&name))
        .await
        .map_err(|e| Error::Runtime(format!("spawn_blocking failed: {e}")))
        .and_then(|r| r)
        .unwrap_or_else(|e| SweepReport {
            errors: vec![e.to_string()],
            ..SweepReport::default()
        })
}

// =============================================================================
// Process table scan
// =============================================================================

/// PIDs of live (non-zombie) processes named `name`, excluding ourselves.
#[cfg(target_os = "linux")]
pub fn find_processes_by_name(name: &str) -> Result<Vec<u32>> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|e| Error::ProcessTable(format!("read /proc: {e}")))?;
    let me = std::process::id();

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        // The process may exit between read_dir and this read.
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((comm, state)) = parse_stat_name_state(&stat) {
            if comm == name && is_live_state(state) {
                pids.push(pid);
            }
        }
    }
    Ok(pids)
}

/// Parse `pid (comm) state ...`; comm may contain spaces and parens.
#[cfg(target_os = "linux")]
fn parse_stat_name_state(stat: &str) -> Option<(&str, &str)> {
    let start = stat.find('(')?;
    let end = stat.rfind(')')?;
    let comm = stat.get(start + 1..end)?;
    let state = stat.get(end + 1..)?.split_whitespace().next()?;
    Some((comm, state))
}

#[cfg(target_os = "linux")]
fn is_live_state(state: &str) -> bool {
    !matches!(state, "Z" | "X" | "x")
}

#[cfg(target_os = "macos")]
pub fn find_processes_by_name(name: &str) -> Result<Vec<u32>> {
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,stat=,comm="])
        .output()
        .map_err(|e| Error::ProcessTable(format!("ps failed: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ProcessTable(format!("ps returned non-zero: {stderr}")));
    }

    let me = std::process::id();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut pids = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(stat)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        let comm: Vec<&str> = fields.collect();
        let comm = comm.join(" ");
        let base = Path::new(&comm)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if pid != me && base == name && !stat.starts_with('Z') {
            pids.push(pid);
        }
    }
    Ok(pids)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn find_processes_by_name(_name: &str) -> Result<Vec<u32>> {
    Err(Error::ProcessTable(
        "process table scan not supported on this platform".to_string(),
    ))
}

/// True while `pid` exists and is not a zombie.
#[must_use]
pub fn process_is_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| parse_stat_name_state(&stat).map(|(_, s)| is_live_state(s)))
            .unwrap_or(false)
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        signal_pid(pid, None).unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

// =============================================================================
// Termination
// =============================================================================

/// SIGTERM, wait for the process to vanish, then SIGKILL.
///
/// Returns `Ok(false)` when the process was already gone.
#[cfg(unix)]
fn terminate(pid: u32) -> Result<bool> {
    use nix::sys::signal::Signal;

    if !signal_pid(pid, Some(Signal::SIGTERM))? {
        return Ok(false);
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if !process_is_running(pid) {
            return Ok(true);
        }
        std::thread::sleep(VANISH_POLL);
    }

    debug!(pid, "stray ignored SIGTERM, escalating to SIGKILL");
    signal_pid(pid, Some(Signal::SIGKILL))?;
    Ok(true)
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> Result<bool> {
    Err(Error::ProcessTable(
        "terminate not supported on this platform".to_string(),
    ))
}

/// Send `signal` (or probe with `None`). `Ok(false)` means no such process.
#[cfg(unix)]
fn signal_pid(pid: u32, signal: Option<nix::sys::signal::Signal>) -> Result<bool> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| Error::ProcessTable(format!("pid {pid} out of range")))?;
    match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        // "No such process" means it already exited, not an error
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::ProcessTable(format!("kill {pid}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_report_default_is_clean() {
        let report = SweepReport::default();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.terminated, 0);
        assert!(report.terminated_pids.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn sweep_report_serializes() {
        let report = SweepReport {
            scanned: 3,
            terminated: 2,
            terminated_pids: vec![1234, 5678],
            errors: vec![],
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"scanned\":3"));
        assert!(json.contains("\"terminated\":2"));
    }

    #[test]
    fn process_name_is_basename() {
        assert_eq!(process_name_for(Path::new("/home/me/philo/philo")), "philo");
        assert_eq!(process_name_for(Path::new("philo_bonus")), "philo_bonus");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_name_is_truncated_like_comm() {
        assert_eq!(
            process_name_for(Path::new("./long_test_positive.py")),
            "long_test_posit"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_stat_handles_parens_in_name() {
        let stat = "4242 (weird) name) S 1 4242 4242 0 -1";
        assert_eq!(parse_stat_name_state(stat), Some(("weird) name", "S")));
        assert_eq!(parse_stat_name_state("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn zombies_are_not_live() {
        assert!(is_live_state("R"));
        assert!(is_live_state("S"));
        assert!(!is_live_state("Z"));
    }

    #[cfg(unix)]
    #[test]
    fn sweep_with_no_match_is_a_noop_twice() {
        let name = "socrates-none-zz";
        let first = find_and_terminate_by_name(name).expect("first sweep");
        let second = find_and_terminate_by_name(name).expect("second sweep");
        assert_eq!(first, SweepReport::default());
        assert_eq!(second, SweepReport::default());
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_running_and_never_matched() {
        assert!(process_is_running(std::process::id()));
        let me = std::env::current_exe().unwrap();
        let pids = find_processes_by_name(&process_name_for(&me)).unwrap();
        assert!(!pids.contains(&std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn missing_pid_is_not_running() {
        assert!(!process_is_running(u32::MAX - 1));
    }
}
