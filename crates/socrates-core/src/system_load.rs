//! Host load monitoring for trustworthy timing.
//!
//! A timing result taken while the host is oversubscribed says more about
//! the host than about the subject. The monitor samples CPU utilization and
//! the 5-minute load average on every query and flags the host as
//! overloaded when either crosses its threshold.
//!
//! - **Linux**: CPU utilization from two `/proc/stat` reads a short window
//!   apart, load average from `/proc/loadavg`.
//! - **macOS**: `ps` CPU shares and `sysctl -n vm.loadavg` (no unsafe FFI).
//! - **Other**: reports an idle host.
//!
//! Nothing is cached between queries: load drifts during a long test.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Overload thresholds and sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// CPU utilization (percent) above which the host is overloaded.
    pub cpu_percent_threshold: f64,
    /// 5-minute load average per core above which the host is overloaded.
    pub load_ratio_threshold: f64,
    /// Window between the two CPU counter reads, in milliseconds.
    pub cpu_sample_window_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            cpu_percent_threshold: 50.0,
            load_ratio_threshold: 1.0,
            cpu_sample_window_ms: 50,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A single reading of host load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub cpu_percent: f64,
    pub load_avg_5min: f64,
    pub core_count: u32,
}

impl LoadSnapshot {
    /// 5-minute load average divided by the logical core count.
    #[must_use]
    pub fn load_ratio(&self) -> f64 {
        self.load_avg_5min / f64::from(self.core_count.max(1))
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Where load readings come from.
pub trait LoadSource: Send + Sync {
    /// Take a fresh reading. May block for a short sampling window.
    fn snapshot(&self) -> LoadSnapshot;
}

/// Reads the real host through the OS.
#[derive(Debug, Clone)]
pub struct HostLoadSource {
    window: Duration,
}

impl HostLoadSource {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl LoadSource for HostLoadSource {
    fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            cpu_percent: read_cpu_percent(self.window),
            load_avg_5min: read_load_avg_5min(),
            core_count: detect_ncpu(),
        }
    }
}

/// A fixed reading, for hosts that cannot be measured and for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoadSource(pub LoadSnapshot);

impl LoadSource for FixedLoadSource {
    fn snapshot(&self) -> LoadSnapshot {
        self.0
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Decides whether the host is currently too busy for trustworthy timing.
pub struct SystemLoadMonitor {
    config: LoadConfig,
    source: Box<dyn LoadSource>,
}

impl std::fmt::Debug for SystemLoadMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemLoadMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SystemLoadMonitor {
    /// Monitor backed by the real host.
    #[must_use]
    pub fn new(config: LoadConfig) -> Self {
        let window = Duration::from_millis(config.cpu_sample_window_ms);
        Self::with_source(config, HostLoadSource::new(window))
    }

    /// Monitor backed by an arbitrary source.
    #[must_use]
    pub fn with_source(config: LoadConfig, source: impl LoadSource + 'static) -> Self {
        Self {
            config,
            source: Box::new(source),
        }
    }

    /// Take a fresh reading.
    #[must_use]
    pub fn snapshot(&self) -> LoadSnapshot {
        self.source.snapshot()
    }

    /// Classify a reading against the configured thresholds.
    #[must_use]
    pub fn classify(&self, snapshot: &LoadSnapshot) -> bool {
        snapshot.cpu_percent > self.config.cpu_percent_threshold
            || snapshot.load_ratio() > self.config.load_ratio_threshold
    }

    /// True when the host is overloaded right now.
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        let snapshot = self.snapshot();
        let overloaded = self.classify(&snapshot);
        if overloaded {
            tracing::debug!(
                cpu_percent = snapshot.cpu_percent,
                load_ratio = snapshot.load_ratio(),
                "host overloaded"
            );
        }
        overloaded
    }
}

// =============================================================================
// Linux: /proc/stat and /proc/loadavg
// =============================================================================

/// Aggregate CPU counters from the `cpu ` line of `/proc/stat`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Parse the aggregate `cpu` line.
///
/// Format: `cpu  user nice system idle iowait irq softirq steal guest guest_nice`
#[cfg(target_os = "linux")]
fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<u64>().ok())
        .collect::<Option<_>>()?;
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    parse_proc_stat(&contents)
}

#[cfg(target_os = "linux")]
fn cpu_percent_between(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let busy = after.busy.saturating_sub(before.busy);
    (busy as f64 / total as f64) * 100.0
}

#[cfg(target_os = "linux")]
fn read_cpu_percent(window: Duration) -> f64 {
    let Some(before) = read_cpu_times() else {
        return 0.0;
    };
    std::thread::sleep(window);
    let Some(after) = read_cpu_times() else {
        return 0.0;
    };
    cpu_percent_between(before, after)
}

/// Second field of `/proc/loadavg`: `0.52 0.58 0.59 2/1234 5678`
#[cfg(target_os = "linux")]
fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().nth(1)?.parse::<f64>().ok()
}

#[cfg(target_os = "linux")]
fn read_load_avg_5min() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| parse_loadavg(&s))
        .unwrap_or(0.0)
}

// =============================================================================
// macOS: ps and sysctl (safe, no FFI)
// =============================================================================

/// Sum of per-process CPU shares from `ps`, normalized by core count.
#[cfg(target_os = "macos")]
fn read_cpu_percent(_window: Duration) -> f64 {
    let total: f64 = std::process::Command::new("ps")
        .args(["-A", "-o", "%cpu="])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| {
            s.lines()
                .filter_map(|l| l.trim().parse::<f64>().ok())
                .sum()
        })
        .unwrap_or(0.0);
    (total / f64::from(detect_ncpu())).min(100.0)
}

/// Output format of `sysctl -n vm.loadavg`: `{ 2.49 2.15 2.12 }`
#[cfg(target_os = "macos")]
fn read_load_avg_5min() -> f64 {
    std::process::Command::new("sysctl")
        .args(["-n", "vm.loadavg"])
        .output()
        .ok()
        .and_then(|o| {
            let s = String::from_utf8(o.stdout).ok()?;
            let trimmed = s
                .trim()
                .trim_start_matches('{')
                .trim_end_matches('}')
                .trim();
            trimmed.split_whitespace().nth(1)?.parse::<f64>().ok()
        })
        .unwrap_or(0.0)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_cpu_percent(_window: Duration) -> f64 {
    0.0
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_load_avg_5min() -> f64 {
    0.0
}

// =============================================================================
// CPU count detection
// =============================================================================

/// Number of logical CPUs.
fn detect_ncpu() -> u32 {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sysctl")
            .args(["-n", "hw.ncpu"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(1)
            .max(1)
    }
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/cpuinfo")
            .ok()
            .map(|s| s.lines().filter(|l| l.starts_with("processor")).count() as u32)
            .filter(|n| *n > 0)
            .or_else(|| {
                std::thread::available_parallelism()
                    .ok()
                    .map(|n| n.get() as u32)
            })
            .unwrap_or(1)
            .max(1)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }
}

// =============================================================================
// Tests
// =============================================================================
