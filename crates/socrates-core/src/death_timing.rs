//! Death-timing precision tests.
//!
//! The subject runs with arguments that force exactly one starvation. Its
//! first output line gives its own clock origin and its last line must be
//! the death announcement. The deviation is measured against the subject's
//! self-reported start, not the moment the harness spawned it:
//!
//! ```text
//! deviation = |death - start - expected_offset|
//! ```
//!
//! Trials are numbered from 1 and stop at the first failure. There is no
//! averaging away of an outlier.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Error, Result};
use crate::scenario::{ExpectedOutcome, TestScenario};
use crate::supervisor::{CaptureReport, Captured, ProcessSupervisor, SubjectCommand};
use crate::timestamp::TimestampParser;
use crate::verdict::{Failure, TestVerdict};

/// Timing measured in one trial. Deviation is never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeathReport {
    pub reported_start_time: u64,
    pub reported_death_time: u64,
    pub expected_offset: u64,
    pub deviation: u64,
}

impl DeathReport {
    #[must_use]
    pub const fn new(reported_start_time: u64, reported_death_time: u64, expected_offset: u64) -> Self {
        let expected = reported_start_time.saturating_add(expected_offset);
        Self {
            reported_start_time,
            reported_death_time,
            expected_offset,
            deviation: reported_death_time.abs_diff(expected),
        }
    }

    /// Inclusive: fails only when deviation > tolerance.
    #[must_use]
    pub const fn within(&self, tolerance_ms: u64) -> bool {
        self.deviation <= tolerance_ms
    }
}

/// How a single trial ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TrialOutcome {
    /// The output parsed; the report still has to be scored.
    Measured(DeathReport),
    /// The trial could not produce a measurement.
    Failed(Failure),
}

/// Aggregate of a death-timing suite.
#[derive(Debug, Clone, Serialize)]
pub struct DeathTimingSummary {
    /// Reports of every trial that produced a measurement.
    pub reports: Vec<DeathReport>,
    /// Mean deviation over `reports`, when there are any.
    pub mean_deviation_ms: Option<f64>,
    pub verdict: TestVerdict,
}

impl DeathTimingSummary {
    fn new(reports: Vec<DeathReport>, verdict: TestVerdict) -> Self {
        let mean_deviation_ms = if reports.is_empty() {
            None
        } else {
            let total: u64 = reports.iter().map(|r| r.deviation).sum();
            Some(total as f64 / reports.len() as f64)
        };
        Self {
            reports,
            mean_deviation_ms,
            verdict,
        }
    }

    #[must_use]
    pub const fn passed(&self) -> bool {
        self.verdict.passed
    }
}

/// Runs forced-death trials and scores the reported timestamps.
#[derive(Debug, Clone)]
pub struct DeathTimingAnalyzer {
    supervisor: ProcessSupervisor,
    parser: TimestampParser,
    timeout: Duration,
    output_dir: Option<PathBuf>,
}

impl DeathTimingAnalyzer {
    /// `timeout` bounds each trial; `output_dir` keeps each trial's stdout.
    #[must_use]
    pub const fn new(
        supervisor: ProcessSupervisor,
        parser: TimestampParser,
        timeout: Duration,
        output_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            supervisor,
            parser,
            timeout,
            output_dir,
        }
    }

    /// Run one trial and parse its output.
    ///
    /// `Err` is a harness fault; a subject that misbehaves yields
    /// [`TrialOutcome::Failed`].
    pub async fn run_death_timing_trial(
        &self,
        binary: &Path,
        scenario: &TestScenario,
        trial: u32,
    ) -> Result<TrialOutcome> {
        let expected_offset = expected_offset(scenario)?;
        let command = SubjectCommand::new(binary, scenario.args.to_args());
        let subject = command.process_name();

        let CaptureReport { pid, captured, sweep } =
            self.supervisor.capture(&command, self.timeout).await?;

        let stdout = match captured {
            Captured::Exited { stdout, status } => {
                debug!(
                    subject = %subject,
                    trial,
                    pid,
                    ?status,
                    bytes = stdout.len(),
                    strays = sweep.terminated,
                    "trial subject exited"
                );
                stdout
            }
            Captured::TimedOut => {
                return Ok(TrialOutcome::Failed(Failure::SubjectDidNotExit {
                    trial,
                    timeout_secs: self.timeout.as_secs(),
                }));
            }
        };

        if let Some(dir) = &self.output_dir {
            let path = death_timing_output_path(dir, &subject, trial);
            std::fs::create_dir_all(dir)?;
            std::fs::write(&path, &stdout)?;
        }

        let text = String::from_utf8_lossy(&stdout);
        Ok(match self.measure(&text, expected_offset) {
            Ok(report) => TrialOutcome::Measured(report),
            Err(err) => {
                warn!(subject = %subject, trial, error = %err, "malformed subject output");
                TrialOutcome::Failed(Failure::malformed(trial, &err))
            }
        })
    }

    /// Parse captured output into a report.
    pub fn measure(
        &self,
        output: &str,
        expected_offset: u64,
    ) -> std::result::Result<DeathReport, crate::timestamp::ParseError> {
        let (first, last) = self.parser.first_and_last_lines(output)?;
        let start = self.parser.timestamp(first)?;
        let death = self.parser.death_timestamp(last)?;
        Ok(DeathReport::new(start, death, expected_offset))
    }

    /// Run up to `n` trials; any trial beyond `tolerance_ms` fails the suite.
    pub async fn run_n_trials(
        &self,
        binary: &Path,
        scenario: &TestScenario,
        n: u32,
        tolerance_ms: u64,
    ) -> Result<DeathTimingSummary> {
        self.run_n_trials_with(binary, scenario, n, tolerance_ms, |_, _| {})
            .await
    }

    /// Like [`run_n_trials`](Self::run_n_trials), reporting each trial.
    pub async fn run_n_trials_with(
        &self,
        binary: &Path,
        scenario: &TestScenario,
        n: u32,
        tolerance_ms: u64,
        mut on_trial: impl FnMut(u32, &TrialOutcome),
    ) -> Result<DeathTimingSummary> {
        let subject = crate::reaper::process_name_for(binary);
        let mut reports = Vec::new();

        for trial in 1..=n {
            let outcome = match self.run_death_timing_trial(binary, scenario, trial).await {
                Ok(outcome) => outcome,
                Err(Error::Spawn { program, source }) => TrialOutcome::Failed(Failure::SpawnFailed {
                    detail: format!("{}: {source}", program.display()),
                }),
                Err(e) => return Err(e),
            };
            on_trial(trial, &outcome);

            let failure = match outcome {
                TrialOutcome::Measured(report) => {
                    reports.push(report);
                    if report.within(tolerance_ms) {
                        info!(subject = %subject, trial, deviation_ms = report.deviation, tolerance_ms, "trial passed");
                        continue;
                    }
                    Failure::TimingDeviationExceeded {
                        trial,
                        deviation_ms: report.deviation,
                        tolerance_ms,
                    }
                }
                TrialOutcome::Failed(failure) => failure,
            };

            warn!(subject = %subject, trial, reason = %failure, "death-timing trial failed");
            return Ok(DeathTimingSummary::new(reports, TestVerdict::fail(failure)));
        }

        Ok(DeathTimingSummary::new(reports, TestVerdict::pass()))
    }
}

fn expected_offset(scenario: &TestScenario) -> Result<u64> {
    match scenario.expected {
        ExpectedOutcome::MustReportDeathNear { offset_ms } => Ok(offset_ms),
        ExpectedOutcome::MustSurvive => Err(Error::Config(ConfigError::InvalidValue {
            field: "death_timing",
            reason: format!("scenario {} does not expect a death", scenario.name),
        })),
    }
}

/// `<dir>/<subject>_death_timing_<trial>_out.txt`
#[must_use]
pub fn death_timing_output_path(dir: &Path, subject: &str, trial: u32) -> PathBuf {
    dir.join(format!("{subject}_death_timing_{trial}_out.txt"))
}
