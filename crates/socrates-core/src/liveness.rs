//! Liveness (endurance) tests.
//!
//! A scenario passes only when every repetition survives the full duration.
//! The first repetition that exits early fails the scenario and skips the
//! rest. Repetitions are numbered from 1.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::scenario::TestScenario;
use crate::supervisor::{OutputSink, ProcessSupervisor, RunReport, SubjectCommand};
use crate::verdict::{Failure, TestVerdict};

/// Result of one scenario across its repetitions.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub verdict: TestVerdict,
    /// Every repetition that actually ran.
    pub runs: Vec<RunReport>,
}

impl ScenarioOutcome {
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.verdict.passed
    }
}

/// Runs must-survive scenarios through a [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct LivenessTestRunner {
    supervisor: ProcessSupervisor,
    output_dir: Option<PathBuf>,
}

impl LivenessTestRunner {
    /// `output_dir` receives each run's stdout; `None` discards it.
    #[must_use]
    pub const fn new(supervisor: ProcessSupervisor, output_dir: Option<PathBuf>) -> Self {
        Self {
            supervisor,
            output_dir,
        }
    }

    /// Run `scenario` against `binary` up to `repetitions` times.
    pub async fn run_scenario(
        &self,
        binary: &Path,
        scenario: &TestScenario,
        repetitions: u32,
        duration: Duration,
    ) -> Result<ScenarioOutcome> {
        self.run_scenario_with(binary, scenario, repetitions, duration, |_, _| {})
            .await
    }

    /// Like [`run_scenario`](Self::run_scenario), reporting each finished run.
    pub async fn run_scenario_with(
        &self,
        binary: &Path,
        scenario: &TestScenario,
        repetitions: u32,
        duration: Duration,
        mut on_run: impl FnMut(u32, &RunReport),
    ) -> Result<ScenarioOutcome> {
        let command = SubjectCommand::new(binary, scenario.args.to_args());
        let subject = command.process_name();
        let mut runs = Vec::new();

        for repetition in 1..=repetitions {
            let sink = self.sink_for(&subject, &scenario.name, repetition);
            let span = info_span!(
                "liveness",
                subject = %subject,
                scenario = %scenario.name,
                repetition
            );

            let report = match self
                .supervisor
                .run_and_monitor(&command, duration, &sink)
                .instrument(span)
                .await
            {
                Ok(report) => report,
                Err(Error::Spawn { program, source }) => {
                    warn!(subject = %subject, error = %source, "could not start subject");
                    return Ok(ScenarioOutcome {
                        scenario: scenario.name.clone(),
                        verdict: TestVerdict::fail(Failure::SpawnFailed {
                            detail: format!("{}: {source}", program.display()),
                        }),
                        runs,
                    });
                }
                Err(e) => return Err(e),
            };

            on_run(repetition, &report);
            let verdict = report.verdict(repetition);
            runs.push(report);

            if !verdict.passed {
                info!(
                    subject = %subject,
                    scenario = %scenario.name,
                    repetition,
                    "scenario failed, skipping remaining repetitions"
                );
                return Ok(ScenarioOutcome {
                    scenario: scenario.name.clone(),
                    verdict,
                    runs,
                });
            }
        }

        Ok(ScenarioOutcome {
            scenario: scenario.name.clone(),
            verdict: TestVerdict::pass(),
            runs,
        })
    }

    fn sink_for(&self, subject: &str, scenario: &str, repetition: u32) -> OutputSink {
        self.output_dir.as_ref().map_or(OutputSink::Discard, |dir| {
            OutputSink::File(liveness_output_path(dir, subject, scenario, repetition))
        })
    }
}

/// `<dir>/<subject>_<scenario>_<repetition>_out.txt`
#[must_use]
pub fn liveness_output_path(dir: &Path, subject: &str, scenario: &str, repetition: u32) -> PathBuf {
    dir.join(format!("{subject}_{scenario}_{repetition}_out.txt"))
}
