//! Colored console report.
//!
//! Progress goes to stdout as the suite runs. In `--json` mode nothing is
//! printed until the end, when the whole report is emitted as one document.

use std::path::Path;

use console::style;
use socrates_core::calibration::JitterStats;
use socrates_core::death_timing::{DeathTimingSummary, TrialOutcome};
use socrates_core::liveness::ScenarioOutcome;
use socrates_core::orchestrator::{
    Subject, SuiteObserver, SuitePlan, SuiteReport, Variant,
};
use socrates_core::supervisor::{RunOutcome, RunReport};
use socrates_core::system_load::LoadSnapshot;

#[derive(Debug)]
pub struct ConsoleReporter {
    json: bool,
}

impl ConsoleReporter {
    pub const fn new(json: bool) -> Self {
        Self { json }
    }

    fn line(&self, text: impl std::fmt::Display) {
        if !self.json {
            println!("{text}");
        }
    }

    fn verdict_label(passed: bool) -> console::StyledObject<&'static str> {
        if passed {
            style("PASS").green().bold()
        } else {
            style("FAIL").red().bold()
        }
    }

    /// Final summary, or the JSON document.
    pub fn finish(&self, report: &SuiteReport) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }

        self.line("");
        self.line(style("Summary").bold().underlined());
        for subject in &report.subjects {
            self.line(format!(
                "  {:<14} {}",
                subject.subject.name,
                Self::verdict_label(subject.passed())
            ));
            let failures = subject.verdicts().filter_map(|v| v.reason());
            for reason in failures {
                self.line(format!("    {} {reason}", style("-").red()));
            }
        }
        self.line("");
        if report.passed() {
            self.line(style("All tests passed").green().bold());
        } else {
            self.line(style("Some tests failed").red().bold());
        }
        Ok(())
    }
}

impl SuiteObserver for ConsoleReporter {
    fn on_calibration_sample(&mut self, index: u32, total: u32, overshoot_ms: f64) {
        self.line(format!(
            "{} {index:>2}/{total} overshoot {overshoot_ms:+.3} ms",
            style("delay-o-meter").dim()
        ));
    }

    fn on_calibration_done(&mut self, stats: &JitterStats, jittery: bool) {
        self.line(format!(
            "Sleep overshoot: mean {:.3} ms, peak {:.3} ms",
            stats.mean_ms, stats.peak_ms
        ));
        if jittery {
            self.line(
                style("Host sleep jitter is high, timing results may be unreliable")
                    .yellow()
                    .bold(),
            );
        }
    }

    fn on_load_snapshot(&mut self, snapshot: &LoadSnapshot, overloaded: bool) {
        self.line(format!(
            "Host load: CPU {:.1}%, 5 min load {:.2} on {} cores (ratio {:.2})",
            snapshot.cpu_percent,
            snapshot.load_avg_5min,
            snapshot.core_count,
            snapshot.load_ratio()
        ));
        if overloaded {
            self.line(style("CPU overloaded, results may be wrong").red().bold());
        }
    }

    fn on_build(&mut self, variant: Variant, dir: &Path, succeeded: bool) {
        let status = if succeeded {
            style("ok").green()
        } else {
            style("failed").yellow()
        };
        self.line(format!("make -C {} ({variant}): {status}", dir.display()));
    }

    fn on_subject_missing(&mut self, binary: &Path) {
        self.line(format!(
            "{} {} not found, skipping",
            style("skip").yellow(),
            binary.display()
        ));
    }

    fn on_suite_start(&mut self, plan: &SuitePlan) {
        self.line("");
        self.line(style("Test plan").bold().underlined());
        for scenario in &plan.scenarios {
            self.line(format!(
                "  liveness {scenario}: {} x {} s, must not die",
                plan.repetitions, plan.duration_secs
            ));
        }
        self.line(format!(
            "  death timing: {} trials, death expected at {} ms, tolerance {} ms",
            plan.trials, plan.expected_offset_ms, plan.tolerance_ms
        ));
        self.line(format!(
            "  at least {} s for {} subject(s)",
            plan.minimum_duration().as_secs(),
            plan.subjects.len()
        ));
    }

    fn on_subject_start(&mut self, subject: &Subject) {
        self.line("");
        self.line(format!(
            "{} {}",
            style(&subject.name).cyan().bold(),
            style(subject.binary.display()).dim()
        ));
    }

    fn on_liveness_run(&mut self, _subject: &Subject, scenario: &str, repetition: u32, run: &RunReport) {
        let status = match run.outcome {
            RunOutcome::TimedOutAlive { .. } => style("alive".to_string()).green(),
            RunOutcome::ExitedEarly { after_ms, .. } => {
                style(format!("died after {after_ms} ms")).red()
            }
        };
        let mut text = format!("  {scenario} #{repetition}: {status}");
        if run.overload_advisory {
            text.push_str(&format!(" {}", style("(CPU overloaded)").yellow()));
        }
        if run.sweep.terminated > 0 {
            text.push_str(&format!(
                " {}",
                style(format!("({} stray processes killed)", run.sweep.terminated)).yellow()
            ));
        }
        self.line(text);
    }

    fn on_scenario_done(&mut self, _subject: &Subject, outcome: &ScenarioOutcome) {
        let mut text = format!("  {} {}", outcome.scenario, Self::verdict_label(outcome.passed()));
        if let Some(reason) = outcome.verdict.reason() {
            text.push_str(&format!(": {reason}"));
        }
        self.line(text);
    }

    fn on_death_trial(&mut self, _subject: &Subject, trial: u32, outcome: &TrialOutcome) {
        match outcome {
            TrialOutcome::Measured(report) => self.line(format!(
                "  death timing #{trial}: died at {} ms, deviation {} ms",
                report.reported_death_time.saturating_sub(report.reported_start_time),
                report.deviation
            )),
            TrialOutcome::Failed(failure) => {
                self.line(format!("  death timing #{trial}: {}", style(failure).red()));
            }
        }
    }

    fn on_death_timing_done(&mut self, _subject: &Subject, summary: &DeathTimingSummary) {
        let mean = summary
            .mean_deviation_ms
            .map_or_else(|| "n/a".to_string(), |m| format!("{m:.1} ms"));
        self.line(format!(
            "  death timing {} (mean deviation {mean})",
            Self::verdict_label(summary.passed())
        ));
    }
}
