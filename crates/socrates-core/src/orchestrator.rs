//! Suite sequencing across subject binaries.
//!
//! Order of a full run:
//! 1. delay-o-meter (host jitter), with a pause when the host is jittery
//! 2. one host load reading
//! 3. `make` for project subjects, unless disabled
//! 4. per subject: every liveness scenario, then the death-timing suite
//!
//! Every scenario runs even after a failure. Verdicts fold into a
//! [`SuiteReport`]; progress is pushed to a [`SuiteObserver`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::calibration::{DelayCalibrator, JitterStats};
use crate::config::HarnessConfig;
use crate::death_timing::{DeathTimingAnalyzer, DeathTimingSummary, TrialOutcome};
use crate::error::{Error, Result};
use crate::liveness::{LivenessTestRunner, ScenarioOutcome};
use crate::reaper::process_name_for;
use crate::supervisor::{ProcessSupervisor, RunReport};
use crate::system_load::{LoadSnapshot, SystemLoadMonitor};
use crate::verdict::TestVerdict;

// =============================================================================
// Subjects
// =============================================================================

/// The two builds of a philosophers project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Threads and mutexes: `philo/philo`.
    Mandatory,
    /// Processes and semaphores: `philo_bonus/philo_bonus`.
    Bonus,
}

impl Variant {
    /// Directory and binary name inside the project.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mandatory => "philo",
            Self::Bonus => "philo_bonus",
        }
    }

    #[must_use]
    pub fn build_dir(self, project: &Path) -> PathBuf {
        project.join(self.name())
    }

    #[must_use]
    pub fn binary(self, project: &Path) -> PathBuf {
        self.build_dir(project).join(self.name())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which variants a project run covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantSelection {
    #[default]
    All,
    Mandatory,
    Bonus,
}

impl VariantSelection {
    #[must_use]
    pub fn variants(self) -> Vec<Variant> {
        match self {
            Self::All => vec![Variant::Mandatory, Variant::Bonus],
            Self::Mandatory => vec![Variant::Mandatory],
            Self::Bonus => vec![Variant::Bonus],
        }
    }
}

impl FromStr for VariantSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "0" => Ok(Self::All),
            "philo" | "mandatory" | "1" => Ok(Self::Mandatory),
            "bonus" | "philo_bonus" | "2" => Ok(Self::Bonus),
            _ => Err(format!(
                "unknown variant: {s}. Expected one of: all (0), philo (1), bonus (2)"
            )),
        }
    }
}

/// Where subject binaries come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectSource {
    /// A philosophers project directory, optionally built with `make`.
    Project {
        dir: PathBuf,
        selection: VariantSelection,
        build: bool,
    },
    /// Binaries given directly; never built.
    Explicit(Vec<PathBuf>),
}

/// One binary under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    /// Executable name, used in logs and output file names.
    pub name: String,
    pub binary: PathBuf,
}

impl Subject {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        Self {
            name: process_name_for(&binary),
            binary,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Everything tested for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject: Subject,
    pub liveness: Vec<ScenarioOutcome>,
    pub death_timing: DeathTimingSummary,
}

impl SubjectReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.liveness.iter().all(ScenarioOutcome::passed) && self.death_timing.passed()
    }

    /// Every verdict of this subject, liveness first.
    pub fn verdicts(&self) -> impl Iterator<Item = &TestVerdict> {
        self.liveness
            .iter()
            .map(|s| &s.verdict)
            .chain(std::iter::once(&self.death_timing.verdict))
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<JitterStats>,
    pub subjects: Vec<SubjectReport>,
}

impl SuiteReport {
    /// True when at least one subject ran and every verdict passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.subjects.is_empty()
            && crate::verdict::all_passed(self.subjects.iter().flat_map(SubjectReport::verdicts))
    }
}

/// What a run is about to do, for the description banner.
#[derive(Debug, Clone, Serialize)]
pub struct SuitePlan {
    pub subjects: Vec<Subject>,
    pub scenarios: Vec<String>,
    pub repetitions: u32,
    pub duration_secs: u64,
    pub trials: u32,
    pub tolerance_ms: u64,
    pub expected_offset_ms: u64,
}

impl SuitePlan {
    /// Lower bound on the run time: liveness runs cannot end early on success.
    #[must_use]
    pub fn minimum_duration(&self) -> Duration {
        let runs = self.subjects.len() as u64 * self.scenarios.len() as u64 * u64::from(self.repetitions);
        Duration::from_secs(runs * self.duration_secs)
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Progress callbacks. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait SuiteObserver: Send {
    fn on_calibration_sample(&mut self, index: u32, total: u32, overshoot_ms: f64) {}
    fn on_calibration_done(&mut self, stats: &JitterStats, jittery: bool) {}
    fn on_load_snapshot(&mut self, snapshot: &LoadSnapshot, overloaded: bool) {}
    fn on_build(&mut self, variant: Variant, dir: &Path, succeeded: bool) {}
    fn on_subject_missing(&mut self, binary: &Path) {}
    fn on_suite_start(&mut self, plan: &SuitePlan) {}
    fn on_subject_start(&mut self, subject: &Subject) {}
    fn on_liveness_run(&mut self, subject: &Subject, scenario: &str, repetition: u32, run: &RunReport) {}
    fn on_scenario_done(&mut self, subject: &Subject, outcome: &ScenarioOutcome) {}
    fn on_death_trial(&mut self, subject: &Subject, trial: u32, outcome: &TrialOutcome) {}
    fn on_death_timing_done(&mut self, subject: &Subject, summary: &DeathTimingSummary) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SuiteObserver for NoopObserver {}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs the configured suite, one subject process at a time.
#[derive(Debug, Clone)]
pub struct TestOrchestrator {
    config: HarnessConfig,
    load: Arc<SystemLoadMonitor>,
}

impl TestOrchestrator {
    /// Orchestrator reading the real host load.
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        let load = Arc::new(SystemLoadMonitor::new(config.load.clone()));
        Self::with_load_monitor(config, load)
    }

    #[must_use]
    pub const fn with_load_monitor(config: HarnessConfig, load: Arc<SystemLoadMonitor>) -> Self {
        Self { config, load }
    }

    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Measure host sleep jitter, reporting each sample.
    pub async fn calibrate(&self, observer: &mut dyn SuiteObserver) -> Result<JitterStats> {
        let total = self.config.calibration.samples;
        let calibrator = DelayCalibrator::from_config(&self.config.calibration);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let task = tokio::task::spawn_blocking(move || {
            calibrator.measure_jitter_with(total, |sample| {
                let _ = tx.send(sample);
            })
        });

        let mut index = 0;
        while let Some(sample) = rx.recv().await {
            index += 1;
            observer.on_calibration_sample(index, total, sample);
        }

        let stats = task
            .await
            .map_err(|e| Error::Runtime(format!("calibration task failed: {e}")))?;
        let jittery = stats.exceeds(self.config.calibration.warn_threshold_ms);
        info!(mean_ms = stats.mean_ms, peak_ms = stats.peak_ms, jittery, "calibration done");
        observer.on_calibration_done(&stats, jittery);
        Ok(stats)
    }

    /// One fresh host load reading.
    pub async fn load_snapshot(&self) -> Result<(LoadSnapshot, bool)> {
        let load = Arc::clone(&self.load);
        tokio::task::spawn_blocking(move || {
            let snapshot = load.snapshot();
            let overloaded = load.classify(&snapshot);
            (snapshot, overloaded)
        })
        .await
        .map_err(|e| Error::Runtime(format!("load sampling task failed: {e}")))
    }

    /// Run the full suite.
    pub async fn run(&self, source: &SubjectSource, observer: &mut dyn SuiteObserver) -> Result<SuiteReport> {
        let mut report = SuiteReport::default();

        if self.config.calibration.samples > 0 {
            let stats = self.calibrate(observer).await?;
            if stats.exceeds(self.config.calibration.warn_threshold_ms) {
                warn!(
                    mean_ms = stats.mean_ms,
                    threshold_ms = self.config.calibration.warn_threshold_ms,
                    "host sleep jitter is high, timing results may be unreliable"
                );
                tokio::time::sleep(Duration::from_secs(self.config.calibration.warn_pause_secs)).await;
            }
            report.calibration = Some(stats);
        }

        let (snapshot, overloaded) = self.load_snapshot().await?;
        if overloaded {
            warn!(
                cpu_percent = snapshot.cpu_percent,
                load_ratio = snapshot.load_ratio(),
                "CPU overloaded, results may be wrong"
            );
        }
        observer.on_load_snapshot(&snapshot, overloaded);

        let subjects = self.resolve_subjects(source, observer).await?;
        let plan = self.plan(&subjects);
        info!(
            subjects = subjects.len(),
            minimum_secs = plan.minimum_duration().as_secs(),
            "starting suite"
        );
        observer.on_suite_start(&plan);

        let output_dir = self
            .config
            .output
            .write_files
            .then(|| self.config.output.dir.clone());
        let supervisor = ProcessSupervisor::new(self.config.liveness.poll_interval(), Arc::clone(&self.load));
        let liveness = LivenessTestRunner::new(supervisor.clone(), output_dir.clone());
        let death_timing = DeathTimingAnalyzer::new(
            supervisor,
            self.config.timestamp_parser()?,
            self.config.death_timing.timeout(),
            output_dir,
        );

        for subject in subjects {
            observer.on_subject_start(&subject);
            let subject_report = self
                .run_subject(&subject, &liveness, &death_timing, observer)
                .await?;
            info!(subject = %subject.name, passed = subject_report.passed(), "subject done");
            report.subjects.push(subject_report);
        }

        Ok(report)
    }

    async fn run_subject(
        &self,
        subject: &Subject,
        liveness: &LivenessTestRunner,
        death_timing: &DeathTimingAnalyzer,
        observer: &mut dyn SuiteObserver,
    ) -> Result<SubjectReport> {
        let cfg = &self.config;
        let mut outcomes = Vec::with_capacity(cfg.liveness.scenarios.len());

        for scenario in &cfg.liveness.scenarios {
            let outcome = liveness
                .run_scenario_with(
                    &subject.binary,
                    scenario,
                    cfg.liveness.repetitions,
                    cfg.liveness.duration(),
                    |repetition, run| observer.on_liveness_run(subject, &scenario.name, repetition, run),
                )
                .await?;
            observer.on_scenario_done(subject, &outcome);
            outcomes.push(outcome);
        }

        let summary = death_timing
            .run_n_trials_with(
                &subject.binary,
                &cfg.death_timing.scenario(),
                cfg.death_timing.trials,
                cfg.death_timing.tolerance_ms,
                |trial, outcome| observer.on_death_trial(subject, trial, outcome),
            )
            .await?;
        observer.on_death_timing_done(subject, &summary);

        Ok(SubjectReport {
            subject: subject.clone(),
            liveness: outcomes,
            death_timing: summary,
        })
    }

    /// Subjects to test, building project variants first when asked.
    pub async fn resolve_subjects(
        &self,
        source: &SubjectSource,
        observer: &mut dyn SuiteObserver,
    ) -> Result<Vec<Subject>> {
        match source {
            SubjectSource::Explicit(paths) => Ok(paths.iter().map(Subject::new).collect()),
            SubjectSource::Project {
                dir,
                selection,
                build,
            } => {
                let mut subjects = Vec::new();
                let mut searched = Vec::new();
                for variant in selection.variants() {
                    if *build {
                        let succeeded = build_variant(variant, dir).await;
                        observer.on_build(variant, &variant.build_dir(dir), succeeded);
                    }
                    let binary = variant.binary(dir);
                    if binary.is_file() {
                        subjects.push(Subject::new(binary));
                    } else {
                        info!(binary = %binary.display(), "subject binary not found, skipping");
                        observer.on_subject_missing(&binary);
                        searched.push(binary);
                    }
                }
                if subjects.is_empty() {
                    return Err(Error::NoSubjects { searched });
                }
                Ok(subjects)
            }
        }
    }

    fn plan(&self, subjects: &[Subject]) -> SuitePlan {
        let cfg = &self.config;
        SuitePlan {
            subjects: subjects.to_vec(),
            scenarios: cfg.liveness.scenarios.iter().map(ToString::to_string).collect(),
            repetitions: cfg.liveness.repetitions,
            duration_secs: cfg.liveness.duration_secs,
            trials: cfg.death_timing.trials,
            tolerance_ms: cfg.death_timing.tolerance_ms,
            expected_offset_ms: cfg.death_timing.expected_offset_ms,
        }
    }
}

/// `make -C <project>/<variant>`. A failed build is logged, never fatal.
async fn build_variant(variant: Variant, project: &Path) -> bool {
    let dir = variant.build_dir(project);
    if !dir.is_dir() {
        info!(dir = %dir.display(), "no build directory, skipping make");
        return false;
    }
    match Command::new("make").arg("-C").arg(&dir).output().await {
        Ok(output) if output.status.success() => {
            info!(variant = %variant, "build succeeded");
            true
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(variant = %variant, status = %output.status, stderr = %stderr.trim(), "build failed");
            false
        }
        Err(e) => {
            warn!(variant = %variant, error = %e, "could not run make");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::Failure;

    #[test]
    fn selection_accepts_names_and_numbers() {
        assert_eq!("all".parse::<VariantSelection>().unwrap(), VariantSelection::All);
        assert_eq!("0".parse::<VariantSelection>().unwrap(), VariantSelection::All);
        assert_eq!("1".parse::<VariantSelection>().unwrap(), VariantSelection::Mandatory);
        assert_eq!("BONUS".parse::<VariantSelection>().unwrap(), VariantSelection::Bonus);
        assert!("3".parse::<VariantSelection>().is_err());
    }

    #[test]
    fn variant_paths() {
        let project = Path::new("/work/philosophers");
        assert_eq!(
            Variant::Mandatory.binary(project),
            PathBuf::from("/work/philosophers/philo/philo")
        );
        assert_eq!(
            Variant::Bonus.build_dir(project),
            PathBuf::from("/work/philosophers/philo_bonus")
        );
    }

    #[test]
    fn subject_name_is_executable_name() {
        assert_eq!(Subject::new("/a/b/philo_bonus").name, "philo_bonus");
    }

    fn subject_report(liveness_passed: bool, death_passed: bool) -> SubjectReport {
        let verdict = |passed: bool| {
            if passed {
                TestVerdict::pass()
            } else {
                TestVerdict::fail(Failure::SpawnFailed {
                    detail: "x".into(),
                })
            }
        };
        SubjectReport {
            subject: Subject::new("philo"),
            liveness: vec![ScenarioOutcome {
                scenario: "even".into(),
                verdict: verdict(liveness_passed),
                runs: vec![],
            }],
            death_timing: DeathTimingSummary {
                reports: vec![],
                mean_deviation_ms: None,
                verdict: verdict(death_passed),
            },
        }
    }

    #[test]
    fn suite_passes_only_when_every_verdict_passes() {
        let mut report = SuiteReport::default();
        assert!(!report.passed(), "an empty suite tested nothing");
        report.subjects.push(subject_report(true, true));
        assert!(report.passed());
        report.subjects.push(subject_report(true, false));
        assert!(!report.passed());
        assert!(!subject_report(false, true).passed());
    }

    #[test]
    fn plan_minimum_duration() {
        let orchestrator = TestOrchestrator::new(HarnessConfig::default());
        let plan = orchestrator.plan(&[Subject::new("philo"), Subject::new("philo_bonus")]);
        // 2 subjects x 2 scenarios x 3 repetitions x 10 s
        assert_eq!(plan.minimum_duration(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn missing_project_binaries_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = TestOrchestrator::new(HarnessConfig::default());
        let source = SubjectSource::Project {
            dir: dir.path().to_path_buf(),
            selection: VariantSelection::All,
            build: true,
        };
        let err = orchestrator
            .resolve_subjects(&source, &mut NoopObserver)
            .await
            .unwrap_err();
        match err {
            Error::NoSubjects { searched } => assert_eq!(searched.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn calibrate_reports_every_sample() {
        struct Count(u32);
        impl SuiteObserver for Count {
            fn on_calibration_sample(&mut self, _: u32, _: u32, _: f64) {
                self.0 += 1;
            }
        }

        let mut config = HarnessConfig::default();
        config.calibration.samples = 3;
        config.calibration.sleep_ms = 1;
        let orchestrator = TestOrchestrator::new(config);
        let mut counter = Count(0);
        let stats = orchestrator.calibrate(&mut counter).await.unwrap();
        assert_eq!(counter.0, 3);
        assert_eq!(stats.samples, 3);
    }
}
