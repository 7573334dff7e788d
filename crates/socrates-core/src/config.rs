//! Harness configuration.
//!
//! One immutable [`HarnessConfig`] is built at startup (TOML file, then
//! command-line overrides), validated, and handed by reference to every
//! component. Every section is optional; missing keys take the defaults
//! below.
//!
//! ```toml
//! [liveness]
//! repetitions = 3
//! duration_secs = 10
//! poll_interval_ms = 300
//!
//! [[liveness.scenarios]]
//! name = "even"
//! args = "4 311 150 150"
//!
//! [death_timing]
//! trials = 10
//! tolerance_ms = 10
//! args = "3 310 200 100"
//! expected_offset_ms = 310
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationConfig;
use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use crate::scenario::{SubjectArgs, TestScenario};
use crate::system_load::LoadConfig;
use crate::timestamp::TimestampParser;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub liveness: LivenessConfig,
    pub death_timing: DeathTimingConfig,
    pub output: OutputConfig,
    pub calibration: CalibrationConfig,
    pub load: LoadConfig,
    pub logging: LogConfig,
}

/// Endurance tests: the subject must stay alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Independent runs per scenario; all must pass.
    pub repetitions: u32,
    /// Required uninterrupted survival time.
    pub duration_secs: u64,
    /// Polling tick, 1..=1000 ms.
    pub poll_interval_ms: u64,
    pub scenarios: Vec<TestScenario>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            repetitions: 3,
            duration_secs: 10,
            poll_interval_ms: 300,
            scenarios: default_scenarios(),
        }
    }
}

fn default_scenarios() -> Vec<TestScenario> {
    vec![
        TestScenario::survive(
            "even",
            SubjectArgs {
                philosophers: 4,
                time_to_die_ms: 311,
                time_to_eat_ms: 150,
                time_to_sleep_ms: 150,
                max_meals: None,
            },
        ),
        TestScenario::survive(
            "odd",
            SubjectArgs {
                philosophers: 5,
                time_to_die_ms: 600,
                time_to_eat_ms: 150,
                time_to_sleep_ms: 150,
                max_meals: None,
            },
        ),
    ]
}

impl LivenessConfig {
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Precision tests: one forced death, reported near a known deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeathTimingConfig {
    pub trials: u32,
    /// Largest accepted deviation per trial.
    pub tolerance_ms: u64,
    /// Arguments forcing exactly one starvation.
    pub args: SubjectArgs,
    /// When the death is expected, in ms from the subject's own start.
    pub expected_offset_ms: u64,
    /// Shape the last output line must have.
    pub death_pattern: String,
    /// Kill a trial subject that is still running after this long.
    pub timeout_secs: u64,
}

impl Default for DeathTimingConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            tolerance_ms: 10,
            args: SubjectArgs {
                philosophers: 3,
                time_to_die_ms: 310,
                time_to_eat_ms: 200,
                time_to_sleep_ms: 100,
                max_meals: None,
            },
            expected_offset_ms: 310,
            death_pattern: r"\d+\s+died".to_string(),
            timeout_secs: 10,
        }
    }
}

impl DeathTimingConfig {
    /// The forced-death scenario these settings describe.
    #[must_use]
    pub fn scenario(&self) -> TestScenario {
        TestScenario::death_near("death_timing", self.args, self.expected_offset_ms)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Subject output handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Regex between a line's timestamp and its message.
    pub separator_pattern: String,
    /// Where per-test output files go.
    pub dir: PathBuf,
    pub write_files: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            separator_pattern: r"\s".to_string(),
            dir: PathBuf::from("test_output"),
            write_files: true,
        }
    }
}

impl HarnessConfig {
    /// Load and validate a TOML config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and compile every pattern once.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidValue {
            field,
            reason: reason.to_string(),
        };

        if self.liveness.repetitions == 0 {
            return Err(invalid("liveness.repetitions", "must be at least 1"));
        }
        if self.liveness.duration_secs == 0 {
            return Err(invalid("liveness.duration_secs", "must be at least 1"));
        }
        if !(1..=1000).contains(&self.liveness.poll_interval_ms) {
            return Err(invalid(
                "liveness.poll_interval_ms",
                "must be between 1 and 1000",
            ));
        }
        if self.death_timing.trials == 0 {
            return Err(invalid("death_timing.trials", "must be at least 1"));
        }
        if self.death_timing.timeout_secs == 0 {
            return Err(invalid("death_timing.timeout_secs", "must be at least 1"));
        }
        if self.load.cpu_percent_threshold <= 0.0 || self.load.load_ratio_threshold <= 0.0 {
            return Err(invalid("load", "thresholds must be positive"));
        }
        self.timestamp_parser()?;
        Ok(())
    }

    /// Compiled separator and death-line patterns.
    pub fn timestamp_parser(&self) -> std::result::Result<TimestampParser, ConfigError> {
        let separator = compile("output.separator_pattern", &self.output.separator_pattern)?;
        let death = compile("death_timing.death_pattern", &self.death_timing.death_pattern)?;
        Ok(TimestampParser::new(separator, death))
    }
}

fn compile(field: &'static str, pattern: &str) -> std::result::Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::scenario::ExpectedOutcome;

    #[test]
    fn default_config_is_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.liveness.repetitions, 3);
        assert_eq!(config.liveness.poll_interval_ms, 300);
        assert_eq!(config.death_timing.trials, 10);
        assert_eq!(config.death_timing.tolerance_ms, 10);
        assert_eq!(config.death_timing.args.to_string(), "3 310 200 100");
        assert_eq!(config.output.separator_pattern, r"\s");
        assert!(config.output.write_files);
    }

    #[test]
    fn default_scenarios_cover_both_parities() {
        let scenarios = HarnessConfig::default().liveness.scenarios;
        assert!(scenarios.iter().any(TestScenario::is_even));
        assert!(scenarios.iter().any(|s| !s.is_even()));
        assert!(
            scenarios
                .iter()
                .all(|s| s.expected == ExpectedOutcome::MustSurvive)
        );
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = HarnessConfig::from_toml_str("").unwrap();
        assert_eq!(config.liveness.duration_secs, 10);
        assert_eq!(config.liveness.scenarios.len(), 2);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [liveness]
            repetitions = 1

            [[liveness.scenarios]]
            name = "tight"
            args = "4 410 200 200"

            [death_timing]
            tolerance_ms = 5
            args = "2 400 100 100 7"
            "#,
        )
        .unwrap();
        assert_eq!(config.liveness.repetitions, 1);
        assert_eq!(config.liveness.duration_secs, 10);
        assert_eq!(config.liveness.scenarios.len(), 1);
        assert_eq!(config.liveness.scenarios[0].args.time_to_die_ms, 410);
        assert_eq!(config.death_timing.tolerance_ms, 5);
        assert_eq!(config.death_timing.args.max_meals, Some(7));
        assert_eq!(config.death_timing.trials, 10);
    }

    #[test]
    fn bad_scenario_args_fail_parse() {
        let err = HarnessConfig::from_toml_str("[death_timing]\nargs = \"3 310\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn poll_interval_range_is_enforced() {
        let err = HarnessConfig::from_toml_str("[liveness]\npoll_interval_ms = 1500\n").unwrap_err();
        assert!(err.to_string().contains("liveness.poll_interval_ms"));
        let err = HarnessConfig::from_toml_str("[liveness]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("liveness.poll_interval_ms"));
    }

    #[test]
    fn zero_repetitions_rejected() {
        let mut config = HarnessConfig::default();
        config.liveness.repetitions = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "liveness.repetitions",
                ..
            })
        ));
    }

    #[test]
    fn invalid_separator_pattern_rejected() {
        let mut config = HarnessConfig::default();
        config.output.separator_pattern = "[".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern {
                field: "output.separator_pattern",
                ..
            })
        ));
    }

    #[test]
    fn death_scenario_carries_offset() {
        let scenario = DeathTimingConfig::default().scenario();
        assert_eq!(
            scenario.expected,
            ExpectedOutcome::MustReportDeathNear { offset_ms: 310 }
        );
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let err = HarnessConfig::load_from(Path::new("/nonexistent/socrates.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socrates.toml");
        std::fs::write(&path, "[output]\nwrite_files = false\n").unwrap();
        let config = HarnessConfig::load_from(&path).unwrap();
        assert!(!config.output.write_files);
    }
}
