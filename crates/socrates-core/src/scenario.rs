//! Test scenarios and the subject invocation contract.
//!
//! Subjects are invoked as
//! `<philosopher_count> <time_to_die_ms> <time_to_eat_ms> <time_to_sleep_ms> [max_meals]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Positional arguments passed to a subject binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectArgs {
    pub philosophers: u32,
    pub time_to_die_ms: u64,
    pub time_to_eat_ms: u64,
    pub time_to_sleep_ms: u64,
    pub max_meals: Option<u32>,
}

impl SubjectArgs {
    /// Argument vector in invocation order.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.philosophers.to_string(),
            self.time_to_die_ms.to_string(),
            self.time_to_eat_ms.to_string(),
            self.time_to_sleep_ms.to_string(),
        ];
        if let Some(meals) = self.max_meals {
            args.push(meals.to_string());
        }
        args
    }
}

impl fmt::Display for SubjectArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

impl FromStr for SubjectArgs {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidScenario {
            args: s.to_string(),
            reason,
        };

        let tokens = shlex::split(s).ok_or_else(|| invalid("unbalanced quoting".to_string()))?;
        if !(4..=5).contains(&tokens.len()) {
            return Err(invalid(format!("expected 4 or 5 values, got {}", tokens.len())));
        }

        let mut values = Vec::with_capacity(tokens.len());
        for token in &tokens {
            let value: u64 = token
                .parse()
                .map_err(|_| invalid(format!("{token:?} is not a positive integer")))?;
            if value == 0 {
                return Err(invalid(format!("{token:?} must be positive")));
            }
            values.push(value);
        }

        let narrow = |v: u64| u32::try_from(v).map_err(|_| invalid(format!("{v} is too large")));
        Ok(Self {
            philosophers: narrow(values[0])?,
            time_to_die_ms: values[1],
            time_to_eat_ms: values[2],
            time_to_sleep_ms: values[3],
            max_meals: values.get(4).copied().map(narrow).transpose()?,
        })
    }
}

impl TryFrom<String> for SubjectArgs {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubjectArgs> for String {
    fn from(args: SubjectArgs) -> Self {
        args.to_string()
    }
}

/// What a scenario expects the subject to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedOutcome {
    /// Nobody dies; the subject must keep running.
    MustSurvive,
    /// Exactly one philosopher starves, reported near `offset_ms` after start.
    MustReportDeathNear { offset_ms: u64 },
}

/// A named, fixed argument set with its expected outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestScenario {
    pub name: String,
    pub args: SubjectArgs,
    #[serde(default = "default_expected")]
    pub expected: ExpectedOutcome,
}

fn default_expected() -> ExpectedOutcome {
    ExpectedOutcome::MustSurvive
}

impl TestScenario {
    #[must_use]
    pub fn survive(name: impl Into<String>, args: SubjectArgs) -> Self {
        Self {
            name: name.into(),
            args,
            expected: ExpectedOutcome::MustSurvive,
        }
    }

    #[must_use]
    pub fn death_near(name: impl Into<String>, args: SubjectArgs, offset_ms: u64) -> Self {
        Self {
            name: name.into(),
            args,
            expected: ExpectedOutcome::MustReportDeathNear { offset_ms },
        }
    }

    /// True when the philosopher count is even.
    #[must_use]
    pub fn is_even(&self) -> bool {
        self.args.philosophers % 2 == 0
    }
}

impl fmt::Display for TestScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_values() {
        let args: SubjectArgs = "4 311 150 150".parse().unwrap();
        assert_eq!(args.philosophers, 4);
        assert_eq!(args.time_to_die_ms, 311);
        assert_eq!(args.time_to_eat_ms, 150);
        assert_eq!(args.time_to_sleep_ms, 150);
        assert_eq!(args.max_meals, None);
        assert_eq!(args.to_args(), ["4", "311", "150", "150"]);
    }

    #[test]
    fn parses_optional_meal_count() {
        let args: SubjectArgs = "5 800 200 200 7".parse().unwrap();
        assert_eq!(args.max_meals, Some(7));
        assert_eq!(args.to_string(), "5 800 200 200 7");
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!("4 311 150".parse::<SubjectArgs>().is_err());
        assert!("4 311 150 150 3 9".parse::<SubjectArgs>().is_err());
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert!("0 311 150 150".parse::<SubjectArgs>().is_err());
        assert!("4 abc 150 150".parse::<SubjectArgs>().is_err());
        assert!("4 -311 150 150".parse::<SubjectArgs>().is_err());
    }

    #[test]
    fn parity_follows_philosopher_count() {
        let even = TestScenario::survive("even", "4 311 150 150".parse().unwrap());
        let odd = TestScenario::survive("odd", "5 600 150 150".parse().unwrap());
        assert!(even.is_even());
        assert!(!odd.is_even());
    }

    #[test]
    fn scenario_serde_uses_argument_string() {
        let scenario = TestScenario::survive("even", "4 311 150 150".parse().unwrap());
        let json = serde_json::to_string(&scenario).unwrap();
        assert!(json.contains("\"args\":\"4 311 150 150\""));
        let parsed: TestScenario = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, scenario);
    }

    #[test]
    fn scenario_expected_defaults_to_survive() {
        let parsed: TestScenario =
            serde_json::from_str(r#"{"name":"odd","args":"5 600 150 150"}"#).unwrap();
        assert_eq!(parsed.expected, ExpectedOutcome::MustSurvive);
    }
}
