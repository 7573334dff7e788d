//! Test verdicts and failure reasons.
//!
//! Failures here are test outcomes, not harness faults: a subject that dies
//! early or reports death late produces a failed [`TestVerdict`], never an
//! [`Error`](crate::Error).

use std::fmt;

use serde::Serialize;

use crate::timestamp::ParseError;

/// Why a test failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The subject exited before the liveness deadline.
    PrematureExit {
        repetition: u32,
        after_ms: u64,
        exit_code: Option<i32>,
    },
    /// A death-timing trial reported its death outside the tolerance.
    TimingDeviationExceeded {
        trial: u32,
        deviation_ms: u64,
        tolerance_ms: u64,
    },
    /// The subject violated the output contract.
    MalformedOutput { trial: u32, detail: String },
    /// A death-timing subject kept running past the trial timeout.
    SubjectDidNotExit { trial: u32, timeout_secs: u64 },
    /// The subject could not be started at all.
    SpawnFailed { detail: String },
}

impl Failure {
    pub(crate) fn malformed(trial: u32, err: &ParseError) -> Self {
        Self::MalformedOutput {
            trial,
            detail: err.to_string(),
        }
    }

    /// Short machine-friendly label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PrematureExit { .. } => "premature_exit",
            Self::TimingDeviationExceeded { .. } => "timing_deviation_exceeded",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::SubjectDidNotExit { .. } => "subject_did_not_exit",
            Self::SpawnFailed { .. } => "spawn_failed",
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrematureExit {
                repetition,
                after_ms,
                exit_code,
            } => {
                write!(f, "premature exit after {after_ms} ms (repetition {repetition}")?;
                match exit_code {
                    Some(code) => write!(f, ", exit code {code})"),
                    None => write!(f, ", killed by signal)"),
                }
            }
            Self::TimingDeviationExceeded {
                trial,
                deviation_ms,
                tolerance_ms,
            } => write!(
                f,
                "death reported {deviation_ms} ms off the deadline in trial {trial} (tolerance {tolerance_ms} ms)"
            ),
            Self::MalformedOutput { trial, detail } => {
                write!(f, "malformed output in trial {trial}: {detail}")
            }
            Self::SubjectDidNotExit {
                trial,
                timeout_secs,
            } => write!(
                f,
                "subject still running {timeout_secs} s into trial {trial}"
            ),
            Self::SpawnFailed { detail } => write!(f, "could not start subject: {detail}"),
        }
    }
}

/// Terminal outcome of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestVerdict {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl TestVerdict {
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            passed: true,
            failure: None,
        }
    }

    #[must_use]
    pub const fn fail(failure: Failure) -> Self {
        Self {
            passed: false,
            failure: Some(failure),
        }
    }

    /// Human-readable failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }
}

/// Fold verdicts into one pass/fail flag.
pub fn all_passed<'a>(verdicts: impl IntoIterator<Item = &'a TestVerdict>) -> bool {
    verdicts.into_iter().all(|v| v.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_has_no_reason() {
        let verdict = TestVerdict::pass();
        assert!(verdict.passed);
        assert_eq!(verdict.reason(), None);
    }

    #[test]
    fn premature_exit_reason_mentions_timing() {
        let verdict = TestVerdict::fail(Failure::PrematureExit {
            repetition: 2,
            after_ms: 1004,
            exit_code: Some(0),
        });
        assert!(!verdict.passed);
        assert_eq!(
            verdict.reason().unwrap(),
            "premature exit after 1004 ms (repetition 2, exit code 0)"
        );
    }

    #[test]
    fn deviation_reason_mentions_tolerance() {
        let failure = Failure::TimingDeviationExceeded {
            trial: 0,
            deviation_ms: 25,
            tolerance_ms: 10,
        };
        assert_eq!(failure.kind(), "timing_deviation_exceeded");
        assert!(failure.to_string().contains("25 ms"));
        assert!(failure.to_string().contains("tolerance 10 ms"));
    }

    #[test]
    fn malformed_wraps_parse_error() {
        let failure = Failure::malformed(3, &ParseError::EmptyOutput);
        assert_eq!(failure.kind(), "malformed_output");
        assert!(failure.to_string().contains("no output"));
    }

    #[test]
    fn fold_requires_every_verdict() {
        let verdicts = [
            TestVerdict::pass(),
            TestVerdict::fail(Failure::SpawnFailed {
                detail: "nope".into(),
            }),
        ];
        assert!(!all_passed(&verdicts));
        assert!(all_passed(&verdicts[..1]));
        assert!(all_passed(std::iter::empty()));
    }

    #[test]
    fn verdict_serializes_failure_kind() {
        let verdict = TestVerdict::fail(Failure::SubjectDidNotExit {
            trial: 1,
            timeout_secs: 10,
        });
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"passed\":false"));
        assert!(json.contains("\"kind\":\"subject_did_not_exit\""));
        let pass = serde_json::to_string(&TestVerdict::pass()).unwrap();
        assert_eq!(pass, "{\"passed\":true}");
    }
}
