//! Error types for socrates-core

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;

use crate::timestamp::ParseError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Main error type for socrates-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Subject output violates the line contract
    #[error("Malformed subject output: {0}")]
    MalformedOutput(#[from] ParseError),

    /// The subject binary could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process table could not be scanned or a signal could not be sent
    #[error("Process table error: {0}")]
    ProcessTable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// None of the subject binaries to test exist
    #[error("No subject binary found (looked for {})", display_paths(.searched))]
    NoSubjects { searched: Vec<PathBuf> },

    /// Runtime errors (blocking task failures and similar)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::MalformedOutput(_) => Some(
                Remediation::new(
                    "Make the subject print `<timestamp> <id> <message>` lines, one per event.",
                )
                .alternative("Set output.separator_pattern if the timestamp is followed by a tab.")
                .alternative("Make sure the death line is the last line the subject prints."),
            ),
            Self::Spawn { program, .. } => Some(
                Remediation::new(format!(
                    "Check that {} exists and is executable.",
                    program.display()
                ))
                .command("Inspect", format!("ls -l {}", program.display()))
                .alternative("Build the project first, or drop --no-build."),
            ),
            Self::ProcessTable(_) => Some(
                Remediation::new("Check that the process table is readable (procfs mounted).")
                    .command("Processes", "ps -e")
                    .alternative("Kill leftover subject processes by hand before retrying."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the output directory exists and is writable."),
            ),
            Self::NoSubjects { searched } => {
                let mut remediation =
                    Remediation::new("Build the project, or point --subject at a binary.");
                for path in searched {
                    if let Some(dir) = path.parent() {
                        remediation =
                            remediation.command("Build", format!("make -C {}", dir.display()));
                    }
                }
                Some(remediation.alternative("Drop --no-build so the harness runs make itself."))
            }
            Self::Runtime(_) => None,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A pattern option is not a valid regular expression
    #[error("Invalid pattern for {field}: {source}")]
    InvalidPattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    /// A scenario argument string does not follow the subject invocation contract
    #[error("Invalid scenario arguments {args:?}: {reason}")]
    InvalidScenario { args: String, reason: String },

    /// A value is out of its accepted range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { path, .. } => Remediation::new(format!(
                "Check that {} exists and is readable.",
                path.display()
            ))
            .command("Inspect", format!("ls -l {}", path.display())),
            Self::Parse(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Remove unknown keys; every section is optional."),
            Self::InvalidPattern { field, .. } => {
                Remediation::new(format!("Use a valid regular expression for {field}."))
                    .alternative(r"The default separator is `\s` (any whitespace).")
            }
            Self::InvalidScenario { .. } => Remediation::new(
                "Use `<philosophers> <time_to_die> <time_to_eat> <time_to_sleep> [meals]`.",
            )
            .alternative("Every value must be a positive integer."),
            Self::InvalidValue { field, .. } => {
                Remediation::new(format!("Adjust {field} in the config or on the command line."))
            }
        }
    }
}
