//! Timestamp extraction from subject output lines.
//!
//! Every line a subject prints looks like `<timestamp><sep><id> <message>`,
//! for example `00000310 1 died`. The timestamp is milliseconds since the
//! subject's own start; zero padding and NUL padding are tolerated.
//!
//! This is the only place where untrusted subject output is turned into
//! numbers, so every deviation from the line shape is a [`ParseError`]
//! rather than a best-effort value.

use regex::Regex;
use thiserror::Error;

/// NUL padding some subjects emit around their timestamps.
const NUL: char = '\0';

/// The subject output violated the line contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The subject printed nothing at all.
    #[error("subject printed no output")]
    EmptyOutput,

    /// The separator pattern does not occur in the line.
    #[error("separator not found in line {line:?}")]
    SeparatorNotFound { line: String },

    /// The text before the separator is not a non-negative integer.
    #[error("invalid timestamp {prefix:?} in line {line:?}")]
    InvalidTimestamp { prefix: String, line: String },

    /// The status message does not start with an agent identifier.
    #[error("no agent identifier after the timestamp in line {line:?}")]
    MissingAgentId { line: String },

    /// The final line is not a death announcement.
    #[error("last line is not a death announcement: {line:?}")]
    NotDeathAnnouncement { line: String },
}

/// Extract the timestamp at the start of `line`.
///
/// The timestamp is the text before the first match of `separator`, with
/// NUL padding stripped from both ends. The remainder must start with an
/// integer agent identifier, so `"0000100 3 died"` yields `100` while
/// `"3 died"` is rejected.
pub fn parse_timestamp(line: &str, separator: &Regex) -> Result<u64, ParseError> {
    let Some(sep) = separator.find(line) else {
        return Err(ParseError::SeparatorNotFound {
            line: line.to_string(),
        });
    };

    let prefix = line[..sep.start()].trim_matches(NUL);
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidTimestamp {
            prefix: prefix.to_string(),
            line: line.to_string(),
        });
    }
    let timestamp = prefix
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidTimestamp {
            prefix: prefix.to_string(),
            line: line.to_string(),
        })?;

    let message = line[sep.end()..].trim_start_matches(NUL).trim_start();
    let agent_id = message
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or_default();
    if agent_id.is_empty() || !agent_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::MissingAgentId {
            line: line.to_string(),
        });
    }

    Ok(timestamp)
}

/// Compiled parsing rules for a run: separator and death-announcement shape.
#[derive(Debug, Clone)]
pub struct TimestampParser {
    separator: Regex,
    death_pattern: Regex,
}

impl TimestampParser {
    /// Build a parser from already-validated patterns.
    #[must_use]
    pub fn new(separator: Regex, death_pattern: Regex) -> Self {
        Self {
            separator,
            death_pattern,
        }
    }

    /// Timestamp of any output line.
    pub fn timestamp(&self, line: &str) -> Result<u64, ParseError> {
        parse_timestamp(line, &self.separator)
    }

    /// Timestamp of a death announcement; other lines are rejected.
    pub fn death_timestamp(&self, line: &str) -> Result<u64, ParseError> {
        if !self.death_pattern.is_match(line) {
            return Err(ParseError::NotDeathAnnouncement {
                line: line.to_string(),
            });
        }
        self.timestamp(line)
    }

    /// Split captured output into its first and last lines.
    ///
    /// Trailing NUL padding and trailing newlines are dropped first; the
    /// last line is the last non-blank one.
    pub fn first_and_last_lines<'a>(&self, output: &'a str) -> Result<(&'a str, &'a str), ParseError> {
        let trimmed = output.trim_end_matches(|c: char| c == NUL || c == '\n' || c == '\r');
        let mut lines = trimmed.lines().filter(|l| !l.trim_matches(NUL).trim().is_empty());
        let first = lines.next().ok_or(ParseError::EmptyOutput)?;
        let last = lines.next_back().unwrap_or(first);
        Ok((first, last))
    }
}
