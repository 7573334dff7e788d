//! socrates-core: timing and liveness harness for dining-philosophers programs
//!
//! The subject binary is an opaque subprocess. It is judged only by how long
//! it survives and by the timestamps it prints.
//!
//! # Architecture
//!
//! ```text
//! TestOrchestrator ─┬─► LivenessTestRunner ──┐
//!                   └─► DeathTimingAnalyzer ─┴─► ProcessSupervisor ─► subject
//!                              │                        │
//!                       TimestampParser          SystemLoadMonitor
//! ```
//!
//! # Modules
//!
//! - `calibration`: host sleep-overshoot measurement (delay-o-meter)
//! - `system_load`: CPU utilization and load-average overload check
//! - `supervisor`: spawn, poll, kill and clean up after subjects
//! - `reaper`: name-based sweep of stray subject processes
//! - `timestamp`: strict parsing of subject output lines
//! - `liveness`: endurance scenarios with fail-fast repetitions
//! - `death_timing`: forced-death trials scored against a deadline
//! - `orchestrator`: suite sequencing, build step, reports
//! - `scenario`, `verdict`: scenario and verdict types
//! - `config`, `error`, `logging`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod calibration;
pub mod config;
pub mod death_timing;
pub mod error;
pub mod liveness;
pub mod logging;
pub mod orchestrator;
pub mod reaper;
pub mod scenario;
pub mod supervisor;
pub mod system_load;
pub mod timestamp;
pub mod verdict;

pub use error::{Error, Result};

/// Version of the socrates-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
