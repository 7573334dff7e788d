//! socrates - timing and liveness harness for dining-philosophers programs
//!
//! ```bash
//! # Build and test both variants of a project
//! socrates test ~/philosophers
//!
//! # Only the bonus variant, 5 repetitions of 20 s each
//! socrates test ~/philosophers -p bonus -n 5 -t 20
//!
//! # Test a binary directly
//! socrates test --subject ./philo
//!
//! # Measure host sleep jitter / host load
//! socrates calibrate
//! socrates load
//! ```
//!
//! Exit codes: 0 when every test passed, 1 otherwise, 130 on Ctrl-C.

mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use socrates_core::config::HarnessConfig;
use socrates_core::logging::{LogFormat, init_logging};
use socrates_core::orchestrator::{
    SubjectSource, SuiteObserver, TestOrchestrator, VariantSelection,
};

use crate::report::ConsoleReporter;

/// Exit code for a run aborted with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "socrates")]
#[command(about = "Timing and liveness harness for dining-philosophers programs")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "SOCRATES_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "SOCRATES_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Also append log lines to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the liveness and death-timing suite
    Test(TestArgs),

    /// Measure how much this host overshoots a sleep
    Calibrate {
        /// Number of samples
        #[arg(long)]
        samples: Option<u32>,

        /// Requested pause per sample, in milliseconds
        #[arg(long)]
        sleep_ms: Option<u64>,
    },

    /// Print one host load reading
    Load,
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Project directory containing philo/ and philo_bonus/
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Variant to test: all, philo, bonus (or 0, 1, 2)
    #[arg(short, long, default_value = "all")]
    philo: VariantSelection,

    /// Test this binary instead of a project (repeatable)
    #[arg(long, conflicts_with = "philo")]
    subject: Vec<PathBuf>,

    /// Do not run make before testing
    #[arg(long)]
    no_build: bool,

    /// Liveness repetitions per scenario
    #[arg(short = 'n', long)]
    repetitions: Option<u32>,

    /// Liveness duration in seconds
    #[arg(short = 't', long)]
    duration: Option<u64>,

    /// Liveness polling tick in milliseconds (1-1000)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Number of death-timing trials
    #[arg(long)]
    trials: Option<u32>,

    /// Largest accepted death-timing deviation in milliseconds
    #[arg(long)]
    tolerance_ms: Option<u64>,

    /// Expected death time in milliseconds from the subject's start
    #[arg(long)]
    expected_offset_ms: Option<u64>,

    /// Regex separating a line's timestamp from its message
    #[arg(long)]
    separator: Option<String>,

    /// Delay-o-meter samples (0 skips calibration)
    #[arg(long)]
    calibration_samples: Option<u32>,

    /// Directory for per-test subject output
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Do not write subject output files
    #[arg(long)]
    no_output_files: bool,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl TestArgs {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(n) = self.repetitions {
            config.liveness.repetitions = n;
        }
        if let Some(secs) = self.duration {
            config.liveness.duration_secs = secs;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.liveness.poll_interval_ms = ms;
        }
        if let Some(n) = self.trials {
            config.death_timing.trials = n;
        }
        if let Some(ms) = self.tolerance_ms {
            config.death_timing.tolerance_ms = ms;
        }
        if let Some(ms) = self.expected_offset_ms {
            config.death_timing.expected_offset_ms = ms;
        }
        if let Some(separator) = &self.separator {
            config.output.separator_pattern.clone_from(separator);
        }
        if let Some(samples) = self.calibration_samples {
            config.calibration.samples = samples;
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir.clone_from(dir);
        }
        if self.no_output_files {
            config.output.write_files = false;
        }
    }

    fn source(&self) -> SubjectSource {
        if self.subject.is_empty() {
            SubjectSource::Project {
                dir: self.path.clone(),
                selection: self.philo,
                build: !self.no_build,
            }
        } else {
            SubjectSource::Explicit(self.subject.clone())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    match &cli.command {
        Commands::Test(args) => args.apply(&mut config),
        Commands::Calibrate { samples, sleep_ms } => {
            if let Some(samples) = samples {
                config.calibration.samples = *samples;
            }
            if let Some(ms) = sleep_ms {
                config.calibration.sleep_ms = *ms;
            }
        }
        Commands::Load => {}
    }

    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(file) = &cli.log_file {
        config.logging.file = Some(file.clone());
    }

    config.validate().map_err(socrates_core::Error::from)?;
    Ok(config)
}

async fn dispatch(cli: Cli, config: HarnessConfig) -> anyhow::Result<ExitCode> {
    let orchestrator = TestOrchestrator::new(config);

    match cli.command {
        Commands::Test(args) => {
            let mut reporter = ConsoleReporter::new(args.json);
            let source = args.source();
            tokio::select! {
                result = orchestrator.run(&source, &mut reporter) => {
                    let report = result?;
                    reporter.finish(&report)?;
                    Ok(if report.passed() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, aborting run");
                    Ok(ExitCode::from(EXIT_INTERRUPTED))
                }
            }
        }
        Commands::Calibrate { .. } => {
            let mut reporter = ConsoleReporter::new(false);
            orchestrator.calibrate(&mut reporter).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Load => {
            let (snapshot, overloaded) = orchestrator.load_snapshot().await?;
            let mut reporter = ConsoleReporter::new(false);
            reporter.on_load_snapshot(&snapshot, overloaded);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    init_logging(&config.logging).context("initializing logging")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let code = runtime.block_on(dispatch(cli, config));
    // Blocking sweeps may still be running after an interrupt.
    runtime.shutdown_timeout(Duration::from_secs(2));
    code
}

fn print_error(err: &anyhow::Error) {
    eprintln!("{} {err:#}", console::style("error:").red().bold());
    let remediation = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<socrates_core::Error>())
        .and_then(socrates_core::Error::remediation);
    if let Some(remediation) = remediation {
        eprint!("{}", remediation.render_plain());
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            print_error(&err);
            ExitCode::FAILURE
        }
    }
}
