//! MSwitch harness CLI.
//!
//! Runs the scenario catalog against a binary under test and exits 0 only
//! when every scenario passed.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use msw_common::{LogConfig, init_logging};
use msw_harness::{Harness, HarnessSettings, catalog};
use tracing::info;

#[derive(Parser)]
#[command(name = "msw-harness")]
#[command(author, version, about = "MSwitch scenario harness")]
struct Cli {
    /// Path to the binary under test
    #[arg(long, env = "MSW_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    /// Program used to render fixtures (defaults to the binary under test)
    #[arg(long)]
    encoder: Option<PathBuf>,

    /// Port for the control-plane simulator (0 picks a free port)
    #[arg(long)]
    simulator_port: Option<u16>,

    /// Webhook port passed to the binary under test
    #[arg(long)]
    webhook_port: Option<u16>,

    /// TOML settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Run only the named scenario (repeatable)
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,

    /// List scenarios and exit
    #[arg(long)]
    list: bool,

    /// Keep the scratch directory after the run
    #[arg(long)]
    keep_artifacts: bool,

    /// Write the aggregated report as JSON
    #[arg(long, value_name = "FILE")]
    report_json: Option<PathBuf>,

    /// Duration of each rendered fixture, in seconds
    #[arg(long, value_name = "SECS")]
    fixture_duration: Option<u32>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// File values first, then CLI overrides.
    fn resolve_settings(&self) -> Result<HarnessSettings> {
        let mut settings = match &self.settings {
            Some(path) => HarnessSettings::from_toml_file(path)?,
            None => HarnessSettings::default(),
        };
        if let Some(binary) = &self.ffmpeg {
            settings.binary = binary.clone();
        }
        if let Some(encoder) = &self.encoder {
            settings.encoder = Some(encoder.clone());
        }
        if let Some(port) = self.simulator_port {
            settings.simulator_port = port;
        }
        if let Some(port) = self.webhook_port {
            settings.webhook_port = port;
        }
        if let Some(secs) = self.fixture_duration {
            settings.fixture_duration_secs = secs;
        }
        if !self.only.is_empty() {
            settings.only = self.only.clone();
        }
        settings.keep_artifacts |= self.keep_artifacts;
        settings.validate()?;
        Ok(settings)
    }
}

fn run(cli: &Cli) -> Result<bool> {
    if cli.list {
        for scenario in catalog() {
            println!("{:20} {}", scenario.name, scenario.description);
        }
        return Ok(true);
    }

    let settings = cli.resolve_settings()?;
    let known: Vec<String> = catalog().into_iter().map(|s| s.name).collect();
    if let Some(unknown) = settings.only.iter().find(|name| !known.contains(name)) {
        anyhow::bail!("unknown scenario '{unknown}' (see --list)");
    }

    println!("Starting MSwitch Tests...");
    println!("{}", "=".repeat(50));

    let mut harness = Harness::new(settings).context("setting up harness")?;
    let results = harness.run();
    let summary = results.summarize();
    println!("\n{}", summary.text);

    if let Some(path) = &cli.report_json {
        results
            .write_json(path, &harness.settings().binary, harness.simulator_requests())
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(results.success())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = match init_logging(&log_config) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("warning: logging disabled: {e:#}");
            None
        }
    };

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
