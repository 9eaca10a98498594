//! CLI entrypoint for the evthread stress harness.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use evthread_harness::{Scenario, ScenarioConfig, ScenarioReport};

/// Stress and conformance scenarios for evthread.
#[derive(Debug, Parser)]
#[command(name = "evthread-harness")]
#[command(about = "Stress and conformance scenarios for evthread")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single scenario.
    Run {
        scenario: Scenario,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Run every scenario in order.
    All {
        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Rounds per scenario (threads to start for spawn_smoke).
    #[arg(long, default_value_t = 1000)]
    iterations: u64,
    /// Reader threads for writer_progress.
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Per-scenario wait bound in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    /// JSONL output path (if omitted, prints to stdout).
    #[arg(long)]
    output: Option<PathBuf>,
}

impl RunOpts {
    fn config(&self) -> ScenarioConfig {
        ScenarioConfig {
            iterations: self.iterations,
            threads: self.threads,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn write_reports(reports: &[ScenarioReport], output: Option<&PathBuf>) -> std::io::Result<()> {
    let mut lines = String::new();
    for report in reports {
        lines.push_str(&report.to_jsonl().map_err(std::io::Error::other)?);
        lines.push('\n');
    }
    match output {
        Some(path) => std::fs::write(path, lines),
        None => std::io::stdout().lock().write_all(lines.as_bytes()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (scenarios, opts) = match cli.command {
        Command::Run { scenario, opts } => (vec![scenario], opts),
        Command::All { opts } => (Scenario::ALL.to_vec(), opts),
    };

    let config = opts.config();
    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        eprintln!("Running {}", scenario.name());
        reports.push(scenario.run(&config)?);
    }
    write_reports(&reports, opts.output.as_ref())?;

    let failed: Vec<_> = reports
        .iter()
        .filter(|r| !r.passed())
        .map(|r| r.scenario.as_str())
        .collect();
    if !failed.is_empty() {
        eprintln!("FAILED: {}", failed.join(", "));
        std::process::exit(1);
    }
    Ok(())
}
