//! dmatmul CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use dmatmul::config::cli::{Cli, ExecutionMode};
use dmatmul::config::{cli_convert, toml as config_toml, validator, Config, OutputConfig};
use dmatmul::distributed::{Coordinator, RegistryEvent, RoundError, RoundReport, SessionSettings, WorkerSession};
use dmatmul::output::{json, text};
use log::{error, info, warn};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    println!("dmatmul v{}", env!("CARGO_PKG_VERSION"));
    println!("Distributed matrix multiplication");
    println!();

    let config = build_config(&cli)?;
    validator::validate_config(&config).context("Configuration validation failed")?;
    if cli.debug {
        print!("{}", config);
    }

    match cli.mode {
        ExecutionMode::Coordinator => run_coordinator(&cli, config),
        ExecutionMode::Worker => run_worker(config),
    }
}

fn setup_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Load the TOML file if given, then apply CLI overrides
fn build_config(cli: &Cli) -> Result<Config> {
    let base = match cli.config {
        Some(ref path) => config_toml::parse_toml_file(path)?,
        None => Config::default(),
    };
    config_toml::merge_cli_with_config(cli, base)
}

/// Run in worker mode until Ctrl-C
fn run_worker(config: Config) -> Result<()> {
    let settings = SessionSettings::from_config(&config.worker)?;
    let session = WorkerSession::new(settings)?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(session.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    }))
}

/// Run in coordinator mode
fn run_coordinator(cli: &Cli, config: Config) -> Result<()> {
    let shape = cli_convert::parse_shape(&cli.size).context("Invalid --size")?;
    let wait = cli_convert::parse_duration(&cli.wait).context("Invalid --wait")?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut coordinator = Coordinator::with_observer(config.coordinator.clone(), events_tx);
        tokio::spawn(print_worker_events(events_rx));

        let addr = coordinator.start().await.context("Failed to start coordinator")?;
        println!("Listening for workers on {}", addr);
        println!();

        let session = async {
            if cli.interactive {
                run_console(&coordinator, &config.output, shape).await
            } else {
                run_rounds(&coordinator, &config.output, cli, shape, wait).await
            }
        };

        let result = tokio::select! {
            result = session => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                Ok(())
            }
        };

        coordinator.shutdown();
        result
    })
}

async fn print_worker_events(mut events: UnboundedReceiver<RegistryEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::Connected { id, addr } => println!("+ worker {} connected from {}", id, addr),
            RegistryEvent::Removed { id, addr } => println!("- worker {} ({}) gone", id, addr),
        }
    }
}

/// Wait for workers, then run the requested rounds
async fn run_rounds(
    coordinator: &Coordinator,
    output: &OutputConfig,
    cli: &Cli,
    (rows, cols): (usize, usize),
    wait: Duration,
) -> Result<()> {
    info!("Waiting up to {:?} for {} worker(s)", wait, cli.min_workers);
    if !coordinator.wait_for_workers(cli.min_workers, wait).await {
        anyhow::bail!(
            "Only {} of {} worker(s) connected within {:?}",
            coordinator.current_worker_count(),
            cli.min_workers,
            wait
        );
    }

    let mut failed_rounds = 0;
    for round in 1..=cli.rounds {
        println!("Round {}/{}: {}x{} * {}x{}", round, cli.rounds, rows, cols, cols, rows);
        let outcome = coordinator.trigger_computation(rows, cols).await;
        if !report_outcome(outcome, output, round, cli.rounds)? {
            failed_rounds += 1;
        }
    }

    if failed_rounds > 0 {
        anyhow::bail!("{} of {} round(s) did not complete", failed_rounds, cli.rounds);
    }
    Ok(())
}

/// Print a round outcome and write its JSON report
///
/// Returns whether the round completed.
fn report_outcome(
    outcome: std::result::Result<RoundReport, RoundError>,
    output: &OutputConfig,
    round: usize,
    total: usize,
) -> Result<bool> {
    let (json_output, complete) = match outcome {
        Ok(report) => {
            text::print_round_report(&report, output.preview);
            (json::JsonRoundOutput::from_report(&report), true)
        }
        Err(RoundError::PartialRoundFailure(partial)) => {
            text::print_partial_failure(&partial, output.preview);
            (json::JsonRoundOutput::from_partial(&partial), false)
        }
        Err(e) => {
            warn!("Round {} failed: {}", round, e);
            return Ok(false);
        }
    };

    if let Some(ref path) = output.json_output {
        let path = json::round_output_path(path, round, total);
        json::write_round_json(&path, &json_output, true)?;
        println!("JSON report written to {}", path.display());
    }
    Ok(complete)
}

const CONSOLE_HELP: &str = "\
Commands:
  ready        arm the next round and stop announcing
  go [RxC]     run a round (default size from --size)
  workers      show connected worker count
  stats        show per-worker timing from the last round
  help         show this help
  quit         shut down";

/// Operator console on stdin
async fn run_console(coordinator: &Coordinator, output: &OutputConfig, default_shape: (usize, usize)) -> Result<()> {
    println!("{}", CONSOLE_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut round = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let mut words = line.split_whitespace();
        match words.next() {
            None => continue,
            Some("ready") => {
                coordinator.arm_round();
                println!("Armed with {} worker(s)", coordinator.current_worker_count());
            }
            Some("go") => {
                let (rows, cols) = match words.next() {
                    Some(size) => match cli_convert::parse_shape(size) {
                        Ok(shape) => shape,
                        Err(e) => {
                            println!("{:#}", e);
                            continue;
                        }
                    },
                    None => default_shape,
                };
                round += 1;
                let outcome = coordinator.trigger_computation(rows, cols).await;
                if let Err(e) = report_outcome(outcome, output, round, usize::MAX) {
                    error!("Failed to report round {}: {:#}", round, e);
                }
            }
            Some("workers") => println!(
                "{} worker(s) connected{}",
                coordinator.current_worker_count(),
                if coordinator.is_armed() { " (armed)" } else { "" }
            ),
            Some("stats") => text::print_worker_stats(&coordinator.per_worker_stats()),
            Some("help") => println!("{}", CONSOLE_HELP),
            Some("quit") | Some("exit") => break,
            Some(other) => println!("Unknown command {:?}; type help", other),
        }
    }
    Ok(())
}
