use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use rand::Rng;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tasksched::{Priority, Scheduler, SchedulerConfig, StatsSnapshot, TaskEvent, TaskSpec};
use tokio::sync::broadcast;

mod cli;

use cli::Cli;
use cli::commands::{Commands, SimulateArgs};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tasksched")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("tasksched.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn run_application(cli: &Cli, config: SchedulerConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Simulate(args) => handle_simulate_command(args, config, cli.is_verbose()),
        Commands::Config => handle_config_command(&config),
    }
}

fn handle_config_command(config: &SchedulerConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to render config")?;
    print!("{}", yaml);
    Ok(())
}

fn handle_simulate_command(args: &SimulateArgs, mut config: SchedulerConfig, verbose: bool) -> Result<()> {
    if !(0.0..=1.0).contains(&args.fail_rate) {
        eyre::bail!("--fail-rate must be between 0 and 1, got {}", args.fail_rate);
    }
    if args.min_ms > args.max_ms {
        eyre::bail!("--min-ms ({}) exceeds --max-ms ({})", args.min_ms, args.max_ms);
    }
    if let Some(max) = args.max_concurrency {
        config.max_concurrency = max;
    }

    info!("Simulating {} tasks with {:?}", args.tasks, config);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start Tokio runtime")?;
    let stats = runtime.block_on(simulate(args, config, verbose))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats).context("Failed to encode stats")?);
    } else {
        print_summary(&stats);
    }
    Ok(())
}

async fn simulate(args: &SimulateArgs, config: SchedulerConfig, verbose: bool) -> Result<StatsSnapshot> {
    let scheduler = Scheduler::new(config).context("Failed to create scheduler")?;
    let printer = (verbose && !args.json).then(|| tokio::spawn(print_events(scheduler.subscribe())));
    let mut rng = rand::rng();

    for i in 0..args.tasks {
        let priority = args.priority.unwrap_or_else(|| match rng.random_range(0..3) {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        });
        let spec = simulated_task(args.min_ms, args.max_ms, args.fail_rate)
            .with_id(format!("sim-{:03}", i))
            .with_priority(priority)
            .with_tag(format!("batch-{}", i % 3));
        let spec = if i % 2 == 0 { spec.retry_on_fail() } else { spec };
        scheduler.enqueue(spec).context("Failed to enqueue task")?;
    }

    let mut cancel_tag = args.cancel_tag.clone();
    let report_every = Duration::from_millis(args.report_ms.max(1));

    loop {
        let stats = scheduler.stats();
        if !args.json {
            print_progress(&stats);
        }
        if stats.active() == 0 {
            break;
        }

        if let Some(tag) = cancel_tag.take() {
            let count = scheduler.cancel_by_tag(&tag);
            if !args.json {
                println!("{} {} task(s) tagged '{}'", "Cancelled".red(), count, tag);
            }
        }

        tokio::time::sleep(report_every).await;
    }

    scheduler.shutdown().await;
    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(scheduler.stats())
}

/// Print each task's terminal event as it happens.
async fn print_events(mut events: broadcast::Receiver<TaskEvent>) {
    loop {
        match events.recv().await {
            Ok(event) if event.is_terminal() => {
                let outcome = match &event {
                    TaskEvent::Completed { .. } => "completed".green(),
                    TaskEvent::Failed { .. } => "failed".red(),
                    _ => "cancelled".yellow(),
                };
                println!("{} {} {}", "[event]".dimmed(), event.task_id(), outcome);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Event printer lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// An attempt that sleeps for a random duration, then fails with `fail_rate`.
fn simulated_task(min_ms: u64, max_ms: u64, fail_rate: f64) -> TaskSpec {
    TaskSpec::new(move |token| async move {
        let (delay, fails) = {
            let mut rng = rand::rng();
            (rng.random_range(min_ms..=max_ms), rng.random_bool(fail_rate))
        };

        tokio::select! {
            _ = token.cancelled() => eyre::bail!("cancelled"),
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }

        if fails {
            eyre::bail!("simulated failure after {}ms", delay);
        }
        Ok(())
    })
}

fn print_progress(stats: &StatsSnapshot) {
    println!(
        "{} running={} queued={} (high={} normal={} low={}) pressure={}",
        "[tick]".dimmed(),
        stats.running.to_string().cyan(),
        stats.queued.to_string().cyan(),
        stats.by_priority.high,
        stats.by_priority.normal,
        stats.by_priority.low,
        stats.memory_pressure,
    );
}

fn print_summary(stats: &StatsSnapshot) {
    println!("{}", "Simulation finished".green().bold());
    println!("  {:<10} {}", "completed", stats.completed.to_string().green());
    println!("  {:<10} {}", "failed", stats.failed.to_string().red());
    println!("  {:<10} {}", "cancelled", stats.cancelled.to_string().yellow());
    println!("  {:<10} {}", "retried", stats.retried);
    println!("  {:<10} {}", "settled", stats.settled());
}

fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = SchedulerConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, config).context("Application failed")?;

    Ok(())
}
