//! # Instance Bench - Main Entry Point
//!
//! The `run` subcommand performs these steps:
//! 1. **Initialize logging**: colorized terminal output, optional plain log file
//! 2. **Parse arguments**: benchmark spec and engine settings from the command line
//! 3. **Build collaborators**: provider client, workload and results manager
//! 4. **Run the benchmark**: the runner provisions, measures and cleans up
//! 5. **Print the report**: rendered report on stdout, logs on stderr
//!
//! `parse` walks a directory of persisted captures and prints one CSV line
//! per capture, without touching any instance.
//!
//! Ctrl-C cancels a running benchmark. The runner still destroys every
//! instance it created before the process exits.

use anyhow::{Context, Result};
use clap::Parser;
use instance_bench::{
    benchmark::{BenchmarkRunner, BenchmarkSpec, RunnerConfig},
    cli::{Args, Command, ParseArgs, RunArgs},
    cloud::{AwsCliClient, AwsCliConfig},
    logging::{level_directive, ColorizedFormatter},
    results::{self, ResultsManager},
    workloads::{self, WorkloadOptions},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Must stay alive until exit or buffered file logs are lost.
    let _guard = init_logging(&args)?;
    debug!("Configuration: {:?}", args);

    match &args.command {
        Command::Run(run) => run_benchmark(run).await,
        Command::Parse(parse) => parse_captures(parse),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `-v` and `-q`.
fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(args.verbose, args.quiet)));

    let terminal = fmt::layer()
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run_benchmark(args: &RunArgs) -> Result<()> {
    let spec = BenchmarkSpec::from_args(args)?;
    let config = RunnerConfig::from_args(args)?;
    info!("Starting Instance Bench {}", instance_bench::VERSION);
    info!("\n{}", spec);

    let client = Arc::new(AwsCliClient::new(AwsCliConfig {
        region: args.region.clone(),
        profile: args.profile.clone(),
        key_name: args.key_name.clone(),
        ssh_user: args.ssh_user.clone(),
        ssh_key: args.ssh_key.clone(),
        ..AwsCliConfig::default()
    }));
    let workload = workloads::for_kind(
        spec.kind,
        &WorkloadOptions {
            runtime: args.runtime,
            random_io: args.random,
        },
    );

    let mut results_manager = if args.no_save {
        None
    } else {
        let manager = ResultsManager::new(&args.log_dir, &spec).with_context(|| {
            format!("Failed to create results directory under {}", args.log_dir.display())
        })?;
        info!("Saving captures to {}", manager.directory().display());
        Some(manager)
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up");
            on_signal.cancel();
        }
    });

    let mut runner = BenchmarkRunner::new(client, workload, spec, config);
    let results = runner.run(results_manager.as_mut(), &cancel).await?;

    print!("{}", results.rendered);
    info!(
        "Benchmark {} finished in {:.1}s",
        results.run_id,
        results.duration.as_secs_f64()
    );
    Ok(())
}

fn parse_captures(args: &ParseArgs) -> Result<()> {
    let found = results::discover(&args.directory)
        .with_context(|| format!("Failed to read {}", args.directory.display()))?;

    let mut failed = 0;
    for capture in &found {
        match capture.csv_line(&args.directory) {
            Some(line) => println!("{}", line),
            None => failed += 1,
        }
    }
    if failed > 0 {
        warn!("{} of {} captures could not be parsed", failed, found.len());
    }
    Ok(())
}
