//! # Loadbench - Main Entry Point
//!
//! The binary performs these key operations:
//! 1. **Parse arguments**: Processes command-line configuration
//! 2. **Initialize logging**: Console and optional file output via tracing
//! 3. **Create benchmark config**: Converts CLI args to a validated config
//! 4. **Run**: Executes one run until the duration elapses or Ctrl-C
//! 5. **Write results**: Optional JSON results document
//!
//! ## Exit Codes
//!
//! - `0`: run completed
//! - `1`: run failed (warm-up probe failed, output could not be written, ...)
//! - `2`: invalid configuration

use anyhow::Result;
use clap::Parser;
use loadbench::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::Args,
    logging,
    results::{ReportStream, ResultsManager},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so the non-blocking file writer is flushed.
    let log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    info!("Starting Loadbench v{}", loadbench::VERSION);

    let config = match BenchmarkConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            drop(log_guard);
            std::process::exit(2);
        }
    };

    let mut runner = BenchmarkRunner::new(config)?;
    if let Some(path) = &args.streaming_output {
        info!("Streaming interval reports to: {:?}", path);
        runner = runner.with_report_stream(ReportStream::create(path)?);
    }
    // Interval reports are only held in memory when a results file wants them.
    if args.output_file.is_some() {
        runner = runner.with_interval_history();
    }

    let results = match runner.run().await {
        Ok(results) => results,
        Err(e) => {
            error!("Benchmark failed: {:#}", e);
            return Err(e);
        }
    };

    if let Some(path) = &args.output_file {
        ResultsManager::new(path).finalize(&results)?;
    }

    info!("Loadbench completed successfully");
    Ok(())
}
