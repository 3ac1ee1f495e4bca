//! CLI Entry Point for daq-multiread
//!
//! Runs a multi reader against simulated sources and prints every completed
//! cycle (or every update, in concurrent mode) as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! daq_multiread --config config/multiread.toml --cycles 5
//! daq_multiread --source A --source B --source C --latency-ms 20
//! ```

use anyhow::Result;
use clap::Parser;
use daq_multiread::config::{MultiReadConfig, DEFAULT_CONFIG_PATH};
use daq_multiread::mock::MockReaderFactory;
use daq_multiread::{logging, MultiReadEvent, MultiReader, ReadCoordinator, ReadMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq_multiread")]
#[command(about = "Multi-source read coordination against simulated readers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Replace the configured sources
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Number of cycles (or updates, in concurrent mode) to print
    #[arg(long, default_value = "3")]
    cycles: usize,

    /// Simulated read latency
    #[arg(long, default_value = "10")]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MultiReadConfig::load_from(&cli.config)?;
    if !cli.sources.is_empty() {
        config.reader.sources = cli.sources;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let factory = MockReaderFactory::new()
        .responding(Duration::from_millis(cli.latency_ms))
        .with_polling();
    let coordinator = ReadCoordinator::from_config(&config, Arc::new(factory))?;
    let mode = coordinator.mode();
    info!(
        ?mode,
        period_ms = config.reader.period_ms,
        sources = ?coordinator.sources(),
        "starting multi reader"
    );

    let reader = MultiReader::spawn(coordinator)?;
    let mut events = reader.subscribe();
    if mode.is_sequential() {
        reader.start_read().await?;
    }

    let mut printed = 0;
    while printed < cli.cycles {
        match events.recv().await {
            Ok(MultiReadEvent::CycleComplete(results)) => {
                println!("{}", serde_json::to_string(&results)?);
                printed += 1;
                if mode == ReadMode::SequentialManual && printed < cli.cycles {
                    reader.start_read().await?;
                }
            }
            Ok(MultiReadEvent::Update(result)) if mode == ReadMode::Concurrent => {
                println!("{}", serde_json::to_string(&result)?);
                printed += 1;
            }
            Ok(MultiReadEvent::Update(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    reader.shutdown().await?;
    Ok(())
}
