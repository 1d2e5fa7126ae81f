//! Program Updater - Main entry point
//!
//! Applies one update manifest and exits: 0 when done, 1 on failure, 2 when
//! cancelled.

use anyhow::Result;
use clap::Parser;
use program_updater::process::SystemProcessController;
use program_updater::report::{EventBus, TracingReporter};
use program_updater::shutdown::ShutdownCoordinator;
use program_updater::transport::DefaultTransport;
use program_updater::{utils, Config, OrchestratorOptions, UpdateOrchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Manifest URL or path (overrides config)
    #[arg(value_name = "LOCATOR")]
    locator: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print progress, log and state events to stdout as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, args.json)?;

    let locator = args
        .locator
        .clone()
        .unwrap_or_else(|| config.updater.manifest.clone());

    tracing::info!(
        "Starting program-updater v{} (manifest: {})",
        env!("CARGO_PKG_VERSION"),
        program_updater::transport::redact(&locator)
    );

    // Ctrl+C / SIGTERM cancel the run; the orchestrator rolls back.
    let cancel = CancellationToken::new();
    let watcher = ShutdownCoordinator::new(cancel.clone()).spawn();

    let transport = Arc::new(DefaultTransport::new(config.transport_options()));
    let processes = Arc::new(SystemProcessController::new(config.grace_period()));
    let orchestrator = UpdateOrchestrator::new(transport, processes)
        .with_options(OrchestratorOptions::from(&config))
        .with_cancel(cancel);

    let mut printers = Vec::new();
    let orchestrator = if args.json {
        let bus = Arc::new(EventBus::new());
        printers.push(print_events(&bus));
        printers.push(forward_states(&bus, &orchestrator));
        orchestrator.with_reporter(bus)
    } else {
        orchestrator.with_reporter(Arc::new(TracingReporter))
    };

    let outcome = orchestrator.run(&locator).await;
    watcher.abort();

    // Dropping the orchestrator closes the event bus and ends the printers.
    drop(orchestrator);
    for printer in printers {
        let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
    }

    let code = match outcome {
        Ok(summary) => {
            tracing::info!(
                "Update complete: {} downloaded, {} up to date, {} replaced",
                summary.downloaded,
                summary.skipped,
                summary.replaced
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            tracing::warn!("Update cancelled; previous version restored");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!("Update failed: {}", e);
            ExitCode::FAILURE
        }
    };

    Ok(code)
}

/// Write every bus event to stdout as one JSON line.
fn print_events(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(mut line) = serde_json::to_vec(&event) else {
                        continue;
                    };
                    line.push(b'\n');
                    if stdout.write_all(&line).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event printer lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Publish run state changes on the bus.
fn forward_states(bus: &Arc<EventBus>, orchestrator: &UpdateOrchestrator) -> JoinHandle<()> {
    let bus = bus.clone();
    let mut states = orchestrator.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            bus.publish_state(state);
        }
    })
}
