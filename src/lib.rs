//! apiwatch -- anomaly detection for API telemetry.
//!
//! This crate ingests per-request API telemetry, keeps rolling per-endpoint
//! statistics, compares them with historical baselines and opens
//! deduplicated incidents with evidence and an asynchronous RCA report.

pub mod api;
pub mod config;
pub mod detect;
pub mod intake;
pub mod metrics;
pub mod rca;
pub mod scheduler;
pub mod storage;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::AnalyzerConfig;
use crate::detect::baseline::BaselineStore;
use crate::detect::engine::DetectorEngine;
use crate::detect::incident::IncidentLedger;
use crate::detect::schema::SchemaTracker;
use crate::intake::replay::ReplayReport;
use crate::intake::Intake;
use crate::metrics::clock::{Clock, SystemClock};
use crate::metrics::registry::EndpointRegistry;
use crate::rca::dispatch::RcaDispatcher;
use crate::rca::openai::OpenAiGenerator;
use crate::scheduler::{ScanSummary, Scanner};
use crate::storage::Store;

/// Open the configured database.
pub fn open_store(config: &AnalyzerConfig) -> Result<Store> {
    let db_path = config.storage.db_path.to_string_lossy();
    tracing::info!(%db_path, "Initializing database");
    Ok(Store::new(storage::open_pool(&db_path)?))
}

/// Wire the detection side of the pipeline around a shared registry.
pub fn build_scanner(
    config: &AnalyzerConfig,
    registry: Arc<EndpointRegistry>,
    store: Store,
    dispatcher: RcaDispatcher,
    clock: Arc<dyn Clock>,
) -> Scanner {
    Scanner::new(
        registry,
        BaselineStore::new(store.clone()),
        SchemaTracker::new(store.clone()),
        DetectorEngine::new(config.detection.clone()),
        IncidentLedger::new(store, dispatcher, config.scheduler.dedup_window(), clock),
    )
}

fn start_rca(config: &AnalyzerConfig, store: Store, clock: Arc<dyn Clock>) -> Result<(RcaDispatcher, Vec<JoinHandle<()>>)> {
    if config.rca.api_key.is_empty() {
        tracing::warn!("No RCA API key configured, reports will be recorded as SKIPPED");
    }
    let generator = Arc::new(OpenAiGenerator::new(&config.rca, clock.clone())?);
    let (dispatcher, rx) = RcaDispatcher::channel(config.rca.queue_capacity);
    let workers = rca::dispatch::spawn_workers(rx, config.rca.workers, store, generator, clock);
    Ok((dispatcher, workers))
}

/// Start the analyzer daemon: intake API, intake workers, scan loop, RCA workers.
pub async fn serve(config: AnalyzerConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // 1. Initialize Storage
    let store = open_store(&config)?;

    // 2. Windows and intake workers
    let registry = Arc::new(EndpointRegistry::new(config.windows.clone(), clock.clone()));
    let intake = Arc::new(Intake::new(registry.clone()));
    let (events, rx) = intake::worker::channel(config.intake.queue_capacity);
    intake::worker::spawn_workers(intake.clone(), rx, config.intake.workers);

    // 3. RCA workers and scan loop (background tasks)
    let (dispatcher, _rca_workers) = start_rca(&config, store.clone(), clock.clone())?;
    let scanner = Arc::new(build_scanner(&config, registry, store, dispatcher, clock));
    tokio::spawn(scheduler::run_scan_loop(scanner, config.scheduler.interval()));

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .intake
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.intake.bind))?;
    let app = api::router(api::state::AppState { events, intake });

    tracing::info!(%addr, "apiwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    Ok(())
}

/// Feed an NDJSON capture through intake, run one scan, and wait for the
/// RCA reports of any incidents it opened.
pub async fn replay(config: &AnalyzerConfig, file: &Path) -> Result<(ReplayReport, ScanSummary)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(config)?;
    let registry = Arc::new(EndpointRegistry::new(config.windows.clone(), clock.clone()));
    let intake = Intake::new(registry.clone());

    let (dispatcher, rca_workers) = start_rca(config, store.clone(), clock.clone())?;
    let scanner = build_scanner(config, registry, store, dispatcher, clock);

    let file = file.to_path_buf();
    let outcome = tokio::task::spawn_blocking(move || -> Result<_> {
        let report = intake::replay::replay_file(&intake, &file)?;
        let summary = scanner.run_cycle();
        Ok((report, summary))
    })
    .await
    .context("replay task panicked")??;

    // The scanner (and its dispatcher) is gone; workers finish the queue and stop.
    for worker in rca_workers {
        let _ = worker.await;
    }
    Ok(outcome)
}
