use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use audit_ledger::AuditLedger;
use config_rs::ControllerSettings;
use once_cell::sync::Lazy;
use remediation_controller::logging::init_logging;
use remediation_controller::{
    Collaborators, Controller, ControllerConfig, ExecutionRequest, InMemoryExecutionEngine, InMemoryRequestStore,
    LedgerAuditSink, LifecycleConfig, LifecycleManager, LogNotifier, Notifier, RequestStore, SystemClock,
    WebhookNotifier,
};
use tokio::sync::watch;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Lazy::force(&START_TIME);
    let once = std::env::args().any(|a| a == "--once");

    let settings = ControllerSettings::from_env();
    settings.validate().context("invalid controller settings")?;
    init_logging(&settings.log_level, settings.log_json)?;

    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryRequestStore::new());
    if let Some(path) = &settings.requests_path {
        let seeded = seed_requests(store.as_ref(), path).await?;
        tracing::info!(count = seeded, path = %path.display(), "seeded execution requests");
    }

    let engine = Arc::new(
        InMemoryExecutionEngine::new(clock.clone()).with_auto_complete(settings.simulated_job_duration),
    );

    let ledger_path = settings.audit_ledger_path.clone();
    let ledger = tokio::task::spawn_blocking(move || AuditLedger::open(ledger_path))
        .await?
        .with_context(|| format!("opening audit ledger {}", settings.audit_ledger_path.display()))?;
    tracing::info!(path = %ledger.path().display(), "audit ledger opened");

    let notifier: Arc<dyn Notifier> = match &settings.notification_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), settings.notification_timeout)?),
        None => Arc::new(LogNotifier),
    };

    let manager = LifecycleManager::new(
        Collaborators {
            store,
            engine,
            audit: Arc::new(LedgerAuditSink::new(Arc::new(ledger))),
            notifier,
            clock,
        },
        LifecycleConfig::from(&settings),
    );
    let controller = Controller::new(Arc::new(manager), ControllerConfig::from(&settings));

    if once {
        let summary = controller.run_once().await?;
        tracing::info!(?summary, "single pass finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await;
    tracing::info!(uptime_secs = START_TIME.elapsed().as_secs(), "shutdown complete");
    Ok(())
}

/// Load a JSON array of requests into the store.
async fn seed_requests(store: &dyn RequestStore, path: &Path) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let requests: Vec<ExecutionRequest> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let count = requests.len();
    for request in requests {
        let key = request.key();
        store
            .create(request)
            .await
            .with_context(|| format!("seeding request {}", key))?;
    }
    Ok(count)
}
