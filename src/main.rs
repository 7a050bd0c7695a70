//! Custodian service entry point.
//!
//! Wires the store, rails, and one reconciliation worker per enabled
//! core, then runs until interrupted. Rail adapters for real nodes and
//! processors are injected by the deployment; the bundled mock keeps
//! local runs and tests self-contained.

use std::sync::Arc;

use tokio::sync::watch;

use custodian::ledger::LedgerStore;
use custodian::notify::LogNotifier;
use custodian::rail::{MockRail, Rail};
use custodian::reconciler::{CoreContext, CoreWorker, FlatRates};
use custodian::{AppConfig, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::args().nth(1).unwrap_or_else(|| "default".into());
    let config = AppConfig::load(&env);
    let _guard = custodian::logging::init_logging(&config);

    tracing::info!(env = %env, cores = config.cores.len(), "Custodian starting");

    let db = Database::connect(&config.postgres_url).await?;
    let store = LedgerStore::new(db.pool().clone());
    store.ensure_schema().await?;

    let notifier = Arc::new(LogNotifier);
    let rates = Arc::new(FlatRates);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    for core_cfg in config.cores.iter().filter(|c| c.enabled) {
        let core = store
            .upsert_core(
                &core_cfg.name,
                &core_cfg.core_type,
                core_cfg.rail_kind,
                core_cfg.min_confirms,
            )
            .await?;

        // Deployment-specific rail clients replace this mock
        let fee_asset = store
            .assets_for_core_type(&core_cfg.core_type)
            .await?
            .first()
            .map(|a| a.id)
            .unwrap_or(1);
        let rail: Arc<dyn Rail> = Arc::new(MockRail::new(core_cfg.rail_kind, fee_asset));
        tracing::warn!(core = %core.name, "No rail client configured; using the mock rail");

        let ctx = Arc::new(CoreContext {
            core_name: core.name.clone(),
            store: store.clone(),
            rail,
            notifier: notifier.clone(),
            rates: rates.clone(),
            timings: core_cfg.timings(),
        });
        workers.push(CoreWorker::spawn(ctx, shutdown_rx.clone()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for worker in workers {
        worker.join().await;
    }
    tracing::info!("Custodian stopped");
    Ok(())
}
