use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tradefleet::admin::{self, EngineHandle};
use tradefleet::config::AppConfig;
use tradefleet::events::EventBus;
use tradefleet::observability::init_tracing;
use tradefleet::persistence::SqliteStore;
use tradefleet::scheduler::Scheduler;

fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(&cfg.observability)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.scheduler.rt_threads.max(2))
        .enable_all()
        .build()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: AppConfig) -> Result<()> {
    let store = SqliteStore::open(&cfg.persistence.sqlite_path).await?;
    let bus = EventBus::new();
    let engine = EngineHandle::new();

    let admin_handle = {
        let admin_cfg = cfg.admin.clone();
        let engine = engine.clone();
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(admin_cfg, engine, store).await {
                tracing::error!(error = ?e, "admin server failed");
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = Scheduler::new(cfg, store, bus);
    // /readyz reports ready once the first realtime pass completes.
    scheduler.ready = engine.ready.clone();
    let scheduler = Arc::new(scheduler);

    let sched_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(shutdown_rx).await {
                tracing::error!(error = ?e, "scheduler terminated with error");
            }
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::warn!("ctrl_c received; initiating shutdown");
        }
        _ = sched_handle => {
            tracing::warn!("scheduler task ended; shutting down");
        }
    }

    engine.ready.store(false, std::sync::atomic::Ordering::Relaxed);
    let _ = shutdown_tx.send(true);
    admin_handle.abort();
    Ok(())
}
