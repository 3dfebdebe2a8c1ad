use crate::config::AdminCfg;
use crate::persistence::{SqliteStore, NS_BOTS, NS_GLOBALS};
use crate::scheduler::RELOAD_FLAG;
use crate::types::{now, Bot};
use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flags the scheduler flips as it starts and stops.
#[derive(Clone, Default)]
pub struct EngineHandle {
    pub ready: Arc<AtomicBool>,
    pub started_at: i64,
}

impl EngineHandle {
    pub fn new() -> Self {
        Self { ready: Arc::new(AtomicBool::new(false)), started_at: now() }
    }
}

#[derive(Clone)]
struct AdminState {
    cfg: AdminCfg,
    engine: EngineHandle,
    store: SqliteStore,
}

fn authorized(cfg: &AdminCfg, headers: &HeaderMap) -> bool {
    if !cfg.require_token {
        return true;
    }
    let token = match std::env::var("ADMIN_TOKEN") {
        Ok(t) => t,
        Err(_) => return false,
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    auth == format!("Bearer {}", token)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(st): State<AdminState>) -> StatusCode {
    if st.engine.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(st): State<AdminState>) -> Json<serde_json::Value> {
    let bots = st.store.get_all::<Bot>(NS_BOTS).await.unwrap_or_default();
    let enabled = bots.values().filter(|b| b.enabled).count();
    let public_stats: Option<serde_json::Value> = st
        .store
        .get(NS_GLOBALS, "public_stats")
        .await
        .ok()
        .flatten();
    Json(serde_json::json!({
        "time": now(),
        "started_at": st.engine.started_at,
        "bots": bots.len(),
        "enabled": enabled,
        "strategies": crate::strategy::registry(),
        "public_stats": public_stats,
    }))
}

/// Flip the reload flag; the realtime loop rebuilds its exchange clients
/// and market stores on the next iteration.
async fn reload(headers: HeaderMap, State(st): State<AdminState>) -> StatusCode {
    if !authorized(&st.cfg, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match st.store.put(NS_GLOBALS, RELOAD_FLAG, &true).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "failed to set reload flag");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn metrics() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = vec![];
    let _ = encoder.encode(&metric_families, &mut buf);
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

pub async fn serve(cfg: AdminCfg, engine: EngineHandle, store: SqliteStore) -> Result<()> {
    let st = AdminState { cfg: cfg.clone(), engine, store };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/reload", post(reload))
        .route("/metrics", get(metrics))
        .with_state(st);

    let addr = cfg.bind.parse()?;
    tracing::info!(bind = %cfg.bind, "admin server listening");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
