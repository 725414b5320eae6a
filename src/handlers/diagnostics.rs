use crate::{auth::auth, models::{DiagnosticsResponse, ErrorResponse, Principal}, state::AppState};
use axum::{extract::{Extension, State}, http::StatusCode, Json};
use parking_lot::Mutex;
use std::sync::OnceLock;
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Connection, room and broker counters plus host load
pub async fn diagnostics(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {
    auth::ensure_admin(&principal)?;

    let stats = state.registry.stats();
    let n_loaded_docs = state.engine.loaded_count() as u32;
    let n_subscribed_docs = state.subscriptions.subscribed_count() as u32;
    let broker_health = state.bridge.health();

    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let mut sys = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all())).lock();
        sys.refresh_cpu();
        sys.refresh_memory();
        (
            sys.global_cpu_info().cpu_usage(),
            sys.used_memory(),
            sys.free_memory(),
            sys.total_memory(),
        )
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}, Broker: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.total_connections,
        stats.active_rooms,
        broker_health
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn: stats.total_connections as u32,
            n_rooms: stats.active_rooms as u32,
            n_users: stats.distinct_users as u32,
            n_loaded_docs,
            n_subscribed_docs,
            n_broker_topics: state.bridge.subscription_count() as u32,
            broker_health: broker_health.to_string(),
            broker_fallback: state.bridge.is_fallback(),
            metrics: state.metrics.snapshot(),
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
