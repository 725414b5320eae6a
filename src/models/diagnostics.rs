use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::metrics::MetricsSnapshot;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_conn: u32,
    pub n_rooms: u32,
    pub n_users: u32,
    pub n_loaded_docs: u32,
    pub n_subscribed_docs: u32,
    pub n_broker_topics: u32,
    pub broker_health: String,
    pub broker_fallback: bool,
    pub metrics: MetricsSnapshot,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
