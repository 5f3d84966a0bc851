//! Health surface for operational tooling.

use crate::feed::{FeedHealth, FeedSupervisor, SessionState};
use crate::types::Timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub active_symbol_count: usize,
    pub active_symbols: Vec<String>,
    pub ref_counts: Vec<(String, u32)>,
    pub session: SessionState,
    pub health: FeedHealth,
    pub breaker_open: bool,
    pub ticks_seen: u64,
    pub heartbeat_age_secs: Option<i64>,
}

pub fn health_snapshot(
    supervisor: &FeedSupervisor,
    wall_clock: DateTime<Utc>,
    now: Timestamp,
) -> HealthSnapshot {
    let active_symbols = supervisor.active_symbols();
    HealthSnapshot {
        active_symbol_count: active_symbols.len(),
        active_symbols,
        ref_counts: supervisor.ref_counts(),
        session: supervisor.session_state(),
        health: supervisor.health(wall_clock),
        breaker_open: supervisor.breaker_open(),
        ticks_seen: supervisor.ticks_seen(),
        heartbeat_age_secs: supervisor.heartbeat_age_secs(now),
    }
}
