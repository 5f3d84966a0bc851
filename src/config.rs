//! Engine and feed configuration.
//!
//! Every knob is an explicit struct with a `Default`; services receive their
//! config by value at construction, never through globals.

use crate::margin_curve::MarginCurve;
use crate::position::MarginRates;
use crate::types::Bps;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Market-order slippage charged against the taker.
    pub slippage: Bps,
    /// Reference ticks older than this cannot price an execution.
    pub max_tick_age_secs: i64,
    pub margin_rates: MarginRates,
    pub margin_curve: MarginCurve,
    /// Maximum number of audit events retained in memory.
    pub max_events: usize,
    /// Cadence of the full MTM sweep run by the service loop.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slippage: Bps::new(10),
            max_tick_age_secs: 30,
            margin_rates: MarginRates::default(),
            margin_curve: MarginCurve::default(),
            max_events: 100_000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Trading-session window in UTC minutes of day. Outside it, upstream
/// silence is expected rather than a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionHours {
    pub open_minute: u32,
    pub close_minute: u32,
}

impl SessionHours {
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        let minute = now.hour() * 60 + now.minute();
        if self.open_minute <= self.close_minute {
            minute < self.open_minute || minute >= self.close_minute
        } else {
            // overnight session
            minute < self.open_minute && minute >= self.close_minute
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Pending subscribes flush as one upstream call after this window.
    pub batch_window: Duration,
    /// Unsubscribes are delayed this long to absorb churn.
    pub unsubscribe_grace: Duration,
    /// First reconnect backoff step.
    pub reconnect_base: Duration,
    /// Backoff ceiling.
    pub reconnect_max: Duration,
    /// Consecutive failures before the circuit breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker holds before allowing another attempt.
    pub breaker_cooldown: Duration,
    pub session_hours: Option<SessionHours>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(50),
            unsubscribe_grace: Duration::from_secs(5),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(32),
            failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            session_hours: None,
        }
    }
}
