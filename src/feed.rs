//! Feed supervisor: owns the scarce upstream subscription resource.
//!
//! Subscriptions are reference counted per symbol. The first reference puts
//! the symbol into a pending batch that flushes as a single upstream call
//! after a short window, so navigation storms do not turn into per-symbol
//! request storms. The last reference does not unsubscribe immediately: the
//! symbol is parked behind a grace timer, and a re-subscribe inside the
//! grace cancels the timer with no upstream traffic at all.
//!
//! Timers are explicit: each symbol entry stores its pending unsubscribe
//! task handle, and cancel-and-reschedule is done on that handle directly.
//! Timer work never blocks callers of add/remove.

use crate::config::FeedConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("Upstream rejected request: {0}")]
    Upstream(String),

    #[error("Upstream connection lost")]
    ConnectionLost,
}

/// The real-time vendor session. Implementations queue the request onto the
/// wire; tests record it.
pub trait UpstreamFeed: Send + Sync + 'static {
    fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError>;
    fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reported health, never a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FeedHealth {
    Normal,
    /// Upstream is quiet inside a known closed market window.
    ExpectedSilence,
    Degraded,
}

struct SymbolEntry {
    count: u32,
    pending_unsubscribe: Option<JoinHandle<()>>,
}

struct Inner {
    symbols: HashMap<String, SymbolEntry>,
    pending_batch: Vec<String>,
    batch_task: Option<JoinHandle<()>>,
    session: SessionState,
    consecutive_failures: u32,
    breaker_open_until: Option<Instant>,
}

pub struct FeedSupervisor {
    config: FeedConfig,
    upstream: Arc<dyn UpstreamFeed>,
    inner: Arc<Mutex<Inner>>,
    ticks_seen: AtomicU64,
    last_tick_at: AtomicI64,
}

impl FeedSupervisor {
    pub fn new(config: FeedConfig, upstream: Arc<dyn UpstreamFeed>) -> Arc<Self> {
        Arc::new(Self {
            config,
            upstream,
            inner: Arc::new(Mutex::new(Inner {
                symbols: HashMap::new(),
                pending_batch: Vec::new(),
                batch_task: None,
                session: SessionState::Disconnected,
                consecutive_failures: 0,
                breaker_open_until: None,
            })),
            ticks_seen: AtomicU64::new(0),
            last_tick_at: AtomicI64::new(0),
        })
    }

    /// Ref-counted bulk subscribe, the surface page sessions call.
    pub fn subscribe(self: &Arc<Self>, symbols: &[impl AsRef<str>]) {
        for symbol in symbols {
            self.add_subscription(symbol.as_ref());
        }
    }

    /// Ref-counted bulk unsubscribe.
    pub fn unsubscribe(self: &Arc<Self>, symbols: &[impl AsRef<str>]) {
        for symbol in symbols {
            self.remove_subscription(symbol.as_ref());
        }
    }

    /// Take one reference on `symbol`. Idempotent against churn: a pending
    /// unsubscribe is cancelled instead of issuing any upstream call.
    pub fn add_subscription(self: &Arc<Self>, symbol: &str) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .symbols
            .entry(symbol.to_string())
            .or_insert(SymbolEntry {
                count: 0,
                pending_unsubscribe: None,
            });

        let cancelled_grace = match entry.pending_unsubscribe.take() {
            Some(handle) => {
                handle.abort();
                debug!(symbol, "cancelled pending unsubscribe");
                true
            }
            None => false,
        };
        entry.count += 1;

        // still subscribed upstream if a grace timer was parked on it
        if entry.count == 1 && !cancelled_grace {
            inner.pending_batch.push(symbol.to_string());
            if inner.batch_task.is_none() {
                let supervisor = self.clone();
                let window = self.config.batch_window;
                inner.batch_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    supervisor.flush_batch();
                }));
            }
        }
    }

    /// Drop one reference on `symbol`. The upstream unsubscribe is delayed by
    /// the grace period; a symbol still waiting in the subscribe batch is
    /// simply pulled back out with no upstream traffic either way.
    pub fn remove_subscription(self: &Arc<Self>, symbol: &str) {
        let mut inner = self.inner.lock().unwrap();
        match inner.symbols.get_mut(symbol) {
            Some(entry) if entry.count > 0 => {
                entry.count -= 1;
                if entry.count > 0 {
                    return;
                }
            }
            _ => return,
        }

        if let Some(pos) = inner.pending_batch.iter().position(|s| s == symbol) {
            // never reached upstream; forget it entirely
            inner.pending_batch.remove(pos);
            inner.symbols.remove(symbol);
            return;
        }

        let supervisor = self.clone();
        let grace = self.config.unsubscribe_grace;
        let symbol_owned = symbol.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            supervisor.finish_unsubscribe(&symbol_owned);
        });
        if let Some(entry) = inner.symbols.get_mut(symbol) {
            entry.pending_unsubscribe = Some(handle);
        }
    }

    fn finish_unsubscribe(&self, symbol: &str) {
        let still_idle = {
            let mut inner = self.inner.lock().unwrap();
            match inner.symbols.get(symbol) {
                Some(entry) if entry.count == 0 => {
                    inner.symbols.remove(symbol);
                    true
                }
                _ => false,
            }
        };
        if still_idle {
            debug!(symbol, "grace expired, unsubscribing upstream");
            if let Err(err) = self.upstream.unsubscribe(&[symbol.to_string()]) {
                warn!(symbol, %err, "upstream unsubscribe failed");
                self.record_failure();
            }
        }
    }

    /// Force the pending subscribe batch out now. Used at shutdown and after
    /// reconnect.
    pub fn flush_pending(&self) {
        self.flush_batch();
    }

    fn flush_batch(&self) {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = inner.batch_task.take() {
                task.abort();
            }
            std::mem::take(&mut inner.pending_batch)
        };
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "flushing subscribe batch");
        if let Err(err) = self.upstream.subscribe(&batch) {
            warn!(%err, "upstream subscribe failed");
            // put the symbols back so the next flush retries them
            let mut inner = self.inner.lock().unwrap();
            inner.pending_batch.extend(batch);
            drop(inner);
            self.record_failure();
        }
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut symbols: Vec<String> = inner
            .symbols
            .iter()
            .filter(|(_, entry)| entry.count > 0)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn ref_count(&self, symbol: &str) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.symbols.get(symbol).map_or(0, |entry| entry.count)
    }

    pub fn ref_counts(&self) -> Vec<(String, u32)> {
        let inner = self.inner.lock().unwrap();
        let mut counts: Vec<(String, u32)> = inner
            .symbols
            .iter()
            .filter(|(_, entry)| entry.count > 0)
            .map(|(symbol, entry)| (symbol.clone(), entry.count))
            .collect();
        counts.sort();
        counts
    }

    // --- connection health -------------------------------------------------

    pub fn connection_established(&self) {
        let active = {
            let mut inner = self.inner.lock().unwrap();
            inner.session = SessionState::Connected;
            inner.consecutive_failures = 0;
            inner.breaker_open_until = None;
            inner
                .symbols
                .iter()
                .filter(|(_, entry)| entry.count > 0)
                .map(|(symbol, _)| symbol.clone())
                .collect::<Vec<_>>()
        };
        info!(symbols = active.len(), "feed session established");
        // re-sync the active set; a fresh session knows nothing
        if !active.is_empty() {
            if let Err(err) = self.upstream.subscribe(&active) {
                warn!(%err, "resubscribe after reconnect failed");
                self.record_failure();
            }
        }
    }

    pub fn connection_lost(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.session = SessionState::Disconnected;
        }
        self.record_failure();
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold
            && inner.breaker_open_until.is_none()
        {
            inner.breaker_open_until = Some(Instant::now() + self.config.breaker_cooldown);
            warn!(
                failures = inner.consecutive_failures,
                "feed circuit breaker opened"
            );
        }
    }

    pub fn breaker_open(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.breaker_open_until {
            Some(until) if Instant::now() >= until => {
                // cooldown elapsed, allow the next attempt
                inner.breaker_open_until = None;
                inner.consecutive_failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.lock().unwrap().session
    }

    pub fn health(&self, now: DateTime<Utc>) -> FeedHealth {
        if self.breaker_open() {
            return FeedHealth::Degraded;
        }
        match self.session_state() {
            SessionState::Connected => FeedHealth::Normal,
            _ => match self.config.session_hours {
                Some(hours) if hours.is_closed(now) => FeedHealth::ExpectedSilence,
                _ => FeedHealth::Degraded,
            },
        }
    }

    // --- tick throughput ---------------------------------------------------

    pub fn record_tick(&self, at: crate::types::Timestamp) {
        self.ticks_seen.fetch_add(1, Ordering::Relaxed);
        self.last_tick_at.store(at.as_secs(), Ordering::Relaxed);
    }

    pub fn ticks_seen(&self) -> u64 {
        self.ticks_seen.load(Ordering::Relaxed)
    }

    pub fn heartbeat_age_secs(&self, now: crate::types::Timestamp) -> Option<i64> {
        match self.last_tick_at.load(Ordering::Relaxed) {
            0 => None,
            last => Some(now.as_secs() - last),
        }
    }

    /// Bounded exponential backoff with jitter for reconnect attempt `n`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(6);
        let backoff = self
            .config
            .reconnect_base
            .saturating_mul(1u32 << shift)
            .min(self.config.reconnect_max);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0u64..=250));
        backoff + jitter
    }

    /// Drive one upstream session after another. `connect` runs a whole
    /// session and returns when it ends: `Ok` for a clean close, `Err` for a
    /// failure. The loop applies backoff between attempts and parks while
    /// the circuit breaker is open.
    pub async fn maintain<C, F>(self: Arc<Self>, mut connect: C)
    where
        C: FnMut() -> F,
        F: Future<Output = Result<(), FeedError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.breaker_open() {
                tokio::time::sleep(self.config.breaker_cooldown).await;
                continue;
            }

            {
                let mut inner = self.inner.lock().unwrap();
                inner.session = SessionState::Connecting;
            }

            match connect().await {
                Ok(()) => {
                    info!("feed session ended, reconnecting");
                    attempt = 0;
                }
                Err(err) => {
                    warn!(%err, "feed session failed");
                    attempt = attempt.saturating_add(1);
                }
            }
            self.connection_lost();

            tokio::time::sleep(self.reconnect_delay(attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingUpstream {
        subscribes: StdMutex<Vec<Vec<String>>>,
        unsubscribes: StdMutex<Vec<Vec<String>>>,
        fail_subscribes: StdMutex<bool>,
    }

    impl RecordingUpstream {
        fn subscribe_calls(&self) -> Vec<Vec<String>> {
            self.subscribes.lock().unwrap().clone()
        }

        fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
            self.unsubscribes.lock().unwrap().clone()
        }
    }

    impl UpstreamFeed for RecordingUpstream {
        fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
            if *self.fail_subscribes.lock().unwrap() {
                return Err(FeedError::Upstream("down".into()));
            }
            self.subscribes.lock().unwrap().push(symbols.to_vec());
            Ok(())
        }

        fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
            self.unsubscribes.lock().unwrap().push(symbols.to_vec());
            Ok(())
        }
    }

    fn supervisor(upstream: Arc<RecordingUpstream>) -> Arc<FeedSupervisor> {
        FeedSupervisor::new(FeedConfig::default(), upstream)
    }

    #[tokio::test(start_paused = true)]
    async fn batches_subscribes_into_one_call() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream.clone());

        sup.add_subscription("INFY");
        sup.add_subscription("RELIANCE");
        sup.add_subscription("TCS");

        tokio::time::sleep(Duration::from_millis(60)).await;

        let calls = upstream.subscribe_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_add_remove_within_grace_is_quiet() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream.clone());

        // N overlapping references
        for _ in 0..5 {
            sup.add_subscription("INFY");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // all released, then the grace absorbs it
        for _ in 0..5 {
            sup.remove_subscription("INFY");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(upstream.subscribe_calls().len(), 1);
        assert!(upstream.unsubscribe_calls().is_empty());

        // re-subscribe before the grace expires: still no upstream traffic
        sup.add_subscription("INFY");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(upstream.subscribe_calls().len(), 1);
        assert!(upstream.unsubscribe_calls().is_empty());
        assert_eq!(sup.ref_count("INFY"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_unsubscribes_once() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream.clone());

        sup.add_subscription("INFY");
        tokio::time::sleep(Duration::from_millis(60)).await;
        sup.remove_subscription("INFY");
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(upstream.unsubscribe_calls(), vec![vec!["INFY".to_string()]]);
        assert_eq!(sup.ref_count("INFY"), 0);
        assert!(sup.active_symbols().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn churn_inside_batch_window_never_reaches_upstream() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream.clone());

        sup.add_subscription("INFY");
        sup.remove_subscription("INFY"); // still inside the batch window

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(upstream.subscribe_calls().is_empty());
        assert!(upstream.unsubscribe_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_pending_forces_immediate_send() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream.clone());

        sup.add_subscription("INFY");
        sup.flush_pending();

        assert_eq!(upstream.subscribe_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ref_counts_reported() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream);

        sup.add_subscription("INFY");
        sup.add_subscription("INFY");
        sup.add_subscription("TCS");

        assert_eq!(sup.ref_count("INFY"), 2);
        assert_eq!(
            sup.ref_counts(),
            vec![("INFY".to_string(), 2), ("TCS".to_string(), 1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_consecutive_failures() {
        let upstream = Arc::new(RecordingUpstream::default());
        *upstream.fail_subscribes.lock().unwrap() = true;
        let sup = supervisor(upstream.clone());

        for _ in 0..5 {
            sup.add_subscription("INFY");
            sup.flush_pending();
            sup.remove_subscription("INFY");
        }

        assert!(sup.breaker_open());
        assert_eq!(sup.health(Utc::now()), FeedHealth::Degraded);

        // cooldown elapses, breaker closes for the next attempt
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!sup.breaker_open());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_window_reports_expected_silence() {
        use crate::config::SessionHours;

        let config = FeedConfig {
            // a window that is always closed
            session_hours: Some(SessionHours {
                open_minute: 0,
                close_minute: 0,
            }),
            ..Default::default()
        };
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = FeedSupervisor::new(config, upstream);

        // disconnected inside the closed window is not a failure
        assert_eq!(sup.health(Utc::now()), FeedHealth::ExpectedSilence);

        sup.connection_established();
        assert_eq!(sup.health(Utc::now()), FeedHealth::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_active_set() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream.clone());

        sup.add_subscription("INFY");
        sup.add_subscription("TCS");
        sup.flush_pending();
        assert_eq!(upstream.subscribe_calls().len(), 1);

        sup.connection_lost();
        assert_eq!(sup.session_state(), SessionState::Disconnected);

        sup.connection_established();
        assert_eq!(sup.session_state(), SessionState::Connected);
        // the fresh session received the active set again
        assert_eq!(upstream.subscribe_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_throughput_counters() {
        let upstream = Arc::new(RecordingUpstream::default());
        let sup = supervisor(upstream);

        assert_eq!(sup.heartbeat_age_secs(crate::types::Timestamp::from_secs(50)), None);
        sup.record_tick(crate::types::Timestamp::from_secs(40));
        sup.record_tick(crate::types::Timestamp::from_secs(45));

        assert_eq!(sup.ticks_seen(), 2);
        assert_eq!(
            sup.heartbeat_age_secs(crate::types::Timestamp::from_secs(50)),
            Some(5)
        );
    }
}
