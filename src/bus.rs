//! Tick bus: in-process fan-out of canonical ticks.
//!
//! Consumers are notified synchronously in registration order. Each call
//! runs inside its own error boundary: a `Result` error is logged and a
//! panic is caught, so one slow or broken consumer can never block or starve
//! the others. There is no buffering or backpressure; a consumer needing
//! history retains it itself and its per-tick work is expected to be cheap.

use crate::tick::Tick;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

pub trait TickConsumer: Send + Sync {
    fn name(&self) -> &str;
    fn on_tick(&self, tick: &Tick) -> Result<(), ConsumerError>;
}

#[derive(Default)]
pub struct TickBus {
    consumers: Vec<Arc<dyn TickConsumer>>,
    delivered: AtomicU64,
    consumer_errors: AtomicU64,
}

impl TickBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, consumer: Arc<dyn TickConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Deliver one tick to every consumer, isolating failures per consumer.
    pub fn emit(&self, tick: &Tick) {
        for consumer in &self.consumers {
            let outcome = catch_unwind(AssertUnwindSafe(|| consumer.on_tick(tick)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.consumer_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        consumer = consumer.name(),
                        token = tick.instrument_token.0,
                        %err,
                        "tick consumer returned error"
                    );
                }
                Err(_) => {
                    self.consumer_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        consumer = consumer.name(),
                        token = tick.instrument_token.0,
                        "tick consumer panicked"
                    );
                }
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn consumer_errors(&self) -> u64 {
        self.consumer_errors.load(Ordering::Relaxed)
    }
}
