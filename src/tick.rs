// 2.0: canonical tick and the latest-tick store. ticks are ephemeral: only the
// most recent one per instrument is retained, though every tick is fanned out
// to consumers exactly once by the bus.

use crate::types::{InstrumentToken, Price, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single price/volume update for one instrument at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_token: InstrumentToken,
    pub symbol: String,
    pub price: Price,
    pub volume: u64,
    pub timestamp: Timestamp,
    pub exchange: String,
    pub prev_close: Option<Price>,
}

impl Tick {
    pub fn is_stale(&self, now: Timestamp, max_age_secs: i64) -> bool {
        self.timestamp.age_secs(now) > max_age_secs
    }
}

/// Latest tick per instrument. The stream is ordered per instrument, never
/// globally, so an older timestamp for the same token is dropped.
#[derive(Debug, Clone, Default)]
pub struct TickStore {
    latest: HashMap<InstrumentToken, Tick>,
}

impl TickStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain the tick if it is at least as new as the one held.
    pub fn apply(&mut self, tick: Tick) {
        match self.latest.get(&tick.instrument_token) {
            Some(held) if held.timestamp > tick.timestamp => {}
            _ => {
                self.latest.insert(tick.instrument_token, tick);
            }
        }
    }

    pub fn latest(&self, token: InstrumentToken) -> Option<&Tick> {
        self.latest.get(&token)
    }

    pub fn latest_price(&self, token: InstrumentToken) -> Option<Price> {
        self.latest.get(&token).map(|t| t.price)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(token: u32, price: rust_decimal::Decimal, ts: i64) -> Tick {
        Tick {
            instrument_token: InstrumentToken(token),
            symbol: format!("SYM{token}"),
            price: Price::new_unchecked(price),
            volume: 100,
            timestamp: Timestamp::from_secs(ts),
            exchange: "NSE".to_string(),
            prev_close: None,
        }
    }

    #[test]
    fn keeps_latest_per_instrument() {
        let mut store = TickStore::new();
        store.apply(tick(1, dec!(100), 10));
        store.apply(tick(1, dec!(101), 11));
        store.apply(tick(2, dec!(200), 10));

        assert_eq!(store.latest_price(InstrumentToken(1)).unwrap().value(), dec!(101));
        assert_eq!(store.latest_price(InstrumentToken(2)).unwrap().value(), dec!(200));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn drops_out_of_order_tick() {
        let mut store = TickStore::new();
        store.apply(tick(1, dec!(101), 11));
        store.apply(tick(1, dec!(99), 10)); // older, dropped

        assert_eq!(store.latest_price(InstrumentToken(1)).unwrap().value(), dec!(101));
    }

    #[test]
    fn staleness() {
        let t = tick(1, dec!(100), 1_000);
        assert!(!t.is_stale(Timestamp::from_secs(1_020), 30));
        assert!(t.is_stale(Timestamp::from_secs(1_031), 30));
    }
}
