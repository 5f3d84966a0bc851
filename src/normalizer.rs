//! Upstream payload normalization.
//!
//! The upstream feed delivers JSON whose shape has changed across vendor
//! versions: a bare array of tick objects, an envelope with a `data` or
//! `ticks` array, or a single object. Field names vary the same way. The
//! normalizer walks an explicit fallback chain over those shapes instead of
//! speculatively indexing, drops entries it cannot make sense of, and never
//! panics on malformed input.

use crate::tick::Tick;
use crate::types::{InstrumentToken, Price, Timestamp};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

// beyond this magnitude an epoch stamp has to be in milliseconds
const MILLIS_CUTOFF: i64 = 100_000_000_000;

/// Internal identity for a broker-side instrument id.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub token: InstrumentToken,
    pub symbol: String,
    pub exchange: String,
}

/// Converts raw upstream payloads into canonical ticks, resolving broker ids
/// to internal instrument identity through a maintained map.
#[derive(Debug, Default)]
pub struct TickNormalizer {
    identities: HashMap<u64, ResolvedIdentity>,
}

impl TickNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_identity(
        &mut self,
        broker_id: u64,
        token: InstrumentToken,
        symbol: &str,
        exchange: &str,
    ) {
        self.identities.insert(
            broker_id,
            ResolvedIdentity {
                token,
                symbol: symbol.to_string(),
                exchange: exchange.to_string(),
            },
        );
    }

    pub fn mapped_count(&self) -> usize {
        self.identities.len()
    }

    /// Normalize one raw payload. Invalid entries are dropped; unresolved
    /// broker ids pass through under a synthetic symbol so they stay visible
    /// downstream. `received_at` backfills entries carrying no timestamp.
    pub fn normalize(&self, raw: &Value, received_at: Timestamp) -> Vec<Tick> {
        let entries: Vec<&Value> = match raw {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => {
                if let Some(Value::Array(items)) = map.get("data") {
                    items.iter().collect()
                } else if let Some(Value::Array(items)) = map.get("ticks") {
                    items.iter().collect()
                } else {
                    vec![raw]
                }
            }
            _ => {
                debug!(payload_type = ?raw, "unrecognized payload shape, dropping");
                return Vec::new();
            }
        };

        let mut ticks = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.normalize_entry(entry, received_at) {
                Some(tick) => ticks.push(tick),
                None => debug!("dropping malformed tick entry"),
            }
        }
        ticks
    }

    fn normalize_entry(&self, entry: &Value, received_at: Timestamp) -> Option<Tick> {
        let obj = entry.as_object()?;

        let broker_id = int_field(obj, &["instrument_token", "token", "id"])?;
        let price_raw = decimal_field(obj, &["last_price", "ltp", "price"])?;
        let price = Price::new(price_raw)?;

        let volume = int_field(obj, &["volume", "volume_traded", "qty"]).unwrap_or(0) as u64;

        let timestamp = int_field(obj, &["exchange_timestamp", "timestamp", "ts"])
            .map(|raw| normalize_epoch(raw as i64))
            .unwrap_or(received_at);

        let prev_close = decimal_field(obj, &["prev_close", "close"]).and_then(Price::new);

        let (token, symbol, exchange) = match self.identities.get(&broker_id) {
            Some(identity) => (
                identity.token,
                identity.symbol.clone(),
                identity.exchange.clone(),
            ),
            None => {
                // unresolved ids stay visible rather than being dropped
                let exchange = obj
                    .get("exchange")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string();
                (
                    InstrumentToken(broker_id as u32),
                    format!("TOKEN:{broker_id}"),
                    exchange,
                )
            }
        };

        Some(Tick {
            instrument_token: token,
            symbol,
            price,
            volume,
            timestamp,
            exchange,
            prev_close,
        })
    }
}

/// Seconds-vs-milliseconds is decided by magnitude alone.
fn normalize_epoch(raw: i64) -> Timestamp {
    if raw >= MILLIS_CUTOFF {
        Timestamp::from_secs(raw / 1_000)
    } else {
        Timestamp::from_secs(raw)
    }
}

fn int_field(obj: &serde_json::Map<String, Value>, names: &[&str]) -> Option<u64> {
    for name in names {
        match obj.get(*name) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_u64() {
                    return Some(v);
                }
                if let Some(f) = n.as_f64() {
                    if f >= 0.0 {
                        return Some(f as u64);
                    }
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<u64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn decimal_field(obj: &serde_json::Map<String, Value>, names: &[&str]) -> Option<Decimal> {
    for name in names {
        match obj.get(*name) {
            // go through the string form to avoid binary-float dust
            Some(Value::Number(n)) => {
                if let Ok(v) = Decimal::from_str(&n.to_string()) {
                    return Some(v);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = Decimal::from_str(s) {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}
