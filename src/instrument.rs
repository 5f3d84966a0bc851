//! Instrument identity and the catalogue projection.
//!
//! Instruments are owned by an external catalogue service; the core keeps a
//! read-mostly projection mapping tokens and symbols to contract metadata.
//! Price rounding to the contract tick size lives here because every fill
//! price must land on the instrument grid.

use crate::types::{InstrumentToken, Price};
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Future,
    Option,
    Index,
}

/// CE = call, PE = put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    Ce,
    Pe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub token: InstrumentToken,
    pub symbol: String,
    pub kind: InstrumentKind,
    pub exchange: String,
    pub lot_size: u32,
    pub tick_size: Decimal,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<Price>,
    pub option_kind: Option<OptionKind>,
}

impl Instrument {
    pub fn equity(token: InstrumentToken, symbol: &str, exchange: &str) -> Self {
        Self {
            token,
            symbol: symbol.to_string(),
            kind: InstrumentKind::Equity,
            exchange: exchange.to_string(),
            lot_size: 1,
            tick_size: dec!(0.05),
            expiry: None,
            strike: None,
            option_kind: None,
        }
    }

    pub fn future(
        token: InstrumentToken,
        symbol: &str,
        exchange: &str,
        lot_size: u32,
        expiry: NaiveDate,
    ) -> Self {
        Self {
            token,
            symbol: symbol.to_string(),
            kind: InstrumentKind::Future,
            exchange: exchange.to_string(),
            lot_size,
            tick_size: dec!(0.05),
            expiry: Some(expiry),
            strike: None,
            option_kind: None,
        }
    }

    pub fn option(
        token: InstrumentToken,
        symbol: &str,
        exchange: &str,
        lot_size: u32,
        expiry: NaiveDate,
        strike: Price,
        option_kind: OptionKind,
    ) -> Self {
        Self {
            token,
            symbol: symbol.to_string(),
            kind: InstrumentKind::Option,
            exchange: exchange.to_string(),
            lot_size,
            tick_size: dec!(0.05),
            expiry: Some(expiry),
            strike: Some(strike),
            option_kind: Some(option_kind),
        }
    }

    pub fn index(token: InstrumentToken, symbol: &str, exchange: &str) -> Self {
        Self {
            token,
            symbol: symbol.to_string(),
            kind: InstrumentKind::Index,
            exchange: exchange.to_string(),
            lot_size: 1,
            tick_size: dec!(0.05),
            expiry: None,
            strike: None,
            option_kind: None,
        }
    }

    // indices are quote-only
    pub fn is_tradable(&self) -> bool {
        self.kind != InstrumentKind::Index
    }

    /// Round a raw price onto the instrument tick grid, half away from zero.
    pub fn round_to_tick(&self, raw: Decimal) -> Option<Price> {
        if self.tick_size <= Decimal::ZERO {
            return Price::new(raw);
        }
        let steps = (raw / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        Price::new(steps * self.tick_size)
    }

    pub fn is_lot_multiple(&self, quantity: Decimal) -> bool {
        if self.lot_size <= 1 {
            return true;
        }
        (quantity % Decimal::from(self.lot_size)).is_zero()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogueError {
    #[error("Unknown instrument token {0}")]
    UnknownToken(InstrumentToken),

    #[error("Unknown symbol {0}")]
    UnknownSymbol(String),
}

/// Token- and symbol-addressable view of the instrument universe.
#[derive(Debug, Clone, Default)]
pub struct InstrumentCatalogue {
    by_token: HashMap<InstrumentToken, Instrument>,
    by_symbol: HashMap<String, InstrumentToken>,
}

impl InstrumentCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instrument: Instrument) {
        self.by_symbol
            .insert(instrument.symbol.clone(), instrument.token);
        self.by_token.insert(instrument.token, instrument);
    }

    pub fn get(&self, token: InstrumentToken) -> Result<&Instrument, CatalogueError> {
        self.by_token
            .get(&token)
            .ok_or(CatalogueError::UnknownToken(token))
    }

    pub fn lookup(&self, token: InstrumentToken) -> Option<&Instrument> {
        self.by_token.get(&token)
    }

    pub fn token_for(&self, symbol: &str) -> Result<InstrumentToken, CatalogueError> {
        self.by_symbol
            .get(symbol)
            .copied()
            .ok_or_else(|| CatalogueError::UnknownSymbol(symbol.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.by_token.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn nifty_fut() -> Instrument {
        Instrument::future(
            InstrumentToken(101),
            "NIFTY25AUGFUT",
            "NFO",
            50,
            NaiveDate::from_ymd_opt(2025, 8, 28).unwrap(),
        )
    }

    #[test]
    fn tick_rounding_half_away() {
        let eq = Instrument::equity(InstrumentToken(1), "RELIANCE", "NSE");
        assert_eq!(eq.round_to_tick(dec!(100.10)).unwrap().value(), dec!(100.10));
        assert_eq!(eq.round_to_tick(dec!(100.12)).unwrap().value(), dec!(100.10));
        assert_eq!(eq.round_to_tick(dec!(100.13)).unwrap().value(), dec!(100.15));
        // midpoint rounds away from zero
        assert_eq!(eq.round_to_tick(dec!(100.125)).unwrap().value(), dec!(100.15));
    }

    #[test]
    fn tick_rounding_rejects_non_positive() {
        let eq = Instrument::equity(InstrumentToken(1), "RELIANCE", "NSE");
        assert!(eq.round_to_tick(dec!(0.001)).is_none()); // rounds to zero
    }

    #[test]
    fn lot_multiples() {
        let fut = nifty_fut();
        assert!(fut.is_lot_multiple(dec!(50)));
        assert!(fut.is_lot_multiple(dec!(150)));
        assert!(!fut.is_lot_multiple(dec!(75)));

        let eq = Instrument::equity(InstrumentToken(1), "RELIANCE", "NSE");
        assert!(eq.is_lot_multiple(dec!(7)));
    }

    #[test]
    fn catalogue_lookup_both_ways() {
        let mut cat = InstrumentCatalogue::new();
        cat.insert(nifty_fut());

        assert_eq!(cat.token_for("NIFTY25AUGFUT").unwrap(), InstrumentToken(101));
        assert_eq!(cat.get(InstrumentToken(101)).unwrap().lot_size, 50);
        assert!(matches!(
            cat.get(InstrumentToken(999)),
            Err(CatalogueError::UnknownToken(_))
        ));
        assert!(matches!(
            cat.token_for("MISSING"),
            Err(CatalogueError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn index_not_tradable() {
        let idx = Instrument::index(InstrumentToken(9), "NIFTY 50", "NSE");
        assert!(!idx.is_tradable());
    }
}
