//! Mark-to-market snapshots.
//!
//! A snapshot is derived state, recomputed per tick cycle for users with
//! open exposure and never persisted: equity = wallet balance + unrealized
//! P&L from the latest retained marks; required margin = the sum of the
//! reservations taken when each open position was entered. The requirement
//! moves only when exposure changes. A crashing mark erodes equity, not the
//! requirement it is measured against.

use crate::margin_curve::MarginCurve;
use crate::position::Position;
use crate::tick::TickStore;
use crate::types::{Cash, Price, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MtmSnapshot {
    pub user_id: UserId,
    pub equity: Cash,
    pub required_margin: Cash,
    pub maintenance_margin: Cash,
    pub unrealized_pnl: Cash,
}

impl MtmSnapshot {
    pub fn is_liquidation_eligible(&self, curve: &MarginCurve) -> bool {
        curve.is_immediate_liquidation_eligible(self.equity, self.required_margin)
    }
}

/// Mark for a position: the latest retained tick, falling back to the entry
/// price (zero unrealized P&L) when no tick has arrived yet.
pub fn mark_for(position: &Position, ticks: &TickStore) -> Price {
    ticks
        .latest_price(position.instrument_token)
        .unwrap_or(position.average_price)
}

pub fn compute_snapshot<'a>(
    user_id: UserId,
    balance: Cash,
    positions: impl Iterator<Item = &'a Position>,
    ticks: &TickStore,
    curve: &MarginCurve,
) -> MtmSnapshot {
    let mut unrealized = Cash::zero();
    let mut required = Cash::zero();

    for position in positions {
        if position.is_empty() {
            continue;
        }
        let mark = mark_for(position, ticks);
        unrealized = unrealized.add(position.unrealized_pnl(mark));
        required = required.add(position.margin_blocked);
    }

    let equity = balance.add(unrealized);
    MtmSnapshot {
        user_id,
        equity,
        required_margin: required,
        maintenance_margin: curve.maintenance_margin(required),
        unrealized_pnl: unrealized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::apply_fill;
    use crate::tick::Tick;
    use crate::types::{InstrumentToken, Side, Timestamp};
    use rust_decimal_macros::dec;

    fn long_future(
        qty: rust_decimal::Decimal,
        entry: rust_decimal::Decimal,
        margin: rust_decimal::Decimal,
    ) -> Position {
        apply_fill(
            None,
            UserId(1),
            InstrumentToken(1),
            Side::Buy,
            qty,
            Price::new_unchecked(entry),
            Cash::new(margin),
            Timestamp::from_secs(0),
        )
        .position
        .unwrap()
    }

    fn tick_at(price: rust_decimal::Decimal) -> Tick {
        Tick {
            instrument_token: InstrumentToken(1),
            symbol: "NIFTY25AUGFUT".to_string(),
            price: Price::new_unchecked(price),
            volume: 0,
            timestamp: Timestamp::from_secs(100),
            exchange: "NFO".to_string(),
            prev_close: None,
        }
    }

    #[test]
    fn snapshot_sums_pnl_and_entry_margin() {
        let curve = MarginCurve::default();
        let pos = long_future(dec!(50), dec!(200), dec!(1_500));

        let mut ticks = TickStore::new();
        ticks.apply(tick_at(dec!(210)));

        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(10_000)),
            std::iter::once(&pos),
            &ticks,
            &curve,
        );

        // 50 * (210 - 200) = 500 unrealized
        assert_eq!(snap.unrealized_pnl.value(), dec!(500));
        assert_eq!(snap.equity.value(), dec!(10_500));
        // the reservation taken at entry, unmoved by the mark
        assert_eq!(snap.required_margin.value(), dec!(1_500));
        // tier 1: 0.50
        assert_eq!(snap.maintenance_margin.value(), dec!(750));
    }

    #[test]
    fn requirement_does_not_shrink_with_a_crashing_mark() {
        let curve = MarginCurve::default();
        let pos = long_future(dec!(50), dec!(200), dec!(1_500));

        let mut ticks = TickStore::new();
        ticks.apply(tick_at(dec!(20)));

        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(10_000)),
            std::iter::once(&pos),
            &ticks,
            &curve,
        );

        assert_eq!(snap.required_margin.value(), dec!(1_500));
        // equity = 10_000 + 50 * (20 - 200) = 1_000
        assert_eq!(snap.equity.value(), dec!(1_000));
        assert!(!snap.is_liquidation_eligible(&curve));

        ticks.apply(Tick {
            timestamp: Timestamp::from_secs(101),
            ..tick_at(dec!(14))
        });
        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(10_000)),
            std::iter::once(&pos),
            &ticks,
            &curve,
        );
        // equity = 700, maintenance = 750 >= equity
        assert!(snap.is_liquidation_eligible(&curve));
    }

    #[test]
    fn missing_tick_falls_back_to_entry() {
        let pos = long_future(dec!(50), dec!(200), dec!(1_500));
        let ticks = TickStore::new();

        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(10_000)),
            std::iter::once(&pos),
            &ticks,
            &MarginCurve::default(),
        );

        assert_eq!(snap.unrealized_pnl.value(), dec!(0));
        assert_eq!(snap.equity.value(), dec!(10_000));
    }

    #[test]
    fn no_positions_means_no_requirement() {
        let curve = MarginCurve::default();
        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(5_000)),
            std::iter::empty(),
            &TickStore::new(),
            &curve,
        );

        assert_eq!(snap.required_margin.value(), dec!(0));
        assert!(!snap.is_liquidation_eligible(&curve));
    }

    #[test]
    fn tier2_breach_walkthrough() {
        // equity 100k; future margin 80k sits in tier 2 (0.65) => 52k
        // maintenance; a loss past 48k makes the account eligible
        let curve = MarginCurve::default();
        let pos = long_future(dec!(100), dec!(5_000), dec!(80_000));

        let mut ticks = TickStore::new();
        ticks.apply(Tick {
            instrument_token: InstrumentToken(1),
            symbol: "FUT".to_string(),
            price: Price::new_unchecked(dec!(4_530)),
            volume: 0,
            timestamp: Timestamp::from_secs(100),
            exchange: "NFO".to_string(),
            prev_close: None,
        });

        // loss = 100 * (5_000 - 4_530) = 47_000; equity 53_000 > 52_000
        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(100_000)),
            std::iter::once(&pos),
            &ticks,
            &curve,
        );
        assert_eq!(snap.maintenance_margin.value(), dec!(52_000));
        assert!(!snap.is_liquidation_eligible(&curve));

        // loss = 48_100; equity 51_900 <= 52_000 -> eligible
        ticks.apply(Tick {
            instrument_token: InstrumentToken(1),
            symbol: "FUT".to_string(),
            price: Price::new_unchecked(dec!(4_519)),
            volume: 0,
            timestamp: Timestamp::from_secs(101),
            exchange: "NFO".to_string(),
            prev_close: None,
        });
        let snap = compute_snapshot(
            UserId(1),
            Cash::new(dec!(100_000)),
            std::iter::once(&pos),
            &ticks,
            &curve,
        );
        assert!(snap.is_liquidation_eligible(&curve));
    }
}
