//! Fill engine: the pure decision function.
//!
//! Given an order, its instrument, and the latest tick, decide whether the
//! order executes, at what price, and for how much. No hidden state:
//! identical inputs always produce identical outputs, which is what makes
//! fills replayable and the engine auditable.

use crate::instrument::Instrument;
use crate::order::{Order, OrderType, RejectReason};
use crate::tick::Tick;
use crate::types::{Bps, Price, Side, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Knobs the decision depends on besides its three inputs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FillParams {
    /// Market-order slippage applied against the taker.
    pub slippage: Bps,
    /// A reference tick older than this cannot price an execution.
    pub max_tick_age_secs: i64,
    /// Trading halt flag for the order's instrument.
    pub halted: bool,
}

impl Default for FillParams {
    fn default() -> Self {
        Self {
            slippage: Bps::new(10),
            max_tick_age_secs: 30,
            halted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillOutcome {
    /// Execute now at `execution_price`.
    Filled,
    /// Limit not crossed; the order stays open with no side effect.
    Resting,
    /// A pre-trade safety gate refused the order.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillDecision {
    pub should_fill: bool,
    pub execution_price: Option<Price>,
    /// Market orders fill in full or not at all; partial fills are a
    /// documented non-goal, so this is the order quantity on every fill.
    pub fillable_quantity: Decimal,
    pub slippage_bps: Bps,
    pub outcome: FillOutcome,
}

impl FillDecision {
    fn rejected(reason: RejectReason, slippage: Bps) -> Self {
        Self {
            should_fill: false,
            execution_price: None,
            fillable_quantity: Decimal::ZERO,
            slippage_bps: slippage,
            outcome: FillOutcome::Rejected(reason),
        }
    }

    fn resting(slippage: Bps) -> Self {
        Self {
            should_fill: false,
            execution_price: None,
            fillable_quantity: Decimal::ZERO,
            slippage_bps: slippage,
            outcome: FillOutcome::Resting,
        }
    }
}

/// Decide fill eligibility, price, and quantity for one order against the
/// latest tick.
pub fn resolve_fill(
    order: &Order,
    instrument: &Instrument,
    tick: &Tick,
    now: Timestamp,
    params: &FillParams,
) -> FillDecision {
    let slippage = params.slippage;

    // safety gates first: typed rejections, never silent skips
    if !instrument.is_tradable() {
        return FillDecision::rejected(RejectReason::NotTradable, slippage);
    }
    if params.halted {
        return FillDecision::rejected(RejectReason::TradingHalted, slippage);
    }
    if tick.instrument_token != order.instrument_token
        || tick.instrument_token != instrument.token
    {
        return FillDecision::rejected(RejectReason::UnresolvedInstrument, slippage);
    }
    if tick.is_stale(now, params.max_tick_age_secs) {
        return FillDecision::rejected(RejectReason::StalePrice, slippage);
    }

    match order.order_type {
        OrderType::Market => {
            let adjusted = match order.side {
                Side::Buy => tick.price.value() * (Decimal::ONE + slippage.as_fraction()),
                Side::Sell => tick.price.value() * (Decimal::ONE - slippage.as_fraction()),
            };
            match instrument.round_to_tick(adjusted) {
                Some(execution_price) => FillDecision {
                    should_fill: true,
                    execution_price: Some(execution_price),
                    fillable_quantity: order.quantity,
                    slippage_bps: slippage,
                    outcome: FillOutcome::Filled,
                },
                // slippage pushed the price off the positive grid
                None => FillDecision::rejected(RejectReason::StalePrice, slippage),
            }
        }
        OrderType::Limit => {
            let Some(limit) = order.limit_price else {
                return FillDecision::rejected(RejectReason::UnresolvedInstrument, slippage);
            };
            let crossed = match order.side {
                Side::Buy => tick.price <= limit,
                Side::Sell => tick.price >= limit,
            };
            if crossed {
                // execution at the limit price exactly, never the tick price
                FillDecision {
                    should_fill: true,
                    execution_price: Some(limit),
                    fillable_quantity: order.quantity,
                    slippage_bps: Bps::new(0),
                    outcome: FillOutcome::Filled,
                }
            } else {
                FillDecision::resting(slippage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Instrument;
    use crate::order::OrderRequest;
    use crate::types::{InstrumentToken, OrderId, UserId};
    use rust_decimal_macros::dec;

    fn equity() -> Instrument {
        Instrument::equity(InstrumentToken(1), "INFY", "NSE")
    }

    fn tick(price: Decimal, ts: i64) -> Tick {
        Tick {
            instrument_token: InstrumentToken(1),
            symbol: "INFY".to_string(),
            price: Price::new_unchecked(price),
            volume: 100,
            timestamp: Timestamp::from_secs(ts),
            exchange: "NSE".to_string(),
            prev_close: None,
        }
    }

    fn market_order(side: Side, qty: Decimal) -> Order {
        let req = OrderRequest::market(InstrumentToken(1), side, qty, "key");
        let mut order = Order::new(OrderId(1), UserId(1), &req, Timestamp::from_secs(0));
        order.status = crate::order::OrderStatus::Open;
        order
    }

    fn limit_order(side: Side, qty: Decimal, limit: Decimal) -> Order {
        let req = OrderRequest::limit(
            InstrumentToken(1),
            side,
            qty,
            Price::new_unchecked(limit),
            "key",
        );
        let mut order = Order::new(OrderId(1), UserId(1), &req, Timestamp::from_secs(0));
        order.status = crate::order::OrderStatus::Open;
        order
    }

    #[test]
    fn market_buy_pays_slippage_rounded_to_tick() {
        let order = market_order(Side::Buy, dec!(10));
        let decision = resolve_fill(
            &order,
            &equity(),
            &tick(dec!(100), 10),
            Timestamp::from_secs(10),
            &FillParams::default(),
        );

        assert!(decision.should_fill);
        // 100 * 1.001 = 100.10, already on the 0.05 grid
        assert_eq!(decision.execution_price.unwrap().value(), dec!(100.10));
        assert_eq!(decision.fillable_quantity, dec!(10));
    }

    #[test]
    fn market_sell_receives_less() {
        let order = market_order(Side::Sell, dec!(10));
        let decision = resolve_fill(
            &order,
            &equity(),
            &tick(dec!(100), 10),
            Timestamp::from_secs(10),
            &FillParams::default(),
        );

        // 100 * 0.999 = 99.90
        assert_eq!(decision.execution_price.unwrap().value(), dec!(99.90));
    }

    #[test]
    fn limit_buy_fills_iff_tick_at_or_below_limit() {
        let order = limit_order(Side::Buy, dec!(5), dec!(100));
        let params = FillParams::default();
        let now = Timestamp::from_secs(10);

        let above = resolve_fill(&order, &equity(), &tick(dec!(100.05), 10), now, &params);
        assert_eq!(above.outcome, FillOutcome::Resting);

        let at = resolve_fill(&order, &equity(), &tick(dec!(100), 10), now, &params);
        assert!(at.should_fill);
        // limit price exactly, not the tick price
        assert_eq!(at.execution_price.unwrap().value(), dec!(100));

        let below = resolve_fill(&order, &equity(), &tick(dec!(99), 10), now, &params);
        assert_eq!(below.execution_price.unwrap().value(), dec!(100));
    }

    #[test]
    fn limit_sell_fills_iff_tick_at_or_above_limit() {
        let order = limit_order(Side::Sell, dec!(5), dec!(100));
        let params = FillParams::default();
        let now = Timestamp::from_secs(10);

        let below = resolve_fill(&order, &equity(), &tick(dec!(99.95), 10), now, &params);
        assert_eq!(below.outcome, FillOutcome::Resting);

        let above = resolve_fill(&order, &equity(), &tick(dec!(101), 10), now, &params);
        assert_eq!(above.execution_price.unwrap().value(), dec!(100));
    }

    #[test]
    fn stale_tick_is_a_typed_rejection() {
        let order = market_order(Side::Buy, dec!(10));
        let decision = resolve_fill(
            &order,
            &equity(),
            &tick(dec!(100), 10),
            Timestamp::from_secs(100),
            &FillParams::default(),
        );

        assert_eq!(
            decision.outcome,
            FillOutcome::Rejected(RejectReason::StalePrice)
        );
        assert!(!decision.should_fill);
    }

    #[test]
    fn halted_instrument_rejected() {
        let order = market_order(Side::Buy, dec!(10));
        let params = FillParams {
            halted: true,
            ..Default::default()
        };
        let decision = resolve_fill(
            &order,
            &equity(),
            &tick(dec!(100), 10),
            Timestamp::from_secs(10),
            &params,
        );

        assert_eq!(
            decision.outcome,
            FillOutcome::Rejected(RejectReason::TradingHalted)
        );
    }

    #[test]
    fn mismatched_identity_rejected() {
        let order = market_order(Side::Buy, dec!(10));
        let mut wrong_tick = tick(dec!(100), 10);
        wrong_tick.instrument_token = InstrumentToken(99);

        let decision = resolve_fill(
            &order,
            &equity(),
            &wrong_tick,
            Timestamp::from_secs(10),
            &FillParams::default(),
        );
        assert_eq!(
            decision.outcome,
            FillOutcome::Rejected(RejectReason::UnresolvedInstrument)
        );
    }

    #[test]
    fn index_not_tradable() {
        let order = market_order(Side::Buy, dec!(10));
        let index = Instrument::index(InstrumentToken(1), "NIFTY 50", "NSE");
        let decision = resolve_fill(
            &order,
            &index,
            &tick(dec!(100), 10),
            Timestamp::from_secs(10),
            &FillParams::default(),
        );
        assert_eq!(
            decision.outcome,
            FillOutcome::Rejected(RejectReason::NotTradable)
        );
    }

    #[test]
    fn decision_is_deterministic() {
        let order = market_order(Side::Buy, dec!(10));
        let instrument = equity();
        let t = tick(dec!(123.45), 10);
        let now = Timestamp::from_secs(11);
        let params = FillParams::default();

        let first = resolve_fill(&order, &instrument, &t, now, &params);
        for _ in 0..10 {
            assert_eq!(resolve_fill(&order, &instrument, &t, now, &params), first);
        }
    }
}
