//! Property-based tests for the pure core math.
//!
//! These verify the invariants the engine leans on under random inputs.

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use venue_core::*;

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)) // 1.00 to 100,000.00
}

fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000i64).prop_map(Decimal::from)
}

fn bps_strategy() -> impl Strategy<Value = i32> {
    0i32..=100
}

fn equity_instrument() -> Instrument {
    Instrument::equity(InstrumentToken(1), "INFY", "NSE")
}

fn tick_at(price: Decimal) -> Tick {
    Tick {
        instrument_token: InstrumentToken(1),
        symbol: "INFY".to_string(),
        price: Price::new_unchecked(price),
        volume: 100,
        timestamp: Timestamp::from_secs(1_000),
        exchange: "NSE".to_string(),
        prev_close: None,
    }
}

fn open_market_order(side: Side, qty: Decimal) -> Order {
    let request = OrderRequest::market(InstrumentToken(1), side, qty, "prop-key");
    let mut order = Order::new(OrderId(1), UserId(1), &request, Timestamp::from_secs(1_000));
    order.status = OrderStatus::Open;
    order
}

fn open_limit_order(side: Side, qty: Decimal, limit: Decimal) -> Order {
    let request = OrderRequest::limit(
        InstrumentToken(1),
        side,
        qty,
        Price::new_unchecked(limit),
        "prop-key",
    );
    let mut order = Order::new(OrderId(1), UserId(1), &request, Timestamp::from_secs(1_000));
    order.status = OrderStatus::Open;
    order
}

proptest! {
    /// Identical inputs always produce identical fill decisions.
    #[test]
    fn resolve_fill_is_deterministic(
        price in price_strategy(),
        qty in qty_strategy(),
        bps in bps_strategy(),
        buy in any::<bool>(),
    ) {
        let side = if buy { Side::Buy } else { Side::Sell };
        let order = open_market_order(side, qty);
        let instrument = equity_instrument();
        let tick = tick_at(price);
        let now = Timestamp::from_secs(1_001);
        let params = FillParams {
            slippage: Bps::new(bps),
            max_tick_age_secs: 30,
            halted: false,
        };

        let first = resolve_fill(&order, &instrument, &tick, now, &params);
        for _ in 0..3 {
            prop_assert_eq!(resolve_fill(&order, &instrument, &tick, now, &params), first);
        }
    }

    /// Market orders always fill in full, slippage against the taker.
    #[test]
    fn market_fill_full_quantity_with_adverse_slippage(
        price in price_strategy(),
        qty in qty_strategy(),
        bps in 1i32..=100,
    ) {
        let instrument = equity_instrument();
        let tick = tick_at(price);
        let now = Timestamp::from_secs(1_001);
        let params = FillParams {
            slippage: Bps::new(bps),
            max_tick_age_secs: 30,
            halted: false,
        };

        let buy = resolve_fill(&open_market_order(Side::Buy, qty), &instrument, &tick, now, &params);
        prop_assert!(buy.should_fill);
        prop_assert_eq!(buy.fillable_quantity, qty);
        // buyer pays at or above the tick (tick-size rounding can only move
        // the price by less than one tick)
        let exec = buy.execution_price.unwrap().value();
        prop_assert!(exec >= price - instrument.tick_size);
        // price lands on the tick grid
        prop_assert!((exec % instrument.tick_size).is_zero());

        let sell = resolve_fill(&open_market_order(Side::Sell, qty), &instrument, &tick, now, &params);
        if sell.should_fill {
            let exec = sell.execution_price.unwrap().value();
            prop_assert!(exec <= price + instrument.tick_size);
            prop_assert!((exec % instrument.tick_size).is_zero());
        }
    }

    /// Limit buys fill iff tick <= limit; sells iff tick >= limit; execution
    /// is the limit price exactly.
    #[test]
    fn limit_cross_rule(
        tick_price in price_strategy(),
        limit_price in price_strategy(),
        qty in qty_strategy(),
    ) {
        let instrument = equity_instrument();
        let tick = tick_at(tick_price);
        let now = Timestamp::from_secs(1_001);
        let params = FillParams::default();

        let buy = resolve_fill(
            &open_limit_order(Side::Buy, qty, limit_price),
            &instrument, &tick, now, &params,
        );
        prop_assert_eq!(buy.should_fill, tick_price <= limit_price);
        if buy.should_fill {
            prop_assert_eq!(buy.execution_price.unwrap().value(), limit_price);
        }

        let sell = resolve_fill(
            &open_limit_order(Side::Sell, qty, limit_price),
            &instrument, &tick, now, &params,
        );
        prop_assert_eq!(sell.should_fill, tick_price >= limit_price);
        if sell.should_fill {
            prop_assert_eq!(sell.execution_price.unwrap().value(), limit_price);
        }
    }

    /// Maintenance margin is non-decreasing in the requirement and the tier
    /// ratios are ordered.
    #[test]
    fn margin_curve_monotonic(
        a in 1i64..1_000_000i64,
        b in 1i64..1_000_000i64,
    ) {
        let curve = MarginCurve::default();
        let tiers = curve.tiers();
        prop_assert!(tiers[0].ratio <= tiers[1].ratio);
        prop_assert!(tiers[1].ratio <= tiers[2].ratio);

        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let lo = Cash::new(Decimal::from(lo));
        let hi = Cash::new(Decimal::from(hi));
        prop_assert!(curve.maintenance_margin(lo) <= curve.maintenance_margin(hi));
    }

    /// Wallet invariants survive arbitrary operation sequences, and replay
    /// always reconstructs the cached projection.
    #[test]
    fn ledger_invariants_and_replay(ops in proptest::collection::vec((0u8..5, 1i64..5_000i64), 1..40)) {
        let user = UserId(1);
        let now = Timestamp::from_secs(1_000);
        let mut ledger = wallet_ledger_with(user, dec!(50_000), now);

        for (op, raw_amount) in ops {
            let amount = Cash::new(Decimal::from(raw_amount));
            let _ = match op {
                0 => ledger.credit(user, amount, ReferenceType::Deposit, 0, now),
                1 => ledger.debit(user, amount, ReferenceType::Withdrawal, 0, now),
                2 => ledger.block(user, amount, ReferenceType::Order, 1, now),
                3 => ledger.unblock(user, amount, ReferenceType::Order, 1, now),
                _ => ledger.settle(
                    user,
                    venue_core::wallet::SettlementSpec {
                        release: amount.min(ledger.wallet(user).unwrap().blocked_balance),
                        reblock: Cash::zero(),
                        balance_delta: amount.negate().max(
                            ledger.wallet(user).unwrap().free().negate(),
                        ),
                    },
                    ReferenceType::Fill,
                    2,
                    now,
                ),
            };

            // invariants hold after every operation, accepted or rejected
            let wallet = ledger.wallet(user).unwrap();
            prop_assert!(!wallet.balance.is_negative());
            prop_assert!(wallet.blocked_balance <= wallet.balance);
            prop_assert!(!wallet.blocked_balance.is_negative());
        }

        let rebuilt = ledger.recalculate_from_ledger(user).unwrap();
        let cached = ledger.wallet(user).unwrap();
        prop_assert_eq!(rebuilt.balance, cached.balance);
        prop_assert_eq!(rebuilt.blocked_balance, cached.blocked_balance);
    }

    /// Fill application conserves signed quantity.
    #[test]
    fn position_quantity_conserved(
        open_qty in qty_strategy(),
        fill_qty in qty_strategy(),
        entry in price_strategy(),
        exit in price_strategy(),
        open_buy in any::<bool>(),
        fill_buy in any::<bool>(),
    ) {
        let open_side = if open_buy { Side::Buy } else { Side::Sell };
        let fill_side = if fill_buy { Side::Buy } else { Side::Sell };

        let opened = venue_core::position::apply_fill(
            None,
            UserId(1),
            InstrumentToken(1),
            open_side,
            open_qty,
            Price::new_unchecked(entry),
            Cash::new(entry * open_qty),
            Timestamp::from_secs(0),
        );
        let position = opened.position.unwrap();

        let result = venue_core::position::apply_fill(
            Some(&position),
            UserId(1),
            InstrumentToken(1),
            fill_side,
            fill_qty,
            Price::new_unchecked(exit),
            Cash::new(exit * fill_qty),
            Timestamp::from_secs(1),
        );

        let expected = position.quantity.value() + fill_side.sign() * fill_qty;
        let actual = result
            .position
            .map(|p| p.quantity.value())
            .unwrap_or(Decimal::ZERO);
        prop_assert_eq!(actual, expected);
    }
}

fn wallet_ledger_with(
    user: UserId,
    opening: Decimal,
    now: Timestamp,
) -> venue_core::wallet::WalletLedger {
    let mut ledger = venue_core::wallet::WalletLedger::new();
    ledger
        .credit(user, Cash::new(opening), ReferenceType::Deposit, 0, now)
        .unwrap();
    ledger
}
