// 3.0: open position tracking, keyed (user, instrument). pnl = qty * (mark - avg).
// 3.1 has the open/increase/reduce/flip fill application at the bottom.

use crate::instrument::InstrumentKind;
use crate::types::{Cash, InstrumentToken, Price, Side, SignedQty, Timestamp, UserId};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub quantity: SignedQty,
    pub average_price: Price,
    pub realized_pnl: Cash,
    /// Margin held blocked in the wallet against this position.
    pub margin_blocked: Cash,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Position {
    pub fn is_empty(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn side(&self) -> Option<Side> {
        self.quantity.side()
    }

    // 3.2: paper gains/losses against the latest retained tick
    pub fn unrealized_pnl(&self, mark: Price) -> Cash {
        calculate_unrealized_pnl(self.quantity, self.average_price, mark)
    }

    pub fn notional(&self, mark: Price) -> Cash {
        Cash::new(self.quantity.abs() * mark.value())
    }
}

// 3.3: the pnl formula. qty * (mark - avg)
pub fn calculate_unrealized_pnl(quantity: SignedQty, average: Price, mark: Price) -> Cash {
    Cash::new(quantity.value() * (mark.value() - average.value()))
}

/// Margin rates per instrument kind. Equity and bought options carry full
/// notional; futures and short options carry a fraction of notional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginRates {
    pub future_margin_rate: Decimal,
    pub option_short_margin_rate: Decimal,
}

impl Default for MarginRates {
    fn default() -> Self {
        Self {
            future_margin_rate: dec!(0.15),
            option_short_margin_rate: dec!(0.20),
        }
    }
}

/// Margin required to carry `qty_abs` units opened on `side` at `price`.
pub fn required_margin(
    kind: InstrumentKind,
    side: Side,
    qty_abs: Decimal,
    price: Price,
    rates: &MarginRates,
) -> Cash {
    let notional = Cash::new(qty_abs.abs() * price.value());
    match kind {
        InstrumentKind::Equity => notional,
        InstrumentKind::Future => notional.mul(rates.future_margin_rate),
        InstrumentKind::Option => match side {
            Side::Buy => notional, // full premium
            Side::Sell => notional.mul(rates.option_short_margin_rate),
        },
        InstrumentKind::Index => Cash::zero(),
    }
}

/// Outcome of applying one fill to a position slot.
#[derive(Debug, Clone)]
pub struct PositionFill {
    pub position: Option<Position>,
    /// Realized P&L booked by this fill alone.
    pub realized_pnl: Cash,
    /// Position margin released back to the wallet by this fill.
    pub margin_released: Cash,
    /// New position margin taken on by this fill.
    pub margin_added: Cash,
    pub opened: bool,
    pub closed: bool,
}

// 3.4: fill application. same-direction fills average the entry, opposing
// fills realize pnl on the reduced quantity; overshoot flips the position.
// `margin_for_increase` is the margin the caller computed for whatever part
// of the fill increases exposure.
pub fn apply_fill(
    existing: Option<&Position>,
    user_id: UserId,
    instrument_token: InstrumentToken,
    side: Side,
    quantity: Decimal,
    fill_price: Price,
    margin_for_increase: Cash,
    timestamp: Timestamp,
) -> PositionFill {
    debug_assert!(quantity > Decimal::ZERO, "fill quantity must be positive");

    let delta = side.sign() * quantity;

    let Some(position) = existing else {
        return PositionFill {
            position: Some(Position {
                user_id,
                instrument_token,
                quantity: SignedQty::new(delta),
                average_price: fill_price,
                realized_pnl: Cash::zero(),
                margin_blocked: margin_for_increase,
                opened_at: timestamp,
                updated_at: timestamp,
            }),
            realized_pnl: Cash::zero(),
            margin_released: Cash::zero(),
            margin_added: margin_for_increase,
            opened: true,
            closed: false,
        };
    };

    let old_qty = position.quantity.value();
    let same_direction = position.is_empty() || (delta.signum() == old_qty.signum());

    if same_direction {
        // weighted-average entry over the combined quantity
        let new_qty = old_qty + delta;
        let weighted = old_qty.abs() * position.average_price.value()
            + delta.abs() * fill_price.value();
        let new_avg = Price::new_unchecked(weighted / new_qty.abs());

        return PositionFill {
            position: Some(Position {
                quantity: SignedQty::new(new_qty),
                average_price: new_avg,
                margin_blocked: position.margin_blocked.add(margin_for_increase),
                updated_at: timestamp,
                ..position.clone()
            }),
            realized_pnl: Cash::zero(),
            margin_released: Cash::zero(),
            margin_added: margin_for_increase,
            opened: false,
            closed: false,
        };
    }

    // opposing fill: realize pnl on the overlap
    let reduce_qty = quantity.min(old_qty.abs());
    let closed_qty = SignedQty::new(old_qty.signum() * reduce_qty);
    let realized = Cash::new(
        closed_qty.value() * (fill_price.value() - position.average_price.value()),
    );

    let reduce_fraction = reduce_qty / old_qty.abs();
    let margin_released = position.margin_blocked.mul(reduce_fraction);

    let remaining_abs = old_qty.abs() - reduce_qty;
    let overshoot = quantity - reduce_qty;

    if remaining_abs.is_zero() && overshoot.is_zero() {
        // flat
        return PositionFill {
            position: None,
            realized_pnl: realized,
            margin_released: position.margin_blocked,
            margin_added: Cash::zero(),
            opened: false,
            closed: true,
        };
    }

    if overshoot > Decimal::ZERO {
        // flipped through zero: remainder opens fresh on the fill side
        return PositionFill {
            position: Some(Position {
                user_id,
                instrument_token,
                quantity: SignedQty::from_side(side, overshoot),
                average_price: fill_price,
                realized_pnl: position.realized_pnl.add(realized),
                margin_blocked: margin_for_increase,
                opened_at: timestamp,
                updated_at: timestamp,
            }),
            realized_pnl: realized,
            margin_released: position.margin_blocked,
            margin_added: margin_for_increase,
            opened: true,
            closed: false,
        };
    }

    // partial close, entry price unchanged
    PositionFill {
        position: Some(Position {
            quantity: SignedQty::new(old_qty.signum() * remaining_abs),
            realized_pnl: position.realized_pnl.add(realized),
            margin_blocked: position.margin_blocked.sub(margin_released),
            updated_at: timestamp,
            ..position.clone()
        }),
        realized_pnl: realized,
        margin_released,
        margin_added: Cash::zero(),
        opened: false,
        closed: false,
    }
}
