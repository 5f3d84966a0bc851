//! Order placement, cancellation, and user-initiated closes.

use super::core::Engine;
use super::results::EngineError;
use crate::events::{EventPayload, OrderCancelledEvent, OrderPlacedEvent};
use crate::order::{Order, OrderError, OrderRequest, OrderStatus, OrderType};
use crate::position::required_margin;
use crate::types::{Cash, InstrumentToken, OrderId, Price, Side, UserId};
use crate::wallet::ReferenceType;
use rust_decimal::Decimal;

impl Engine {
    fn next_order_id(&mut self) -> OrderId {
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        id
    }

    /// Quantity of `qty` that increases exposure rather than reducing an
    /// opposing position. Only the increase needs fresh margin.
    pub(super) fn increase_quantity(
        &self,
        user_id: UserId,
        token: InstrumentToken,
        side: Side,
        qty: Decimal,
    ) -> Decimal {
        let held = self
            .positions
            .get(&user_id)
            .and_then(|m| m.get(&token));
        match held {
            Some(position) if position.side() == Some(side.opposite()) => {
                (qty - qty.min(position.quantity.abs())).max(Decimal::ZERO)
            }
            _ => qty,
        }
    }

    /// Validate, block required margin, open, and immediately evaluate the
    /// order against the latest retained tick. Validation and safety gates
    /// reject before any funds move.
    pub fn place_order(
        &mut self,
        user_id: UserId,
        request: OrderRequest,
    ) -> Result<Order, EngineError> {
        request.validate()?;

        // retries with the same key return the original order untouched
        let idem_key = (user_id, request.idempotency_key.clone());
        if let Some(existing_id) = self.idempotency.get(&idem_key) {
            let existing = self
                .orders
                .get(existing_id)
                .ok_or(EngineError::OrderNotFound(*existing_id))?;
            return Ok(existing.clone());
        }

        let instrument = self.catalogue.get(request.instrument_token)?.clone();
        if !instrument.is_tradable() {
            return Err(EngineError::NotTradable(instrument.token));
        }
        if self.halted.contains(&instrument.token) {
            return Err(EngineError::InstrumentHalted(instrument.token));
        }
        if !instrument.is_lot_multiple(request.quantity) {
            return Err(EngineError::Order(OrderError::NotLotMultiple {
                quantity: request.quantity,
                lot_size: instrument.lot_size,
            }));
        }
        if self.ledger.wallet(user_id).is_none() {
            return Err(EngineError::WalletNotFound(user_id));
        }

        // margin is estimated at the limit price for limit orders and at the
        // latest tick for market orders, which must therefore be fresh
        let reference_price: Price = match request.order_type {
            OrderType::Limit => request
                .limit_price
                .ok_or(EngineError::Order(OrderError::MissingLimitPrice))?,
            OrderType::Market => {
                let tick = self
                    .ticks
                    .latest(instrument.token)
                    .ok_or(EngineError::NoReferencePrice(instrument.token))?;
                if tick.is_stale(self.current_time, self.config.max_tick_age_secs) {
                    return Err(EngineError::StaleReferencePrice(instrument.token));
                }
                tick.price
            }
        };

        let increase_qty = self.increase_quantity(
            user_id,
            instrument.token,
            request.side,
            request.quantity,
        );
        let margin = if increase_qty > Decimal::ZERO {
            required_margin(
                instrument.kind,
                request.side,
                increase_qty,
                reference_price,
                &self.config.margin_rates,
            )
        } else {
            Cash::zero()
        };

        let order_id = self.next_order_id();
        let mut order = Order::new(order_id, user_id, &request, self.current_time);

        if margin.is_positive() {
            self.ledger.block(
                user_id,
                margin,
                ReferenceType::Order,
                order_id.0,
                self.current_time,
            )?;
            order.margin_blocked = margin;
        }

        order.status = OrderStatus::Open;
        self.open_orders
            .entry(order.instrument_token)
            .or_default()
            .push(order_id);
        self.idempotency.insert(idem_key, order_id);
        self.emit_event(EventPayload::OrderPlaced(OrderPlacedEvent {
            order_id,
            user_id,
            instrument_token: order.instrument_token,
            side: order.side,
            quantity: order.quantity,
            limit_price: order.limit_price,
            margin_blocked: order.margin_blocked,
            engine_initiated: false,
        }));
        self.orders.insert(order_id, order);

        self.try_fill_order(order_id)?;

        self.orders
            .get(&order_id)
            .cloned()
            .ok_or(EngineError::OrderNotFound(order_id))
    }

    /// Cancel an open order and release its reservation.
    pub fn cancel_order(
        &mut self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Order, EngineError> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;

        if order.user_id != user_id {
            return Err(EngineError::NotOrderOwner { order_id, user_id });
        }
        if order.engine_initiated {
            return Err(EngineError::EngineInitiatedOrder(order_id));
        }
        if !order.is_open() {
            return Err(EngineError::OrderNotOpen {
                order_id,
                status: order.status,
            });
        }

        let margin_blocked = order.margin_blocked;
        let token = order.instrument_token;

        if margin_blocked.is_positive() {
            self.ledger.unblock(
                user_id,
                margin_blocked,
                ReferenceType::Order,
                order_id.0,
                self.current_time,
            )?;
        }

        self.remove_open_order(token, order_id);
        let now = self.current_time;
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        order.status = OrderStatus::Cancelled;
        order.margin_blocked = Cash::zero();
        order.updated_at = now;
        let cancelled = order.clone();

        self.emit_event(EventPayload::OrderCancelled(OrderCancelledEvent {
            order_id,
            user_id,
            margin_unblocked: margin_blocked,
        }));

        Ok(cancelled)
    }

    /// User-initiated close, routed through the same fill path as any other
    /// order.
    pub fn close_position(
        &mut self,
        user_id: UserId,
        token: InstrumentToken,
        quantity: Option<Decimal>,
    ) -> Result<Order, EngineError> {
        let position = self
            .positions
            .get(&user_id)
            .and_then(|m| m.get(&token))
            .ok_or(EngineError::PositionNotFound {
                user_id,
                instrument_token: token,
            })?;

        let held = position.quantity.abs();
        let close_qty = quantity.unwrap_or(held);
        if close_qty > held {
            return Err(EngineError::CloseExceedsPosition {
                requested: close_qty,
                held,
            });
        }
        let side = match position.side() {
            Some(side) => side.opposite(),
            None => {
                return Err(EngineError::PositionNotFound {
                    user_id,
                    instrument_token: token,
                })
            }
        };

        let key = format!("close-{}-{}-{}", user_id.0, token.0, self.next_order_id);
        self.place_order(
            user_id,
            OrderRequest::market(token, side, close_qty, &key),
        )
    }

    /// Build a forced market close for the liquidation engine. Not evaluated
    /// here: the caller registers it as in-flight first, so a re-entrant tick
    /// can never double-submit.
    pub(super) fn create_forced_close(
        &mut self,
        user_id: UserId,
        token: InstrumentToken,
        side: Side,
        quantity: Decimal,
    ) -> OrderId {
        let order_id = self.next_order_id();
        let key = format!("liq-{}-{}-{}", user_id.0, token.0, order_id.0);
        let request = OrderRequest::market(token, side, quantity, &key);
        let mut order = Order::new(order_id, user_id, &request, self.current_time);
        order.status = OrderStatus::Open;
        order.engine_initiated = true;

        self.open_orders
            .entry(token)
            .or_default()
            .push(order_id);
        self.idempotency
            .insert((user_id, key), order_id);
        self.emit_event(EventPayload::OrderPlaced(OrderPlacedEvent {
            order_id,
            user_id,
            instrument_token: token,
            side,
            quantity,
            limit_price: None,
            margin_blocked: Cash::zero(),
            engine_initiated: true,
        }));
        self.orders.insert(order_id, order);
        order_id
    }
}
