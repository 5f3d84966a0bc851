//! Tick-driven fill evaluation and the journaled fill transition.
//!
//! A fill spans three entities with no shared atomic primitive, so the
//! sequence is: journal the intent, mark the order filled, apply position
//! and ledger effects, mark the intent committed. Startup recovery walks
//! pending intents and either finishes or discards them.

use super::core::Engine;
use super::results::{EngineError, RecoveryReport, TickReport};
use crate::events::{
    BadDebtEvent, EventPayload, OrderFilledEvent, OrderRejectedEvent, PositionClosedEvent,
    PositionEvent,
};
use crate::fill::{resolve_fill, FillDecision, FillOutcome, FillParams};
use crate::order::{OrderStatus, OrderType, RejectReason};
use crate::position::{apply_fill, required_margin};
use crate::tick::Tick;
use crate::types::{Cash, OrderId, UserId};
use crate::wal::{FillIntent, IntentId, IntentState};
use crate::wallet::{LedgerError, ReferenceType, SettlementSpec};
use rust_decimal::Decimal;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FillAttempt {
    Filled,
    Resting,
    Rejected,
    Skipped,
}

impl Engine {
    /// One tick cycle: retain the tick, evaluate open orders on that
    /// instrument in id order, then mark holders of the instrument to market.
    pub fn on_tick(&mut self, tick: Tick) -> Result<TickReport, EngineError> {
        self.current_time = self.current_time.later_of(tick.timestamp);
        let token = tick.instrument_token;
        self.ticks.apply(tick);

        let mut report = TickReport::default();

        let mut order_ids: Vec<OrderId> =
            self.open_orders.get(&token).cloned().unwrap_or_default();
        order_ids.sort();
        for order_id in order_ids {
            match self.try_fill_order(order_id)? {
                FillAttempt::Filled => report.fills += 1,
                FillAttempt::Rejected => report.rejections += 1,
                _ => {}
            }
        }

        let mut users: Vec<UserId> = self
            .holders
            .get(&token)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        users.sort();
        for user_id in users {
            let outcome = self.mtm_check(user_id)?;
            if outcome.started {
                report.liquidations_started += 1;
            }
            if outcome.completed {
                report.liquidations_completed += 1;
            }
        }

        Ok(report)
    }

    pub(super) fn try_fill_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<FillAttempt, EngineError> {
        let order = match self.orders.get(&order_id) {
            Some(order) if order.is_open() => order.clone(),
            _ => return Ok(FillAttempt::Skipped),
        };

        let Some(instrument) = self.catalogue.lookup(order.instrument_token).cloned() else {
            // identity lost underneath an open order
            if order.engine_initiated {
                return Ok(FillAttempt::Resting);
            }
            self.reject_order(order_id, RejectReason::UnresolvedInstrument)?;
            return Ok(FillAttempt::Rejected);
        };
        let Some(tick) = self.ticks.latest(order.instrument_token).cloned() else {
            return Ok(FillAttempt::Resting);
        };

        let params = FillParams {
            slippage: self.config.slippage,
            max_tick_age_secs: self.config.max_tick_age_secs,
            halted: self.halted.contains(&order.instrument_token),
        };
        let decision = resolve_fill(&order, &instrument, &tick, self.current_time, &params);

        match decision.outcome {
            FillOutcome::Filled => {
                self.apply_fill_decision(order_id, &decision)?;
                Ok(FillAttempt::Filled)
            }
            FillOutcome::Resting => Ok(FillAttempt::Resting),
            FillOutcome::Rejected(reason) => {
                // forced closes are engine-initiated and must survive
                // transient gates; they retry on the next tick or sweep
                if order.engine_initiated {
                    debug!(order_id = order_id.0, ?reason, "forced close deferred");
                    return Ok(FillAttempt::Resting);
                }
                // a resting limit order is not punished for a stale or
                // halted stream; market orders get the typed rejection
                if order.order_type == OrderType::Limit
                    && matches!(
                        reason,
                        RejectReason::StalePrice | RejectReason::TradingHalted
                    )
                {
                    return Ok(FillAttempt::Resting);
                }
                self.reject_order(order_id, reason)?;
                Ok(FillAttempt::Rejected)
            }
        }
    }

    /// Journal, mark filled, apply effects, commit.
    fn apply_fill_decision(
        &mut self,
        order_id: OrderId,
        decision: &FillDecision,
    ) -> Result<(), EngineError> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?
            .clone();
        let Some(execution_price) = decision.execution_price else {
            return Ok(());
        };

        let intent = FillIntent {
            id: IntentId(self.next_intent_id),
            order_id,
            user_id: order.user_id,
            instrument_token: order.instrument_token,
            side: order.side,
            quantity: decision.fillable_quantity,
            execution_price,
            engine_initiated: order.engine_initiated,
            created_at: self.current_time,
        };
        self.next_intent_id += 1;
        self.journal.append_intent(&intent)?;

        // first effect: the order row flips to filled
        let now = self.current_time;
        if let Some(stored) = self.orders.get_mut(&order_id) {
            stored.status = OrderStatus::Filled;
            stored.execution_price = Some(execution_price);
            stored.updated_at = now;
        }
        self.remove_open_order(order.instrument_token, order_id);

        self.apply_fill_effects(&intent, order.margin_blocked)?;
        self.journal.mark_committed(intent.id)?;
        Ok(())
    }

    /// Position and ledger effects of a journaled intent. Shared between the
    /// live path and startup recovery.
    fn apply_fill_effects(
        &mut self,
        intent: &FillIntent,
        order_block: Cash,
    ) -> Result<(), EngineError> {
        let user_id = intent.user_id;
        let token = intent.instrument_token;

        let increase_qty =
            self.increase_quantity(user_id, token, intent.side, intent.quantity);
        let margin_added = match self.catalogue.lookup(token) {
            Some(instrument) if increase_qty > Decimal::ZERO => required_margin(
                instrument.kind,
                intent.side,
                increase_qty,
                intent.execution_price,
                &self.config.margin_rates,
            ),
            _ => Cash::zero(),
        };

        let existing = self
            .positions
            .get(&user_id)
            .and_then(|m| m.get(&token))
            .cloned();
        let result = apply_fill(
            existing.as_ref(),
            user_id,
            token,
            intent.side,
            intent.quantity,
            intent.execution_price,
            margin_added,
            self.current_time,
        );

        let spec = SettlementSpec {
            release: order_block.add(result.margin_released),
            reblock: result.margin_added,
            balance_delta: result.realized_pnl,
        };
        match self.ledger.settle(
            user_id,
            spec,
            ReferenceType::Fill,
            intent.order_id.0,
            self.current_time,
        ) {
            Ok(_) => {}
            Err(
                LedgerError::BalanceWouldGoNegative { .. }
                | LedgerError::BlockedWouldExceedBalance { .. },
            ) => {
                self.settle_bankrupt(intent, spec)?;
            }
            Err(err) => return Err(EngineError::Ledger(err)),
        }

        match &result.position {
            Some(position) => {
                let payload = PositionEvent {
                    user_id,
                    instrument_token: token,
                    quantity: position.quantity,
                    average_price: position.average_price,
                };
                self.store_position(user_id, position.clone());
                if result.opened {
                    self.emit_event(EventPayload::PositionOpened(payload));
                } else {
                    self.emit_event(EventPayload::PositionUpdated(payload));
                }
            }
            None => {
                self.drop_position(user_id, token);
                self.emit_event(EventPayload::PositionClosed(PositionClosedEvent {
                    user_id,
                    instrument_token: token,
                    realized_pnl: result.realized_pnl,
                }));
            }
        }

        self.emit_event(EventPayload::OrderFilled(OrderFilledEvent {
            order_id: intent.order_id,
            user_id,
            instrument_token: token,
            side: intent.side,
            quantity: intent.quantity,
            execution_price: intent.execution_price,
            realized_pnl: result.realized_pnl,
        }));

        // liquidation bookkeeping: when the last in-flight forced close
        // settles, re-check the account so it can leave LIQUIDATING
        if intent.engine_initiated {
            let drained = match self.forced_orders.get_mut(&user_id) {
                Some(set) => {
                    set.remove(&intent.order_id);
                    set.is_empty()
                }
                None => false,
            };
            if drained {
                self.forced_orders.remove(&user_id);
                self.mtm_check(user_id)?;
            }
        }

        Ok(())
    }

    /// A forced close realized a loss deeper than the wallet can absorb. The
    /// ledger rejected the over-debit; post the largest admissible settlement
    /// and surface the shortfall as bad debt.
    fn settle_bankrupt(
        &mut self,
        intent: &FillIntent,
        spec: SettlementSpec,
    ) -> Result<(), EngineError> {
        let wallet = self
            .ledger
            .wallet(intent.user_id)
            .ok_or(EngineError::WalletNotFound(intent.user_id))?;

        let new_blocked = wallet
            .blocked_balance
            .sub(spec.release)
            .add(spec.reblock)
            .max(Cash::zero());
        // smallest balance delta the invariants allow
        let admissible = new_blocked.sub(wallet.balance);

        if spec.balance_delta >= admissible {
            // not actually a depth problem; surface the original rejection
            return Err(EngineError::Ledger(LedgerError::BalanceWouldGoNegative {
                balance: wallet.balance,
                delta: spec.balance_delta,
            }));
        }

        let shortfall = admissible.sub(spec.balance_delta);
        let loss = spec.balance_delta.abs();

        self.ledger.settle(
            intent.user_id,
            SettlementSpec {
                balance_delta: admissible,
                ..spec
            },
            ReferenceType::Liquidation,
            intent.order_id.0,
            self.current_time,
        )?;

        warn!(
            user_id = intent.user_id.0,
            %loss,
            %shortfall,
            "bankruptcy: loss exceeded wallet, shortfall written off"
        );
        self.emit_event(EventPayload::BadDebt(BadDebtEvent {
            user_id: intent.user_id,
            order_id: intent.order_id,
            loss,
            absorbed: loss.sub(shortfall),
            shortfall,
        }));
        Ok(())
    }

    pub(super) fn reject_order(
        &mut self,
        order_id: OrderId,
        reason: RejectReason,
    ) -> Result<(), EngineError> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?
            .clone();

        if order.margin_blocked.is_positive() {
            self.ledger.unblock(
                order.user_id,
                order.margin_blocked,
                ReferenceType::Order,
                order_id.0,
                self.current_time,
            )?;
        }

        self.remove_open_order(order.instrument_token, order_id);
        let now = self.current_time;
        if let Some(stored) = self.orders.get_mut(&order_id) {
            stored.status = OrderStatus::Rejected;
            stored.reject_reason = Some(reason);
            stored.margin_blocked = Cash::zero();
            stored.updated_at = now;
        }

        self.emit_event(EventPayload::OrderRejected(OrderRejectedEvent {
            order_id,
            user_id: order.user_id,
            reason,
            margin_unblocked: order.margin_blocked,
        }));
        Ok(())
    }

    /// Startup recovery: finish or discard journaled-but-unconfirmed intents.
    ///
    /// An intent whose order never flipped to filled took no effect and is
    /// discarded; the order will simply re-evaluate on the next tick. An
    /// intent whose order is filled but whose settlement is missing is
    /// completed. One that fully landed just gets its commit mark.
    pub fn recover_uncommitted(&mut self) -> Result<RecoveryReport, EngineError> {
        let entries = self.journal.load()?;
        let mut report = RecoveryReport::default();

        for (intent, state) in entries {
            // fresh intents must never reuse a journaled id
            if intent.id.0 >= self.next_intent_id {
                self.next_intent_id = intent.id.0 + 1;
            }
            if state == IntentState::Committed {
                continue;
            }
            let filled = self
                .orders
                .get(&intent.order_id)
                .map(|o| o.status == OrderStatus::Filled)
                .unwrap_or(false);

            if !filled {
                debug!(order_id = intent.order_id.0, "discarding unapplied intent");
                report.discarded += 1;
                continue;
            }

            if self
                .ledger
                .has_settlement_for(intent.user_id, intent.order_id.0)
            {
                self.journal.mark_committed(intent.id)?;
                report.reconfirmed += 1;
            } else {
                let order_block = self
                    .orders
                    .get(&intent.order_id)
                    .map(|o| o.margin_blocked)
                    .unwrap_or_else(Cash::zero);
                self.remove_open_order(intent.instrument_token, intent.order_id);
                self.apply_fill_effects(&intent, order_block)?;
                self.journal.mark_committed(intent.id)?;
                report.replayed += 1;
            }
        }

        Ok(report)
    }
}
