//! MTM checks, liquidation detection, forced closes, and the safety sweep.
//!
//! Per-user state machine: NORMAL -> (maintenance margin catches equity) ->
//! LIQUIDATING -> (forced closes settle, equity clears maintenance) ->
//! NORMAL. Forced closes are submitted deterministically and tracked as
//! in-flight, so a re-entrant tick during a liquidation never duplicates
//! them.

use super::core::Engine;
use super::results::{EngineError, SweepReport};
use crate::events::{
    EventPayload, ForcedCloseEvent, LiquidationCompletedEvent, LiquidationStartedEvent,
    OrderCancelledEvent,
};
use crate::mtm::MtmSnapshot;
use crate::order::OrderStatus;
use crate::types::{Cash, InstrumentToken, OrderId, Side, UserId};
use crate::wallet::AccountState;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct MtmOutcome {
    pub started: bool,
    pub completed: bool,
}

impl Engine {
    /// Recompute one user's risk and drive the liquidation state machine.
    pub(super) fn mtm_check(&mut self, user_id: UserId) -> Result<MtmOutcome, EngineError> {
        let mut outcome = MtmOutcome::default();

        let Some(wallet) = self.ledger.wallet(user_id) else {
            return Ok(outcome);
        };
        let state = wallet.account_state;
        let Some(snapshot) = self.snapshot_for(user_id) else {
            return Ok(outcome);
        };
        let eligible = snapshot.is_liquidation_eligible(&self.config.margin_curve);

        // forced closes already in flight: no duplicate submission, just
        // nudge the outstanding orders, or stand down if equity recovered
        let in_flight: Vec<OrderId> = self
            .forced_orders
            .get(&user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if !in_flight.is_empty() {
            if state == AccountState::Liquidating && !eligible {
                self.cancel_forced_closes(user_id, &in_flight)?;
                self.finish_liquidation(user_id, &snapshot);
                outcome.completed = true;
            } else {
                for order_id in in_flight {
                    self.try_fill_order(order_id)?;
                }
            }
            return Ok(outcome);
        }

        let has_positions = self
            .positions
            .get(&user_id)
            .map_or(false, |m| !m.is_empty());

        match state {
            AccountState::Normal if eligible && has_positions => {
                self.start_liquidation(user_id, &snapshot)?;
                outcome.started = true;
            }
            AccountState::Liquidating => {
                if !has_positions || !eligible {
                    self.finish_liquidation(user_id, &snapshot);
                    outcome.completed = true;
                } else {
                    // closes were deferred or lost; the sweep re-submits
                    warn!(user_id = user_id.0, "re-submitting forced closes");
                    self.submit_forced_closes(user_id)?;
                }
            }
            _ => {}
        }

        Ok(outcome)
    }

    fn start_liquidation(
        &mut self,
        user_id: UserId,
        snapshot: &MtmSnapshot,
    ) -> Result<(), EngineError> {
        let flagged = self.positions.get(&user_id).map_or(0, |m| m.len());
        info!(
            user_id = user_id.0,
            equity = %snapshot.equity,
            maintenance = %snapshot.maintenance_margin,
            "liquidation started"
        );
        self.ledger
            .set_account_state(user_id, AccountState::Liquidating);
        self.emit_event(EventPayload::LiquidationStarted(LiquidationStartedEvent {
            user_id,
            equity: snapshot.equity,
            required_margin: snapshot.required_margin,
            maintenance_margin: snapshot.maintenance_margin,
            positions_flagged: flagged,
        }));
        self.submit_forced_closes(user_id)
    }

    fn finish_liquidation(&mut self, user_id: UserId, snapshot: &MtmSnapshot) {
        let remaining = self.positions.get(&user_id).map_or(0, |m| m.len());
        info!(user_id = user_id.0, equity = %snapshot.equity, "liquidation completed");
        self.ledger
            .set_account_state(user_id, AccountState::Normal);
        self.emit_event(EventPayload::LiquidationCompleted(
            LiquidationCompletedEvent {
                user_id,
                equity: snapshot.equity,
                positions_remaining: remaining,
            },
        ));
    }

    /// Submit forced market closes for every open position, largest required
    /// margin first with the instrument token as tie-break. All orders are
    /// registered as in-flight before any is evaluated.
    fn submit_forced_closes(&mut self, user_id: UserId) -> Result<(), EngineError> {
        let mut plan: Vec<(Cash, InstrumentToken, Side, Decimal)> = Vec::new();
        if let Some(user_positions) = self.positions.get(&user_id) {
            for position in user_positions.values() {
                let Some(side) = position.side() else { continue };
                plan.push((
                    position.margin_blocked,
                    position.instrument_token,
                    side.opposite(),
                    position.quantity.abs(),
                ));
            }
        }
        plan.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut submitted = Vec::with_capacity(plan.len());
        for (_, token, close_side, quantity) in plan {
            let order_id = self.create_forced_close(user_id, token, close_side, quantity);
            self.forced_orders
                .entry(user_id)
                .or_default()
                .insert(order_id);
            self.emit_event(EventPayload::ForcedCloseSubmitted(ForcedCloseEvent {
                user_id,
                order_id,
                instrument_token: token,
                quantity,
            }));
            submitted.push(order_id);
        }

        for order_id in submitted {
            self.try_fill_order(order_id)?;
        }
        Ok(())
    }

    fn cancel_forced_closes(
        &mut self,
        user_id: UserId,
        order_ids: &[OrderId],
    ) -> Result<(), EngineError> {
        for &order_id in order_ids {
            let Some(order) = self.orders.get(&order_id) else {
                continue;
            };
            if !order.is_open() {
                continue;
            }
            let token = order.instrument_token;
            self.remove_open_order(token, order_id);
            let now = self.current_time;
            if let Some(stored) = self.orders.get_mut(&order_id) {
                stored.status = OrderStatus::Cancelled;
                stored.updated_at = now;
            }
            self.emit_event(EventPayload::OrderCancelled(OrderCancelledEvent {
                order_id,
                user_id,
                margin_unblocked: Cash::zero(),
            }));
        }
        self.forced_orders.remove(&user_id);
        Ok(())
    }

    /// Full MTM pass over every user with exposure or a liquidation in
    /// progress. Safety net for dormant accounts and for instruments whose
    /// ticks stopped arriving.
    pub fn sweep(&mut self) -> Result<SweepReport, EngineError> {
        let mut users: BTreeSet<UserId> = self.positions.keys().copied().collect();
        users.extend(self.forced_orders.keys().copied());
        // accounts parked in LIQUIDATING with nothing in flight still need
        // the state machine driven forward
        users.extend(
            self.ledger
                .wallets()
                .filter(|w| w.account_state == AccountState::Liquidating)
                .map(|w| w.user_id),
        );

        let mut report = SweepReport::default();
        for user_id in users {
            report.users_checked += 1;
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
}
