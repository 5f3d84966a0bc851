// 8.0 engine/core.rs: the stateful core. holds the catalogue projection, the
// latest-tick store, orders, positions, the wallet ledger, and the fill
// journal. all mutation funnels through &mut self, which is what lets the
// service layer serialize money-moving operations with a single writer.

use super::results::EngineError;
use crate::config::EngineConfig;
use crate::events::{Event, EventId, EventPayload, WalletEvent, WithdrawalRejectedEvent};
use crate::instrument::{Instrument, InstrumentCatalogue};
use crate::mtm::{compute_snapshot, MtmSnapshot};
use crate::order::Order;
use crate::position::Position;
use crate::tick::TickStore;
use crate::types::{Cash, InstrumentToken, OrderId, Timestamp, UserId};
use crate::wal::JournalStore;
use crate::wallet::{
    ReferenceType, Transaction, TransactionFilter, Wallet, WalletLedger,
};
use std::collections::{HashMap, HashSet};
use tracing::info;

pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) catalogue: InstrumentCatalogue,
    pub(super) ticks: TickStore,
    pub(super) orders: HashMap<OrderId, Order>,
    /// Open order ids per instrument, the set a tick has to evaluate.
    pub(super) open_orders: HashMap<InstrumentToken, Vec<OrderId>>,
    pub(super) idempotency: HashMap<(UserId, String), OrderId>,
    pub(super) positions: HashMap<UserId, HashMap<InstrumentToken, Position>>,
    /// Users with open exposure per instrument, the set a tick marks to market.
    pub(super) holders: HashMap<InstrumentToken, HashSet<UserId>>,
    pub(super) ledger: WalletLedger,
    /// In-flight forced close order ids per liquidating user.
    pub(super) forced_orders: HashMap<UserId, HashSet<OrderId>>,
    pub(super) halted: HashSet<InstrumentToken>,
    pub(super) journal: Box<dyn JournalStore>,
    pub(super) events: Vec<Event>,
    pub(super) next_event_id: u64,
    pub(super) next_order_id: u64,
    pub(super) next_intent_id: u64,
    pub(super) current_time: Timestamp,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalogue: InstrumentCatalogue,
        journal: Box<dyn JournalStore>,
    ) -> Self {
        Self {
            config,
            catalogue,
            ticks: TickStore::new(),
            orders: HashMap::new(),
            open_orders: HashMap::new(),
            idempotency: HashMap::new(),
            positions: HashMap::new(),
            holders: HashMap::new(),
            ledger: WalletLedger::new(),
            forced_orders: HashMap::new(),
            halted: HashSet::new(),
            journal,
            events: Vec::new(),
            next_event_id: 1,
            next_order_id: 1,
            next_intent_id: 1,
            current_time: Timestamp::from_secs(0),
        }
    }

    pub fn set_time(&mut self, timestamp: Timestamp) {
        self.current_time = timestamp;
    }

    pub fn advance_time(&mut self, secs: i64) {
        self.current_time = Timestamp::from_secs(self.current_time.as_secs() + secs);
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    pub fn catalogue(&self) -> &InstrumentCatalogue {
        &self.catalogue
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        self.config.sweep_interval
    }

    pub fn add_instrument(&mut self, instrument: Instrument) {
        self.catalogue.insert(instrument);
    }

    // --- wallet operations -------------------------------------------------

    pub fn deposit(&mut self, user_id: UserId, amount: Cash) -> Result<(), EngineError> {
        self.ledger
            .credit(user_id, amount, ReferenceType::Deposit, 0, self.current_time)?;
        let new_balance = self
            .ledger
            .wallet(user_id)
            .map(|w| w.balance)
            .unwrap_or_else(Cash::zero);

        self.emit_event(EventPayload::Deposit(WalletEvent {
            user_id,
            amount,
            new_balance,
        }));
        Ok(())
    }

    pub fn withdraw(&mut self, user_id: UserId, amount: Cash) -> Result<(), EngineError> {
        if let Err(err) =
            self.ledger
                .debit(user_id, amount, ReferenceType::Withdrawal, 0, self.current_time)
        {
            self.emit_event(EventPayload::WithdrawalRejected(WithdrawalRejectedEvent {
                user_id,
                amount,
                reason: err.to_string(),
            }));
            return Err(EngineError::Ledger(err));
        }
        let new_balance = self
            .ledger
            .wallet(user_id)
            .map(|w| w.balance)
            .unwrap_or_else(Cash::zero);

        self.emit_event(EventPayload::Withdrawal(WalletEvent {
            user_id,
            amount,
            new_balance,
        }));
        Ok(())
    }

    // --- read-only projections ---------------------------------------------

    pub fn get_wallet(&self, user_id: UserId) -> Option<Wallet> {
        self.ledger.wallet(user_id).cloned()
    }

    pub fn get_positions(&self, user_id: UserId) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .get(&user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        positions.sort_by_key(|p| p.instrument_token);
        positions
    }

    pub fn get_transactions(
        &self,
        user_id: UserId,
        filter: &TransactionFilter,
    ) -> Vec<Transaction> {
        self.ledger.transactions(user_id, filter)
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn open_order_count(&self, token: InstrumentToken) -> usize {
        self.open_orders.get(&token).map_or(0, Vec::len)
    }

    pub fn latest_tick(&self, token: InstrumentToken) -> Option<&crate::tick::Tick> {
        self.ticks.latest(token)
    }

    /// Audit projection: rebuild a wallet by ledger replay.
    pub fn recalculate_wallet(&self, user_id: UserId) -> Result<Wallet, EngineError> {
        Ok(self.ledger.recalculate_from_ledger(user_id)?)
    }

    pub fn snapshot_for(&self, user_id: UserId) -> Option<MtmSnapshot> {
        let wallet = self.ledger.wallet(user_id)?;
        let positions = self.positions.get(&user_id);
        Some(compute_snapshot(
            user_id,
            wallet.balance,
            positions.into_iter().flat_map(|m| m.values()),
            &self.ticks,
            &self.config.margin_curve,
        ))
    }

    // --- trading halts -----------------------------------------------------

    pub fn halt_instrument(&mut self, token: InstrumentToken) {
        if self.halted.insert(token) {
            info!(token = token.0, "trading halted");
            self.emit_event(EventPayload::TradingHalted(token));
        }
    }

    pub fn resume_instrument(&mut self, token: InstrumentToken) {
        if self.halted.remove(&token) {
            info!(token = token.0, "trading resumed");
            self.emit_event(EventPayload::TradingResumed(token));
        }
    }

    pub fn is_halted(&self, token: InstrumentToken) -> bool {
        self.halted.contains(&token)
    }

    // --- audit trail -------------------------------------------------------

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn recent_events(&self, count: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(count);
        &self.events[start..]
    }

    pub(super) fn emit_event(&mut self, payload: EventPayload) {
        let event = Event::new(EventId(self.next_event_id), self.current_time, payload);
        self.next_event_id += 1;
        self.events.push(event);

        if self.events.len() > self.config.max_events {
            let drain_count = self.events.len() - self.config.max_events;
            self.events.drain(0..drain_count);
        }
    }

    // --- hydration from the external durable store ---------------------------

    /// Direct ledger access for hydration and audit tooling. The ledger
    /// enforces its own invariants, so this cannot bypass them.
    pub fn ledger(&self) -> &WalletLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut WalletLedger {
        &mut self.ledger
    }

    /// Load a persisted order row. Replaces any cached copy and keeps the
    /// open-order index consistent with the row's status.
    pub fn restore_order(&mut self, order: Order) {
        let order_id = order.id;
        let token = order.instrument_token;
        self.remove_open_order(token, order_id);
        if order.is_open() {
            self.open_orders.entry(token).or_default().push(order_id);
        }
        self.idempotency
            .insert((order.user_id, order.idempotency_key.clone()), order_id);
        if order_id.0 >= self.next_order_id {
            self.next_order_id = order_id.0 + 1;
        }
        self.orders.insert(order_id, order);
    }

    /// Load a persisted position row.
    pub fn restore_position(&mut self, position: Position) {
        self.store_position(position.user_id, position);
    }

    // --- internal bookkeeping ----------------------------------------------

    pub(super) fn store_position(&mut self, user_id: UserId, position: Position) {
        self.holders
            .entry(position.instrument_token)
            .or_default()
            .insert(user_id);
        self.positions
            .entry(user_id)
            .or_default()
            .insert(position.instrument_token, position);
    }

    pub(super) fn drop_position(&mut self, user_id: UserId, token: InstrumentToken) {
        if let Some(user_positions) = self.positions.get_mut(&user_id) {
            user_positions.remove(&token);
            if user_positions.is_empty() {
                self.positions.remove(&user_id);
            }
        }
        if let Some(holders) = self.holders.get_mut(&token) {
            holders.remove(&user_id);
            if holders.is_empty() {
                self.holders.remove(&token);
            }
        }
    }

    pub(super) fn remove_open_order(&mut self, token: InstrumentToken, order_id: OrderId) {
        if let Some(ids) = self.open_orders.get_mut(&token) {
            ids.retain(|id| *id != order_id);
            if ids.is_empty() {
                self.open_orders.remove(&token);
            }
        }
    }
}
