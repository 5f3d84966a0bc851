// 9.0: every state change produces an event. used for audit trails and for
// notifying external systems. the EventPayload enum lists all event types.

use crate::order::RejectReason;
use crate::types::{Cash, InstrumentToken, OrderId, Price, Side, SignedQty, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Order events
    OrderPlaced(OrderPlacedEvent),
    OrderFilled(OrderFilledEvent),
    OrderCancelled(OrderCancelledEvent),
    OrderRejected(OrderRejectedEvent),

    // Position events
    PositionOpened(PositionEvent),
    PositionUpdated(PositionEvent),
    PositionClosed(PositionClosedEvent),

    // Risk events
    LiquidationStarted(LiquidationStartedEvent),
    ForcedCloseSubmitted(ForcedCloseEvent),
    LiquidationCompleted(LiquidationCompletedEvent),
    BadDebt(BadDebtEvent),

    // Wallet events
    Deposit(WalletEvent),
    Withdrawal(WalletEvent),
    WithdrawalRejected(WithdrawalRejectedEvent),

    // Market state events
    TradingHalted(InstrumentToken),
    TradingResumed(InstrumentToken),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Option<Price>,
    pub margin_blocked: Cash,
    pub engine_initiated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilledEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub side: Side,
    pub quantity: Decimal,
    pub execution_price: Price,
    pub realized_pnl: Cash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub margin_unblocked: Cash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRejectedEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub reason: RejectReason,
    pub margin_unblocked: Cash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub quantity: SignedQty,
    pub average_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub realized_pnl: Cash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationStartedEvent {
    pub user_id: UserId,
    pub equity: Cash,
    pub required_margin: Cash,
    pub maintenance_margin: Cash,
    pub positions_flagged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcedCloseEvent {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub instrument_token: InstrumentToken,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationCompletedEvent {
    pub user_id: UserId,
    pub equity: Cash,
    pub positions_remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadDebtEvent {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub loss: Cash,
    pub absorbed: Cash,
    pub shortfall: Cash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEvent {
    pub user_id: UserId,
    pub amount: Cash,
    pub new_balance: Cash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRejectedEvent {
    pub user_id: UserId,
    pub amount: Cash,
    pub reason: String,
}
