//! Order types and lifecycle.
//!
//! Orders fill against the upstream price stream, not against each other.
//! Status moves Pending -> Open at placement, then Open -> Filled/Rejected
//! only through the fill engine, or Open -> Cancelled through explicit
//! cancellation. An idempotency key deduplicates client retries.

use crate::types::{Cash, InstrumentToken, OrderId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Executes against the latest tick, slippage-adjusted.
    Market,
    /// Rests until the stream crosses the limit price.
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// Typed reason a pre-trade safety gate refused an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    StalePrice,
    UnresolvedInstrument,
    TradingHalted,
    NotTradable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub instrument_token: InstrumentToken,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Price>,
    pub status: OrderStatus,
    pub execution_price: Option<Price>,
    pub reject_reason: Option<RejectReason>,
    pub idempotency_key: String,
    /// Margin reserved against this order while it is open.
    pub margin_blocked: Cash,
    /// Forced closes submitted by the liquidation engine, not a user.
    pub engine_initiated: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Order {
    pub fn new(
        id: OrderId,
        user_id: UserId,
        request: &OrderRequest,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            instrument_token: request.instrument_token,
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: request.limit_price,
            status: OrderStatus::Pending,
            execution_price: None,
            reject_reason: None,
            idempotency_key: request.idempotency_key.clone(),
            margin_blocked: Cash::zero(),
            engine_initiated: false,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Client-supplied order parameters, validated before any state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument_token: InstrumentToken,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Price>,
    pub idempotency_key: String,
}

impl OrderRequest {
    pub fn market(
        instrument_token: InstrumentToken,
        side: Side,
        quantity: Decimal,
        idempotency_key: &str,
    ) -> Self {
        Self {
            instrument_token,
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            idempotency_key: idempotency_key.to_string(),
        }
    }

    pub fn limit(
        instrument_token: InstrumentToken,
        side: Side,
        quantity: Decimal,
        limit_price: Price,
        idempotency_key: &str,
    ) -> Self {
        Self {
            instrument_token,
            side,
            quantity,
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            idempotency_key: idempotency_key.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), OrderError> {
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::QuantityNotPositive(self.quantity));
        }
        match self.order_type {
            OrderType::Limit if self.limit_price.is_none() => Err(OrderError::MissingLimitPrice),
            OrderType::Market if self.limit_price.is_some() => {
                Err(OrderError::UnexpectedLimitPrice)
            }
            _ if self.idempotency_key.is_empty() => Err(OrderError::MissingIdempotencyKey),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("Quantity must be positive, got {0}")]
    QuantityNotPositive(Decimal),

    #[error("Limit order requires a limit price")]
    MissingLimitPrice,

    #[error("Market order must not carry a limit price")]
    UnexpectedLimitPrice,

    #[error("Order request requires an idempotency key")]
    MissingIdempotencyKey,

    #[error("Quantity {quantity} is not a multiple of lot size {lot_size}")]
    NotLotMultiple { quantity: Decimal, lot_size: u32 },
}
