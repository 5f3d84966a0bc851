// 8.0.2: result types and errors for engine operations.

use crate::instrument::CatalogueError;
use crate::order::{OrderError, OrderStatus};
use crate::types::{InstrumentToken, OrderId, UserId};
use crate::wal::WalError;
use crate::wallet::LedgerError;
use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Instrument error: {0}")]
    Catalogue(#[from] CatalogueError),

    #[error("Instrument {0} is not tradable")]
    NotTradable(InstrumentToken),

    #[error("Trading halted for instrument {0}")]
    InstrumentHalted(InstrumentToken),

    #[error("No reference price for instrument {0}")]
    NoReferencePrice(InstrumentToken),

    #[error("Reference price for instrument {0} is stale")]
    StaleReferencePrice(InstrumentToken),

    #[error("Order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("Order {order_id:?} does not belong to user {user_id:?}")]
    NotOrderOwner { order_id: OrderId, user_id: UserId },

    #[error("Order {order_id:?} is {status:?}, not open")]
    OrderNotOpen {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("Order {0:?} is engine-initiated and cannot be cancelled")]
    EngineInitiatedOrder(OrderId),

    #[error("No wallet for user {0:?}")]
    WalletNotFound(UserId),

    #[error("No position for user {user_id:?} on instrument {instrument_token}")]
    PositionNotFound {
        user_id: UserId,
        instrument_token: InstrumentToken,
    },

    #[error("Close quantity {requested} exceeds position size {held}")]
    CloseExceedsPosition { requested: Decimal, held: Decimal },

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Journal error: {0}")]
    Wal(#[from] WalError),
}

/// What one tick cycle did.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub fills: usize,
    pub rejections: usize,
    pub liquidations_started: usize,
    pub liquidations_completed: usize,
}

/// What a full MTM sweep did.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub users_checked: usize,
    pub liquidations_started: usize,
    pub liquidations_completed: usize,
}

/// What startup recovery did with journaled intents.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    /// Intents whose effects were completed during recovery.
    pub replayed: usize,
    /// Intents discarded because their order will simply re-evaluate.
    pub discarded: usize,
    /// Intents whose effects had fully landed and only needed the commit mark.
    pub reconfirmed: usize,
}
