// venue-core: risk and execution engine for a simulated trading venue.
// margin-first architecture: the wallet ledger and liquidation math take
// priority. fills come from a single upstream price stream, never a book.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: tokens, ids, Price, Cash, SignedQty, Bps
//   2.x  tick.rs: canonical tick + latest-tick store
//   3.x  position.rs: position struct, pnl, open/increase/reduce/flip
//   4.x  instrument.rs: contract metadata, catalogue, tick-size rounding
//   5.x  fill.rs: pure fill decision: slippage, limit cross, safety gates
//   6.x  margin_curve.rs: tiered maintenance margin, validated monotonic
//   7.x  wallet.rs: append-only ledger + balance/blocked projection
//   8.x  engine/: stateful core: orders, fills, liquidations, sweep
//   9.x  events.rs: state transition events for audit
//   10.x wal.rs: fill-intent journal and crash recovery
//   11.x feed.rs: ref-counted upstream subscriptions, batching, breaker
//   11.1 normalizer.rs: raw payloads -> ticks, identity resolution
//   11.2 bus.rs: tick fan-out with per-consumer error isolation
//   12.x service.rs: single-writer command loop over the engine
//   13.x health.rs: operational health surface

// core trading modules
pub mod engine;
pub mod events;
pub mod fill;
pub mod instrument;
pub mod margin_curve;
pub mod mtm;
pub mod order;
pub mod position;
pub mod tick;
pub mod types;
pub mod wallet;

// feed pipeline modules
pub mod bus;
pub mod feed;
pub mod normalizer;

// integration modules
pub mod config;
pub mod health;
pub mod service;
pub mod wal;

// re exports for convenience
pub use bus::{TickBus, TickConsumer};
pub use config::{EngineConfig, FeedConfig, SessionHours};
pub use engine::{Engine, EngineError, RecoveryReport, SweepReport, TickReport};
pub use events::{Event, EventId, EventPayload};
pub use feed::{FeedError, FeedHealth, FeedSupervisor, SessionState, UpstreamFeed};
pub use fill::{resolve_fill, FillDecision, FillOutcome, FillParams};
pub use health::{health_snapshot, HealthSnapshot};
pub use instrument::{Instrument, InstrumentCatalogue, InstrumentKind, OptionKind};
pub use margin_curve::{MarginCurve, MarginTier};
pub use mtm::MtmSnapshot;
pub use normalizer::TickNormalizer;
pub use order::{Order, OrderRequest, OrderStatus, OrderType, RejectReason};
pub use position::{MarginRates, Position};
pub use service::{spawn_engine, EngineCommand, EngineHandle, ServiceError};
pub use tick::{Tick, TickStore};
pub use types::{Bps, Cash, InstrumentToken, OrderId, Price, Side, SignedQty, Timestamp, TxnId, UserId};
pub use wal::{FileJournal, FillIntent, JournalStore, MemJournal};
pub use wallet::{
    AccountState, LedgerError, ReferenceType, SettlementSpec, Transaction, TransactionFilter,
    TxnType, Wallet, WalletLedger,
};
