// engine module: state in core.rs, operations split by concern.

mod core;
mod fills;
mod liquidations;
mod orders;
mod results;

pub use self::core::Engine;
pub use self::results::{EngineError, RecoveryReport, SweepReport, TickReport};
