// 8.0: trading engine. order placement and execution, applying fills to
// positions, quote ticks, margin levels and stop out. split into impl blocks
// per concern, all sharing the state held in core.rs.

mod config;
mod core;
mod execution;
mod liquidations;
mod orders;
mod pending;
mod positions;
mod pricing;
mod results;

pub use config::EngineConfig;
pub use core::{EngineDeps, TradingEngine};
pub use results::{EngineError, PositionCloseOutcome, PositionCloseResult, PositionsCloseData};
