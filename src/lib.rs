// margin-core: risk and execution core for a margin trading platform.
// orders and positions live in an in-memory cache, margin and PnL are
// computed lazily and re-evaluated on every quote tick.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: ids, directions, order kinds, timestamps, rounding
//   2.x  assets.rs: assets, pairs, instruments, trading conditions
//   3.x  order.rs: order state machine, fills, reasons
//   4.x  position.rs: open positions, partial and full close
//   5.x  account.rs: accounts, margin levels, aggregate state
//   5.1x account_store.rs, fpl.rs, margin.rs: account registry, lazy PnL cache, calculator
//   6.x  matching.rs: market maker, STP and special liquidation engines, router
//   6.1x book.rs, quotes.rs: liquidity book, best bid/ask store
//   7.x  validation.rs: pre-trade checks
//   8.x  engine/: placement, execution, positions, ticks, stop out
//   9.x  cache.rs: order partitions and position index
//   11.x events.rs: events published by the engine
//   12.x persistence.rs: periodic dump and warm restart
//   13.x liquidation.rs: liquidation saga contract
//   14.x services.rs: clock, ids, task dispatch, execution tokens

// domain
pub mod account;
pub mod assets;
pub mod order;
pub mod position;
pub mod types;

// state
pub mod account_store;
pub mod cache;
pub mod fpl;
pub mod quotes;

// pricing and risk
pub mod margin;
pub mod validation;

// execution
pub mod book;
pub mod engine;
pub mod matching;

// integration
pub mod events;
pub mod liquidation;
pub mod persistence;
pub mod services;

// re exports for convenience
pub use account::*;
pub use account_store::AccountStore;
pub use assets::*;
pub use cache::{CacheGroup, CacheItem, OrderCache, OrderPartition};
pub use engine::*;
pub use events::*;
pub use fpl::{FplData, FplSnapshot, Priced};
pub use liquidation::*;
pub use margin::{MarginCalculator, MarginError};
pub use matching::*;
pub use order::*;
pub use position::*;
pub use quotes::{InstrumentBidAskPair, QuoteError, QuoteStore};
pub use services::*;
pub use types::*;
pub use validation::{AccountStateValidator, OrderValidator, PermissiveValidator, ValidationRejection};
