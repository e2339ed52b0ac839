// 8.0 engine/core.rs: the trading engine. owns no domain state itself, it
// coordinates the shared stores and the collaborators it is handed.

use super::config::EngineConfig;
use crate::account_store::AccountStore;
use crate::assets::AssetsCache;
use crate::cache::OrderCache;
use crate::events::{Event, EventBus, EventId, EventPayload, EventSubscriber};
use crate::liquidation::CommandSender;
use crate::margin::MarginCalculator;
use crate::matching::MatchingEngineRouter;
use crate::quotes::QuoteStore;
use crate::services::{AccountLocks, Clock, IdGenerator, InstrumentLocks, TaskDispatcher};
use crate::validation::OrderValidator;
use std::sync::Arc;

/// Everything the engine talks to. Passed in whole so tests can swap any part.
pub struct EngineDeps {
    pub cache: Arc<OrderCache>,
    pub accounts: Arc<AccountStore>,
    pub assets: Arc<AssetsCache>,
    pub quotes: Arc<QuoteStore>,
    pub fx_quotes: Arc<QuoteStore>,
    pub calculator: Arc<MarginCalculator>,
    pub router: Arc<MatchingEngineRouter>,
    pub validator: Arc<dyn OrderValidator>,
    pub commands: Arc<dyn CommandSender>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
}

/** 8.1: main engine struct. the per-account token serializes executions,
the per-instrument token serializes tick processing */
pub struct TradingEngine {
    pub(super) config: EngineConfig,
    pub(super) cache: Arc<OrderCache>,
    pub(super) accounts: Arc<AccountStore>,
    pub(super) assets: Arc<AssetsCache>,
    pub(super) quotes: Arc<QuoteStore>,
    pub(super) fx_quotes: Arc<QuoteStore>,
    pub(super) calculator: Arc<MarginCalculator>,
    pub(super) router: Arc<MatchingEngineRouter>,
    pub(super) validator: Arc<dyn OrderValidator>,
    pub(super) events: EventBus,
    pub(super) commands: Arc<dyn CommandSender>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) dispatcher: Arc<dyn TaskDispatcher>,
    pub(super) account_locks: AccountLocks,
    pub(super) instrument_locks: InstrumentLocks,
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine")
            .field("config", &self.config)
            .field("events", &self.events)
            .field("account_locks", &self.account_locks.len())
            .finish()
    }
}

impl TradingEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let events = EventBus::new(config.max_events);
        Self {
            config,
            cache: deps.cache,
            accounts: deps.accounts,
            assets: deps.assets,
            quotes: deps.quotes,
            fx_quotes: deps.fx_quotes,
            calculator: deps.calculator,
            router: deps.router,
            validator: deps.validator,
            events,
            commands: deps.commands,
            clock: deps.clock,
            ids: deps.ids,
            dispatcher: deps.dispatcher,
            account_locks: AccountLocks::new(),
            instrument_locks: InstrumentLocks::new(),
        }
    }

    pub(super) fn emit(&self, payload: EventPayload) -> EventId {
        self.events.publish(self.clock.now(), payload)
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.events.subscribe(subscriber);
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.events.recent_events(count)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<OrderCache> {
        &self.cache
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        &self.accounts
    }

    pub fn quotes(&self) -> &Arc<QuoteStore> {
        &self.quotes
    }

    pub fn fx_quotes(&self) -> &Arc<QuoteStore> {
        &self.fx_quotes
    }

    pub fn calculator(&self) -> &Arc<MarginCalculator> {
        &self.calculator
    }

    pub fn router(&self) -> &Arc<MatchingEngineRouter> {
        &self.router
    }

    /// Execution tokens. Holding one blocks every execution for that account.
    pub fn account_locks(&self) -> &AccountLocks {
        &self.account_locks
    }

    /// Drops execution and tick tokens nobody holds. Returns how many went.
    pub fn prune_locks(&self) -> usize {
        self.account_locks.prune() + self.instrument_locks.prune()
    }
}
