//! Shared engine wiring for integration tests.

#![allow(dead_code)]

use margin_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ACCOUNT: &str = "AA0001";
pub const LEGAL_ENTITY: &str = "LE1";
pub const TRADING_CONDITION: &str = "TC1";

/// Engine plus every collaborator a test may want to poke directly.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub assets: Arc<AssetsCache>,
    pub accounts: Arc<AccountStore>,
    pub cache: Arc<OrderCache>,
    pub quotes: Arc<QuoteStore>,
    pub fx_quotes: Arc<QuoteStore>,
    pub calculator: Arc<MarginCalculator>,
    pub market_maker: Arc<MarketMakerMatchingEngine>,
    pub dispatcher: Arc<TokioDispatcher>,
    pub events: Arc<EventCollector>,
    pub commands: mpsc::UnboundedReceiver<LiquidationCommand>,
    pub engine: Arc<TradingEngine>,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::testing())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));

        let assets = Arc::new(AssetsCache::new(config.default_asset_accuracy));
        for (id, accuracy) in [("USD", 2), ("EUR", 2), ("BTC", 8)] {
            assets.add_asset(Asset { id: AssetId::from(id), accuracy });
        }
        assets.add_asset_pair(AssetPair::new("EURUSD", "EUR", "USD", 5, LEGAL_ENTITY));
        assets.add_asset_pair(AssetPair::new("BTCEUR", "BTC", "EUR", 2, LEGAL_ENTITY));
        assets.add_asset_pair(AssetPair::new("BTCUSD", "BTC", "USD", 2, LEGAL_ENTITY));
        assets.add_trading_condition(TradingCondition::new(TRADING_CONDITION, LEGAL_ENTITY));
        for pair in ["EURUSD", "BTCEUR", "BTCUSD"] {
            assets.add_instrument(TradingInstrument::new(TRADING_CONDITION, pair, dec!(50), dec!(100)));
        }

        let accounts = Arc::new(AccountStore::new(clock.clone()));
        accounts.init(vec![account(ACCOUNT, dec!(50000))]);

        let cache = Arc::new(OrderCache::new());
        let quotes = Arc::new(QuoteStore::new());
        let fx_quotes = Arc::new(QuoteStore::new());
        let calculator = Arc::new(MarginCalculator::new(
            assets.clone(),
            quotes.clone(),
            fx_quotes.clone(),
            accounts.clone(),
            cache.clone(),
        ));

        let market_maker = Arc::new(MarketMakerMatchingEngine::new(MARKET_MAKER_ID, clock.clone()));
        let router = Arc::new(MatchingEngineRouter::new(market_maker.clone()));
        let (sender, commands) = ChannelCommandSender::new();
        let dispatcher = Arc::new(TokioDispatcher::current());

        let engine = Arc::new(TradingEngine::new(
            config,
            EngineDeps {
                cache: cache.clone(),
                accounts: accounts.clone(),
                assets: assets.clone(),
                quotes: quotes.clone(),
                fx_quotes: fx_quotes.clone(),
                calculator: calculator.clone(),
                router,
                validator: Arc::new(PermissiveValidator),
                commands: Arc::new(sender),
                clock: clock.clone(),
                ids: Arc::new(SequentialIdGenerator::new("op-")),
                dispatcher: dispatcher.clone(),
            },
        ));
        let events = Arc::new(EventCollector::new());
        engine.subscribe(events.clone());

        Self {
            clock,
            assets,
            accounts,
            cache,
            quotes,
            fx_quotes,
            calculator,
            market_maker,
            dispatcher,
            events,
            commands,
            engine,
        }
    }

    pub fn account_id(&self) -> AccountId {
        AccountId::from(ACCOUNT)
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.accounts
            .update_account_balance(&self.account_id(), balance)
            .expect("account exists");
    }

    /// Resting market maker liquidity. `bid` is what sellers hit, `ask` what buyers lift.
    pub fn liquidity(&self, instrument: &str, bid: Decimal, ask: Decimal, volume: Decimal) {
        let pair = AssetPairId::from(instrument);
        self.market_maker.set_level(&pair, OrderDirection::Buy, bid, volume);
        self.market_maker.set_level(&pair, OrderDirection::Sell, ask, volume);
    }

    pub fn quote(&self, instrument: &str, bid: Decimal, ask: Decimal) -> InstrumentBidAskPair {
        InstrumentBidAskPair::new(instrument, bid, ask, self.clock.now())
    }

    /// Advances the clock so quotes stay in order, ticks, and waits for
    /// any executions the tick dispatched.
    pub async fn tick(&self, instrument: &str, bid: Decimal, ask: Decimal) {
        self.clock.advance(1);
        self.engine
            .on_quote(self.quote(instrument, bid, ask))
            .await
            .expect("tick accepted");
        self.dispatcher.wait_idle().await;
    }

    /// Puts a position straight into the cache, as if an order had opened it.
    pub fn seed_position(&self, id: &str, instrument: &str, volume: Decimal, price: Decimal) -> Position {
        let now = self.clock.now();
        let mut order = Order::market(id, ACCOUNT, instrument, volume, now);
        order.trading_condition_id = TradingConditionId::from(TRADING_CONDITION);
        order.account_asset_id = AssetId::from("USD");
        order.legal_entity = LEGAL_ENTITY.to_string();
        order.matching_engine_id = Some(MARKET_MAKER_ID.to_string());

        let fills = MatchedOrderCollection::new(vec![MatchedOrder::new(MARKET_MAKER_ID, price, volume.abs(), now)]);
        let position = Position::open(&order, fills, now);
        self.cache.positions().add(position.clone());
        self.accounts.mark_dirty(&self.account_id());
        position
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.cache.positions().try_get(&PositionId::from(id))
    }

    pub fn drain_commands(&mut self) -> Vec<LiquidationCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            commands.push(command);
        }
        commands
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&EventPayload) -> bool,
    {
        self.events.count(predicate)
    }
}

pub fn account(id: &str, balance: Decimal) -> MarginTradingAccount {
    MarginTradingAccount::new(id, TRADING_CONDITION, "USD", balance, LEGAL_ENTITY)
}
