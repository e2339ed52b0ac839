//! Margin Core Simulation.
//!
//! Wires the engine against an in-memory market maker and walks one account
//! through opening, revaluation, a margin call and a stop out.

use margin_core::{
    AccountId, AccountStore, Asset, AssetId, AssetPair, AssetPairId, AssetsCache, ChannelCommandSender, Clock, EngineConfig, EngineDeps,
    EngineError, EventCollector, EventPayload, InstrumentBidAskPair, ManualClock, MarginCalculator,
    MarginTradingAccount, MarketMakerMatchingEngine, MatchingEngineRouter, Order, OrderCache, OrderDirection,
    OrderType, PermissiveValidator, QuoteStore, SequentialIdGenerator, Timestamp, TokioDispatcher,
    TradingCondition, TradingEngine, TradingInstrument,
};
use margin_core::persistence::{InMemoryBlobRepository, OrderCacheManager};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ACCOUNT: &str = "AA0001";
const INSTRUMENT: &str = "BTCUSD";

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("margin core simulation: one account, one instrument, full lifecycle");

    let config = EngineConfig::default();
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let assets = Arc::new(AssetsCache::new(config.default_asset_accuracy));
    assets.add_asset(Asset { id: AssetId::from("USD"), accuracy: 2 });
    assets.add_asset(Asset { id: AssetId::from("BTC"), accuracy: 8 });
    assets.add_asset_pair(AssetPair::new(INSTRUMENT, "BTC", "USD", 2, "LE1"));
    assets.add_trading_condition(TradingCondition::new("TC1", "LE1"));
    assets.add_instrument(TradingInstrument::new("TC1", INSTRUMENT, dec!(10), dec!(20)));

    let accounts = Arc::new(AccountStore::new(clock.clone()));
    accounts.init(vec![MarginTradingAccount::new(ACCOUNT, "TC1", "USD", dec!(10000), "LE1")]);

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

    let market_maker = Arc::new(MarketMakerMatchingEngine::new("MM", clock.clone()));
    let router = Arc::new(MatchingEngineRouter::new(market_maker.clone()));
    let (commands, mut command_rx) = ChannelCommandSender::new();
    let dispatcher = Arc::new(TokioDispatcher::current());

    let engine = Arc::new(TradingEngine::new(
        config.clone(),
        EngineDeps {
            cache: cache.clone(),
            accounts: accounts.clone(),
            assets,
            quotes,
            fx_quotes,
            calculator: calculator.clone(),
            router,
            validator: Arc::new(PermissiveValidator),
            commands: Arc::new(commands),
            clock: clock.clone(),
            ids: Arc::new(SequentialIdGenerator::new("op-")),
            dispatcher: dispatcher.clone(),
        },
    ));
    let events = Arc::new(EventCollector::default());
    engine.subscribe(events.clone());

    let manager = Arc::new(OrderCacheManager::new(
        cache.clone(),
        accounts.clone(),
        Arc::new(InMemoryBlobRepository::new()),
    ));
    manager.start().await?;
    let dump = manager.clone().spawn_periodic_dump(config.orders_dump_period());

    let account_id = AccountId::from(ACCOUNT);
    let instrument = AssetPairId::from(INSTRUMENT);
    let quote = |bid: Decimal, ask: Decimal| InstrumentBidAskPair::new(INSTRUMENT, bid, ask, clock.now());

    // Step 1: liquidity and the first quote
    market_maker.set_level(&instrument, OrderDirection::Sell, dec!(50010), dec!(10));
    market_maker.set_level(&instrument, OrderDirection::Buy, dec!(49990), dec!(10));
    engine.on_quote(quote(dec!(49990), dec!(50010))).await?;

    // Step 2: open 2 BTC long at market
    let order = Order::market("O1", ACCOUNT, INSTRUMENT, dec!(2), clock.now());
    let order = engine.place_order(order).await?;
    info!(status = ?order.status, price = ?order.execution_price, "market order done");

    // Step 3: a take profit resting above the market
    clock.advance(1_000);
    let take_profit = Order::pending("TP1", ACCOUNT, INSTRUMENT, dec!(-2), OrderType::Limit, dec!(55000), clock.now())
        .with_parent_position("O1".into());
    let take_profit = engine.place_order(take_profit).await?;
    info!(status = ?take_profit.status, "take profit placed");

    // Step 4: the market falls until the account is stopped out
    for bid in [dec!(48000), dec!(46000), dec!(45600), dec!(45300)] {
        clock.advance(1_000);
        engine.on_quote(quote(bid, bid + dec!(20))).await?;
        dispatcher.wait_idle().await;

        let fpl = calculator.account_fpl_by_id(&account_id)?;
        info!(
            %bid,
            pnl = %fpl.pnl,
            used_margin = %fpl.used_margin(),
            usage = ?fpl.margin_usage_level(),
            level = ?fpl.level(),
            "account revalued"
        );
    }

    while let Ok(command) = command_rx.try_recv() {
        info!(operation_id = command.operation_id(), account_id = %command.account_id(), "liquidation command sent");
        engine.finish_liquidation(command.account_id(), command.operation_id())?;
    }

    let margin_calls = events.count(|p| matches!(p, EventPayload::MarginCall(_)));
    let stop_outs = events.count(|p| matches!(p, EventPayload::StopOut(_)));
    if stop_outs == 0 {
        warn!("account was never stopped out");
    }
    info!(
        margin_calls,
        stop_outs,
        events = events.events().len(),
        recomputes = calculator.recompute_count(),
        "simulation finished"
    );

    dump.stop().await;
    Ok(())
}
