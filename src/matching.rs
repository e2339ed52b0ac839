// 6.0: matching engines consumed by the trading engine.
// 6.1 internal market maker book, 6.2 straight-through to external liquidity,
// 6.3 fixed-price engine used by special liquidation, 6.4 routing.

use crate::book::LiquidityBook;
use crate::order::{MatchedOrder, MatchedOrderCollection, Order};
use crate::services::Clock;
use crate::types::{AssetPairId, OrderDirection, OrderFillType, OrderModality, PositionDirection};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

pub const MARKET_MAKER_ID: &str = "MM";
pub const STP_ID: &str = "STP";
pub const SPECIAL_LIQUIDATION_ID: &str = "SPECIAL_LIQUIDATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingEngineMode {
    MarketMaker,
    Stp,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchingError {
    #[error("External execution failed: {0}")]
    External(String),

    #[error("Matching engine {0} is not registered")]
    UnknownEngine(String),
}

/// Returns fills best price first. A summary volume below the order volume is
/// a partial fill, an empty collection means no liquidity.
#[async_trait]
pub trait MatchingEngine: Send + Sync {
    fn id(&self) -> &str;

    fn mode(&self) -> MatchingEngineMode;

    async fn match_order(
        &self,
        order: &Order,
        wants_to_open: bool,
        modality: OrderModality,
    ) -> Result<MatchedOrderCollection, MatchingError>;

    /// Price at which `volume` of an existing position could be closed, without trading.
    fn get_price_for_close(
        &self,
        asset_pair_id: &AssetPairId,
        volume: Decimal,
        external_provider_id: Option<&str>,
    ) -> Option<Decimal>;

    /// Best price at which a new `volume` (signed) could be opened right now.
    fn get_best_price_for_open(&self, asset_pair_id: &AssetPairId, volume: Decimal) -> Option<Decimal>;
}

// 6.1
pub struct MarketMakerMatchingEngine {
    id: String,
    books: RwLock<HashMap<AssetPairId, LiquidityBook>>,
    clock: Arc<dyn Clock>,
}

impl MarketMakerMatchingEngine {
    pub fn new(id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: id.to_string(),
            books: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn set_level(&self, asset_pair_id: &AssetPairId, side: OrderDirection, price: Decimal, volume: Decimal) {
        self.books
            .write()
            .entry(asset_pair_id.clone())
            .or_insert_with(|| LiquidityBook::new(asset_pair_id.clone()))
            .set_level(side, price, volume);
    }

    pub fn clear_book(&self, asset_pair_id: &AssetPairId) {
        if let Some(book) = self.books.write().get_mut(asset_pair_id) {
            book.clear();
        }
    }

    pub fn book(&self, asset_pair_id: &AssetPairId) -> Option<LiquidityBook> {
        self.books.read().get(asset_pair_id).cloned()
    }
}

#[async_trait]
impl MatchingEngine for MarketMakerMatchingEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn mode(&self) -> MatchingEngineMode {
        MatchingEngineMode::MarketMaker
    }

    async fn match_order(
        &self,
        order: &Order,
        _wants_to_open: bool,
        _modality: OrderModality,
    ) -> Result<MatchedOrderCollection, MatchingError> {
        let now = self.clock.now();
        let mut books = self.books.write();
        let Some(book) = books.get_mut(&order.asset_pair_id) else {
            return Ok(MatchedOrderCollection::default());
        };

        let remaining = order.remaining_volume();
        // fill-or-kill never leaves a partial dent in the book
        let levels = if order.fill_type == OrderFillType::FillOrKill
            && book.available_volume(order.direction()) < remaining
        {
            book.clone().take(order.direction(), remaining)
        } else {
            book.take(order.direction(), remaining)
        };
        let fills = levels
            .into_iter()
            .map(|level| MatchedOrder::new(self.id.clone(), level.price, level.volume, now))
            .collect();
        Ok(MatchedOrderCollection::new(fills))
    }

    fn get_price_for_close(
        &self,
        asset_pair_id: &AssetPairId,
        volume: Decimal,
        _external_provider_id: Option<&str>,
    ) -> Option<Decimal> {
        let close_direction = PositionDirection::from_volume(volume).close_direction();
        self.books
            .read()
            .get(asset_pair_id)?
            .price_for_volume(close_direction, volume)
    }

    fn get_best_price_for_open(&self, asset_pair_id: &AssetPairId, volume: Decimal) -> Option<Decimal> {
        self.books
            .read()
            .get(asset_pair_id)?
            .price_for_volume(OrderDirection::from_volume(volume), volume)
    }
}

// 6.2
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalFill {
    pub price: Decimal,
    pub volume: Decimal,
    pub provider_id: String,
    pub external_order_id: String,
}

/// Outside liquidity an STP engine forwards orders to.
#[async_trait]
pub trait ExternalExecution: Send + Sync {
    async fn execute(&self, order: &Order) -> Result<Option<ExternalFill>, MatchingError>;

    fn indicative_price(&self, asset_pair_id: &AssetPairId, direction: OrderDirection) -> Option<Decimal>;
}

pub struct StpMatchingEngine {
    id: String,
    external: Arc<dyn ExternalExecution>,
    clock: Arc<dyn Clock>,
}

impl StpMatchingEngine {
    pub fn new(id: &str, external: Arc<dyn ExternalExecution>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: id.to_string(),
            external,
            clock,
        }
    }
}

#[async_trait]
impl MatchingEngine for StpMatchingEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn mode(&self) -> MatchingEngineMode {
        MatchingEngineMode::Stp
    }

    async fn match_order(
        &self,
        order: &Order,
        _wants_to_open: bool,
        _modality: OrderModality,
    ) -> Result<MatchedOrderCollection, MatchingError> {
        let Some(fill) = self.external.execute(order).await? else {
            return Ok(MatchedOrderCollection::default());
        };
        let volume = fill.volume.abs().min(order.remaining_volume());
        let mut matched = MatchedOrder::new(fill.provider_id, fill.price, volume, self.clock.now());
        matched.is_external = true;
        Ok(MatchedOrderCollection::new(vec![matched]))
    }

    fn get_price_for_close(
        &self,
        asset_pair_id: &AssetPairId,
        volume: Decimal,
        _external_provider_id: Option<&str>,
    ) -> Option<Decimal> {
        let direction = PositionDirection::from_volume(volume).close_direction();
        self.external.indicative_price(asset_pair_id, direction)
    }

    fn get_best_price_for_open(&self, asset_pair_id: &AssetPairId, volume: Decimal) -> Option<Decimal> {
        self.external
            .indicative_price(asset_pair_id, OrderDirection::from_volume(volume))
    }
}

// 6.3: fills everything at a price agreed out of band
pub struct SpecialLiquidationMatchingEngine {
    price: Decimal,
    counterparty_id: String,
    external_order_id: String,
    clock: Arc<dyn Clock>,
}

impl SpecialLiquidationMatchingEngine {
    pub fn new(price: Decimal, counterparty_id: &str, external_order_id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            price,
            counterparty_id: counterparty_id.to_string(),
            external_order_id: external_order_id.to_string(),
            clock,
        }
    }

    pub fn external_order_id(&self) -> &str {
        &self.external_order_id
    }
}

#[async_trait]
impl MatchingEngine for SpecialLiquidationMatchingEngine {
    fn id(&self) -> &str {
        SPECIAL_LIQUIDATION_ID
    }

    fn mode(&self) -> MatchingEngineMode {
        MatchingEngineMode::Stp
    }

    async fn match_order(
        &self,
        order: &Order,
        _wants_to_open: bool,
        _modality: OrderModality,
    ) -> Result<MatchedOrderCollection, MatchingError> {
        let mut matched = MatchedOrder::new(
            self.counterparty_id.clone(),
            self.price,
            order.remaining_volume(),
            self.clock.now(),
        );
        matched.is_external = true;
        Ok(MatchedOrderCollection::new(vec![matched]))
    }

    fn get_price_for_close(&self, _: &AssetPairId, _: Decimal, _: Option<&str>) -> Option<Decimal> {
        Some(self.price)
    }

    fn get_best_price_for_open(&self, _: &AssetPairId, _: Decimal) -> Option<Decimal> {
        Some(self.price)
    }
}

// 6.4: stable engine choice per order
pub struct MatchingEngineRouter {
    default_engine: Arc<dyn MatchingEngine>,
    engines: RwLock<HashMap<String, Arc<dyn MatchingEngine>>>,
    by_instrument: RwLock<HashMap<AssetPairId, String>>,
}

impl MatchingEngineRouter {
    pub fn new(default_engine: Arc<dyn MatchingEngine>) -> Self {
        let mut engines = HashMap::new();
        engines.insert(default_engine.id().to_string(), Arc::clone(&default_engine));
        Self {
            default_engine,
            engines: RwLock::new(engines),
            by_instrument: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, engine: Arc<dyn MatchingEngine>) {
        self.engines.write().insert(engine.id().to_string(), engine);
    }

    pub fn route_instrument(&self, asset_pair_id: &AssetPairId, engine_id: &str) -> Result<(), MatchingError> {
        if !self.engines.read().contains_key(engine_id) {
            return Err(MatchingError::UnknownEngine(engine_id.to_string()));
        }
        self.by_instrument
            .write()
            .insert(asset_pair_id.clone(), engine_id.to_string());
        Ok(())
    }

    pub fn get(&self, engine_id: &str) -> Option<Arc<dyn MatchingEngine>> {
        self.engines.read().get(engine_id).cloned()
    }

    pub fn for_instrument(&self, asset_pair_id: &AssetPairId) -> Arc<dyn MatchingEngine> {
        self.by_instrument
            .read()
            .get(asset_pair_id)
            .and_then(|id| self.get(id))
            .unwrap_or_else(|| Arc::clone(&self.default_engine))
    }

    /// An order already bound to an engine stays with it.
    pub fn for_order(&self, order: &Order) -> Arc<dyn MatchingEngine> {
        order
            .matching_engine_id
            .as_deref()
            .and_then(|id| self.get(id))
            .unwrap_or_else(|| self.for_instrument(&order.asset_pair_id))
    }

    /// Positions close on the engine that opened them when it still exists.
    pub fn for_close(&self, open_matching_engine_id: &str, asset_pair_id: &AssetPairId) -> Arc<dyn MatchingEngine> {
        self.get(open_matching_engine_id)
            .unwrap_or_else(|| self.for_instrument(asset_pair_id))
    }
}
