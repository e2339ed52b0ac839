// 2.0: reference data. assets, instruments, per trading condition leverage and
// the margin-call thresholds. read-mostly, so one RwLock per map is plenty.

use crate::types::{AssetId, AssetPairId, TradingConditionId};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    #[error("Asset pair {0} not found")]
    AssetPairNotFound(AssetPairId),

    #[error("No asset pair joins {asset1} and {asset2} for legal entity {legal_entity}")]
    CrossPairNotFound {
        asset1: AssetId,
        asset2: AssetId,
        legal_entity: String,
    },

    #[error("Instrument {asset_pair_id} is not tradable under trading condition {trading_condition_id}")]
    InstrumentNotFound {
        trading_condition_id: TradingConditionId,
        asset_pair_id: AssetPairId,
    },

    #[error("Trading condition {0} not found")]
    TradingConditionNotFound(TradingConditionId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub accuracy: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPair {
    pub id: AssetPairId,
    pub base_asset_id: AssetId,
    pub quote_asset_id: AssetId,
    pub accuracy: u32,
    pub legal_entity: String,
}

impl AssetPair {
    pub fn new(id: &str, base: &str, quote: &str, accuracy: u32, legal_entity: &str) -> Self {
        Self {
            id: AssetPairId::from(id),
            base_asset_id: AssetId::from(base),
            quote_asset_id: AssetId::from(quote),
            accuracy,
            legal_entity: legal_entity.to_string(),
        }
    }

    pub fn joins(&self, asset1: &AssetId, asset2: &AssetId) -> bool {
        (&self.base_asset_id == asset1 && &self.quote_asset_id == asset2)
            || (&self.base_asset_id == asset2 && &self.quote_asset_id == asset1)
    }
}

/// Per trading condition settings of a single instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingInstrument {
    pub trading_condition_id: TradingConditionId,
    pub asset_pair_id: AssetPairId,
    pub leverage_init: Decimal,
    pub leverage_maintenance: Decimal,
    /// Charged per unit of volume when a position opens.
    pub open_commission_rate: Decimal,
    /// Charged per unit of volume when a position closes.
    pub close_commission_rate: Decimal,
}

impl TradingInstrument {
    pub fn new(trading_condition_id: &str, asset_pair_id: &str, leverage_init: Decimal, leverage_maintenance: Decimal) -> Self {
        Self {
            trading_condition_id: TradingConditionId::from(trading_condition_id),
            asset_pair_id: AssetPairId::from(asset_pair_id),
            leverage_init,
            leverage_maintenance,
            open_commission_rate: Decimal::ZERO,
            close_commission_rate: Decimal::ZERO,
        }
    }
}

// 2.1: margin usage thresholds. usage = capital / used margin, lower is worse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingCondition {
    pub id: TradingConditionId,
    pub legal_entity: String,
    pub margin_call1: Decimal,
    pub margin_call2: Decimal,
    pub stop_out: Decimal,
    pub overnight_margin_call: Option<Decimal>,
}

impl TradingCondition {
    pub fn new(id: &str, legal_entity: &str) -> Self {
        Self {
            id: TradingConditionId::from(id),
            legal_entity: legal_entity.to_string(),
            margin_call1: dec!(1.25),
            margin_call2: dec!(1.11),
            stop_out: dec!(1),
            overnight_margin_call: None,
        }
    }
}

#[derive(Debug)]
pub struct AssetsCache {
    default_asset_accuracy: u32,
    assets: RwLock<HashMap<AssetId, Asset>>,
    pairs: RwLock<HashMap<AssetPairId, AssetPair>>,
    instruments: RwLock<HashMap<(TradingConditionId, AssetPairId), TradingInstrument>>,
    conditions: RwLock<HashMap<TradingConditionId, TradingCondition>>,
}

impl AssetsCache {
    pub fn new(default_asset_accuracy: u32) -> Self {
        Self {
            default_asset_accuracy,
            assets: RwLock::new(HashMap::new()),
            pairs: RwLock::new(HashMap::new()),
            instruments: RwLock::new(HashMap::new()),
            conditions: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_asset(&self, asset: Asset) {
        self.assets.write().insert(asset.id.clone(), asset);
    }

    pub fn add_asset_pair(&self, pair: AssetPair) {
        self.pairs.write().insert(pair.id.clone(), pair);
    }

    pub fn add_instrument(&self, instrument: TradingInstrument) {
        let key = (instrument.trading_condition_id.clone(), instrument.asset_pair_id.clone());
        self.instruments.write().insert(key, instrument);
    }

    pub fn add_trading_condition(&self, condition: TradingCondition) {
        self.conditions.write().insert(condition.id.clone(), condition);
    }

    pub fn asset_accuracy(&self, asset_id: &AssetId) -> u32 {
        self.assets
            .read()
            .get(asset_id)
            .map(|a| a.accuracy)
            .unwrap_or(self.default_asset_accuracy)
    }

    pub fn asset_pair(&self, id: &AssetPairId) -> Result<AssetPair, AssetError> {
        self.pairs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AssetError::AssetPairNotFound(id.clone()))
    }

    /// Finds the pair quoting `asset1` against `asset2` (in either order) for a legal entity.
    pub fn find_asset_pair(
        &self,
        asset1: &AssetId,
        asset2: &AssetId,
        legal_entity: &str,
    ) -> Result<AssetPair, AssetError> {
        self.pairs
            .read()
            .values()
            .find(|p| p.joins(asset1, asset2) && p.legal_entity == legal_entity)
            .cloned()
            .ok_or_else(|| AssetError::CrossPairNotFound {
                asset1: asset1.clone(),
                asset2: asset2.clone(),
                legal_entity: legal_entity.to_string(),
            })
    }

    pub fn instrument(
        &self,
        trading_condition_id: &TradingConditionId,
        asset_pair_id: &AssetPairId,
    ) -> Result<TradingInstrument, AssetError> {
        self.instruments
            .read()
            .get(&(trading_condition_id.clone(), asset_pair_id.clone()))
            .cloned()
            .ok_or_else(|| AssetError::InstrumentNotFound {
                trading_condition_id: trading_condition_id.clone(),
                asset_pair_id: asset_pair_id.clone(),
            })
    }

    pub fn trading_condition(&self, id: &TradingConditionId) -> Result<TradingCondition, AssetError> {
        self.conditions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AssetError::TradingConditionNotFound(id.clone()))
    }
}

impl Default for AssetsCache {
    fn default() -> Self {
        Self::new(2)
    }
}
