//! Version-stamped lazy cache for per order/position financial figures.
//!
//! Every input-mutating operation bumps `version`. The cached snapshot carries
//! the version it was computed from; readers compare the two and only pay for a
//! recompute when they differ. Mutations never recompute.

use crate::types::{AccountId, AssetId, AssetPairId, TradingConditionId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FplSnapshot {
    pub quote_rate: Decimal,
    pub margin_rate: Decimal,
    pub margin_init: Decimal,
    pub margin_maintenance: Decimal,
    pub fpl: Decimal,
    pub total_fpl: Decimal,
    pub account_base_asset_accuracy: u32,
    pub calculated_version: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FplData {
    version: u64,
    #[serde(skip)]
    cached: Mutex<Option<FplSnapshot>>,
}

impl Clone for FplData {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            cached: Mutex::new(self.cached.lock().clone()),
        }
    }
}

impl FplData {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn invalidate(&mut self) {
        self.version += 1;
    }

    pub fn is_stale(&self) -> bool {
        self.fresh().is_none()
    }

    pub fn fresh(&self) -> Option<FplSnapshot> {
        self.cached
            .lock()
            .as_ref()
            .filter(|s| s.calculated_version == self.version)
            .cloned()
    }

    /// Accepts a snapshot only if it was computed from the current version.
    pub fn store(&self, snapshot: FplSnapshot) -> bool {
        if snapshot.calculated_version != self.version {
            return false;
        }
        *self.cached.lock() = Some(snapshot);
        true
    }
}

/// Anything whose PnL and margin the calculator can evaluate.
pub trait Priced {
    fn fpl_data(&self) -> &FplData;
    fn account_id(&self) -> &AccountId;
    fn asset_pair_id(&self) -> &AssetPairId;
    fn trading_condition_id(&self) -> &TradingConditionId;
    fn account_asset_id(&self) -> &AssetId;
    fn legal_entity(&self) -> &str;
    /// Signed. positive is long exposure.
    fn volume(&self) -> Decimal;
    fn open_price(&self) -> Decimal;
    fn close_price(&self) -> Decimal;

    /// Commission charged so far, in the account asset.
    fn commission(&self) -> Decimal {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(version: u64) -> FplSnapshot {
        FplSnapshot {
            quote_rate: dec!(1),
            margin_rate: dec!(800),
            margin_init: dec!(80),
            margin_maintenance: dec!(40),
            fpl: dec!(100),
            total_fpl: dec!(100),
            account_base_asset_accuracy: 2,
            calculated_version: version,
        }
    }

    #[test]
    fn invalidate_makes_cache_stale() {
        let mut data = FplData::default();
        assert!(data.store(snapshot(0)));
        assert!(!data.is_stale());

        data.invalidate();
        assert!(data.is_stale());
        assert!(data.fresh().is_none());
    }

    #[test]
    fn store_refuses_outdated_snapshot() {
        let mut data = FplData::default();
        data.invalidate();
        data.invalidate();
        assert!(!data.store(snapshot(1)));
        assert!(data.store(snapshot(2)));
        assert_eq!(data.fresh().unwrap().fpl, dec!(100));
    }

    #[test]
    fn clone_carries_cached_value() {
        let data = FplData::default();
        data.store(snapshot(0));
        let copy = data.clone();
        assert_eq!(copy.fresh(), data.fresh());
    }
}
