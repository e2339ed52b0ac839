//! Engine configuration options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration. Missing fields deserialize to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// NoLiquidity attempts a pending order gets before the rejection is final.
    pub pending_order_retries_threshold: u32,
    /// Group closes failing with NoLiquidity escalate to special liquidation.
    pub special_liquidation_enabled: bool,
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
    /// Decimal places kept on synthesized order volumes.
    pub volume_accuracy: u32,
    /// Price accuracy for instruments missing from the asset registry.
    pub default_asset_pair_accuracy: u32,
    /// Money accuracy for assets missing from the asset registry.
    pub default_asset_accuracy: u32,
    pub orders_dump_period_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_order_retries_threshold: 3,
            special_liquidation_enabled: true,
            max_events: 100_000,
            volume_accuracy: 10,
            default_asset_pair_accuracy: 5,
            default_asset_accuracy: 2,
            orders_dump_period_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn testing() -> Self {
        Self {
            max_events: 1_000,
            orders_dump_period_ms: 100,
            ..Self::default()
        }
    }

    pub fn orders_dump_period(&self) -> Duration {
        Duration::from_millis(self.orders_dump_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"pending_order_retries_threshold": 5, "special_liquidation_enabled": false}"#)
                .unwrap();
        assert_eq!(config.pending_order_retries_threshold, 5);
        assert!(!config.special_liquidation_enabled);
        assert_eq!(config.max_events, 100_000);
        assert_eq!(config.orders_dump_period(), Duration::from_secs(5));
    }
}
