// 5.0: margin trading accounts. the account itself is a plain value replaced
// whole on update; the aggregate cell is shared across those replacements and
// holds everything that is not owned by the account service: cached margin
// figures, frozen/unconfirmed ledgers, the in-liquidation flag, the last level.

use crate::types::{AccountId, AssetId, Timestamp, TradingConditionId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Account {0} already exists")]
    AlreadyExists(AccountId),

    #[error("Account {0} is disabled")]
    Disabled(AccountId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccountLevel {
    None,
    MarginCall1,
    MarginCall2,
    OvernightMarginCall,
    StopOut,
}

impl AccountLevel {
    pub fn is_margin_call(&self) -> bool {
        matches!(
            self,
            AccountLevel::MarginCall1 | AccountLevel::MarginCall2 | AccountLevel::OvernightMarginCall
        )
    }
}

// 5.1: aggregate margin figures for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountFpl {
    pub balance: Decimal,
    pub pnl: Decimal,
    /// Sum of maintenance margin over open positions.
    pub currently_used_margin: Decimal,
    /// Sum of initial margin over open positions.
    pub margin_init: Decimal,
    pub withdrawal_frozen_margin: Decimal,
    pub unconfirmed_margin: Decimal,
    pub open_positions_count: usize,
    pub active_orders_count: usize,
    pub margin_call1_level: Decimal,
    pub margin_call2_level: Decimal,
    pub stop_out_level: Decimal,
    pub overnight_margin_call_level: Option<Decimal>,
    pub calculated_version: u64,
}

impl AccountFpl {
    pub fn total_capital(&self) -> Decimal {
        self.balance + self.pnl
    }

    pub fn used_margin(&self) -> Decimal {
        self.currently_used_margin + self.withdrawal_frozen_margin + self.unconfirmed_margin
    }

    pub fn free_margin(&self) -> Decimal {
        self.total_capital() - self.used_margin()
    }

    pub fn margin_available(&self) -> Decimal {
        self.total_capital() - self.margin_init - self.withdrawal_frozen_margin - self.unconfirmed_margin
    }

    /// Capital over used margin. `None` while nothing is used.
    pub fn margin_usage_level(&self) -> Option<Decimal> {
        let used = self.used_margin();
        if used <= Decimal::ZERO {
            return None;
        }
        Some(self.total_capital() / used)
    }

    pub fn level(&self) -> AccountLevel {
        let Some(usage) = self.margin_usage_level() else {
            return AccountLevel::None;
        };
        if usage <= self.stop_out_level {
            AccountLevel::StopOut
        } else if self.overnight_margin_call_level.map_or(false, |l| usage <= l) {
            AccountLevel::OvernightMarginCall
        } else if usage <= self.margin_call2_level {
            AccountLevel::MarginCall2
        } else if usage <= self.margin_call1_level {
            AccountLevel::MarginCall1
        } else {
            AccountLevel::None
        }
    }
}

#[derive(Debug, Default)]
struct AggregateState {
    actual_version: u64,
    cached: Option<AccountFpl>,
    withdrawal_frozen: HashMap<String, Decimal>,
    unconfirmed: HashMap<String, Decimal>,
    liquidation_operation_id: Option<String>,
    last_level: Option<AccountLevel>,
}

#[derive(Debug, Default)]
pub struct AccountAggregate {
    state: Mutex<AggregateState>,
}

impl AccountAggregate {
    pub fn actual_version(&self) -> u64 {
        self.state.lock().actual_version
    }

    pub fn invalidate(&self) {
        self.state.lock().actual_version += 1;
    }

    pub fn fresh(&self) -> Option<AccountFpl> {
        let state = self.state.lock();
        state
            .cached
            .as_ref()
            .filter(|c| c.calculated_version == state.actual_version)
            .cloned()
    }

    pub fn store(&self, fpl: AccountFpl) {
        self.state.lock().cached = Some(fpl);
    }

    pub fn withdrawal_frozen_margin(&self) -> Decimal {
        self.state.lock().withdrawal_frozen.values().copied().sum()
    }

    pub fn unconfirmed_margin(&self) -> Decimal {
        self.state.lock().unconfirmed.values().copied().sum()
    }

    pub fn freeze_withdrawal(&self, operation_id: &str, amount: Decimal) {
        let mut state = self.state.lock();
        state.withdrawal_frozen.insert(operation_id.to_string(), amount);
        state.actual_version += 1;
    }

    pub fn unfreeze_withdrawal(&self, operation_id: &str) -> Option<Decimal> {
        let mut state = self.state.lock();
        let removed = state.withdrawal_frozen.remove(operation_id);
        state.actual_version += 1;
        removed
    }

    pub fn add_unconfirmed(&self, operation_id: &str, amount: Decimal) {
        let mut state = self.state.lock();
        state.unconfirmed.insert(operation_id.to_string(), amount);
        state.actual_version += 1;
    }

    pub fn remove_unconfirmed(&self, operation_id: &str) -> Option<Decimal> {
        let mut state = self.state.lock();
        let removed = state.unconfirmed.remove(operation_id);
        state.actual_version += 1;
        removed
    }

    /// Sets the in-liquidation flag. False if a liquidation is already running.
    pub fn try_start_liquidation(&self, operation_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.liquidation_operation_id.is_some() {
            return false;
        }
        state.liquidation_operation_id = Some(operation_id.to_string());
        true
    }

    pub fn finish_liquidation(&self, operation_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.liquidation_operation_id.as_deref() == Some(operation_id) {
            state.liquidation_operation_id = None;
            return true;
        }
        false
    }

    pub fn liquidation_operation_id(&self) -> Option<String> {
        self.state.lock().liquidation_operation_id.clone()
    }

    pub fn swap_level(&self, level: AccountLevel) -> AccountLevel {
        self.state
            .lock()
            .last_level
            .replace(level)
            .unwrap_or(AccountLevel::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginTradingAccount {
    pub id: AccountId,
    pub client_id: String,
    pub trading_condition_id: TradingConditionId,
    pub base_asset_id: AssetId,
    pub balance: Decimal,
    pub withdraw_transfer_limit: Decimal,
    pub legal_entity: String,
    pub is_disabled: bool,
    pub is_withdrawal_disabled: bool,
    pub last_update_time: Timestamp,
    #[serde(skip)]
    pub aggregate: Arc<AccountAggregate>,
}

impl MarginTradingAccount {
    pub fn new(id: &str, trading_condition_id: &str, base_asset_id: &str, balance: Decimal, legal_entity: &str) -> Self {
        Self {
            id: AccountId::from(id),
            client_id: id.to_string(),
            trading_condition_id: TradingConditionId::from(trading_condition_id),
            base_asset_id: AssetId::from(base_asset_id),
            balance,
            withdraw_transfer_limit: Decimal::ZERO,
            legal_entity: legal_entity.to_string(),
            is_disabled: false,
            is_withdrawal_disabled: false,
            last_update_time: Timestamp::from_millis(0),
            aggregate: Arc::new(AccountAggregate::default()),
        }
    }

    pub fn is_in_liquidation(&self) -> bool {
        self.aggregate.liquidation_operation_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fpl(balance: Decimal, pnl: Decimal, used: Decimal) -> AccountFpl {
        AccountFpl {
            balance,
            pnl,
            currently_used_margin: used,
            margin_init: used * dec!(2),
            withdrawal_frozen_margin: Decimal::ZERO,
            unconfirmed_margin: Decimal::ZERO,
            open_positions_count: 1,
            active_orders_count: 0,
            margin_call1_level: dec!(1.25),
            margin_call2_level: dec!(1.11),
            stop_out_level: dec!(1),
            overnight_margin_call_level: None,
            calculated_version: 0,
        }
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(fpl(dec!(1000), dec!(0), dec!(100)).level(), AccountLevel::None);
        assert_eq!(fpl(dec!(120), dec!(0), dec!(100)).level(), AccountLevel::MarginCall1);
        assert_eq!(fpl(dec!(110), dec!(0), dec!(100)).level(), AccountLevel::MarginCall2);
        assert_eq!(fpl(dec!(150), dec!(-50), dec!(100)).level(), AccountLevel::StopOut);
        assert_eq!(fpl(dec!(10), dec!(0), dec!(0)).level(), AccountLevel::None);
    }

    #[test]
    fn overnight_threshold_sits_between_mc2_and_stop_out() {
        let mut figures = fpl(dec!(105), dec!(0), dec!(100));
        assert_eq!(figures.level(), AccountLevel::MarginCall2);
        figures.overnight_margin_call_level = Some(dec!(1.05));
        assert_eq!(figures.level(), AccountLevel::OvernightMarginCall);
    }

    #[test]
    fn ledgers_count_as_used_margin() {
        let mut figures = fpl(dec!(1000), dec!(0), dec!(100));
        figures.withdrawal_frozen_margin = dec!(50);
        assert_eq!(figures.used_margin(), dec!(150));
        assert_eq!(figures.free_margin(), dec!(850));
        assert_eq!(figures.margin_available(), dec!(750));
    }

    #[test]
    fn ledger_changes_invalidate_cache() {
        let aggregate = AccountAggregate::default();
        aggregate.store(fpl(dec!(1), dec!(0), dec!(0)));
        assert!(aggregate.fresh().is_some());

        aggregate.freeze_withdrawal("op1", dec!(10));
        assert!(aggregate.fresh().is_none());
        assert_eq!(aggregate.withdrawal_frozen_margin(), dec!(10));
        assert_eq!(aggregate.unfreeze_withdrawal("op1"), Some(dec!(10)));
        assert_eq!(aggregate.withdrawal_frozen_margin(), dec!(0));
    }

    #[test]
    fn liquidation_flag_is_exclusive() {
        let aggregate = AccountAggregate::default();
        assert!(aggregate.try_start_liquidation("liq1"));
        assert!(!aggregate.try_start_liquidation("liq2"));
        assert!(!aggregate.finish_liquidation("liq2"));
        assert!(aggregate.finish_liquidation("liq1"));
        assert!(aggregate.try_start_liquidation("liq2"));
    }
}
