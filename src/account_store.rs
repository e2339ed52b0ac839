//! Keyed account registry.
//!
//! Readers (the tick path) vastly outnumber writers (account service
//! projections), so the map sits behind a single `RwLock` and every update is a
//! whole-object replace. The shared aggregate cell survives replacement.

use crate::account::{AccountAggregate, AccountError, AccountLevel, MarginTradingAccount};
use crate::services::Clock;
use crate::types::{AccountId, Timestamp, TradingConditionId};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub struct AccountStore {
    accounts: RwLock<HashMap<AccountId, MarginTradingAccount>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore")
            .field("accounts", &self.accounts.read().len())
            .finish()
    }
}

impl AccountStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn init(&self, accounts: Vec<MarginTradingAccount>) {
        let mut map = self.accounts.write();
        map.clear();
        for account in accounts {
            map.insert(account.id.clone(), account);
        }
    }

    pub fn get(&self, id: &AccountId) -> Result<MarginTradingAccount, AccountError> {
        self.try_get(id)
            .ok_or_else(|| AccountError::AccountNotFound(id.clone()))
    }

    pub fn try_get(&self, id: &AccountId) -> Option<MarginTradingAccount> {
        self.accounts.read().get(id).cloned()
    }

    pub fn get_all(&self) -> Vec<MarginTradingAccount> {
        self.accounts.read().values().cloned().collect()
    }

    pub fn try_add_new(&self, mut account: MarginTradingAccount) -> bool {
        let mut map = self.accounts.write();
        if map.contains_key(&account.id) {
            return false;
        }
        account.last_update_time = self.clock.now();
        map.insert(account.id.clone(), account);
        true
    }

    /// Replaces the stored account, keeping its aggregate cell.
    pub fn update(&self, mut account: MarginTradingAccount) -> Result<(), AccountError> {
        let now = self.clock.now();
        let mut map = self.accounts.write();
        let stored = map
            .get(&account.id)
            .ok_or_else(|| AccountError::AccountNotFound(account.id.clone()))?;
        account.aggregate = Arc::clone(&stored.aggregate);
        account.last_update_time = now.max(stored.last_update_time);
        account.aggregate.invalidate();
        map.insert(account.id.clone(), account);
        Ok(())
    }

    pub fn update_account_balance(&self, id: &AccountId, balance: Decimal) -> Result<(), AccountError> {
        self.mutate(id, None, |account| account.balance = balance)
            .map(|_| ())
    }

    pub fn update_account_changes(
        &self,
        id: &AccountId,
        trading_condition_id: TradingConditionId,
        withdraw_transfer_limit: Decimal,
        is_disabled: bool,
        is_withdrawal_disabled: bool,
        event_time: Timestamp,
    ) -> Result<bool, AccountError> {
        self.apply_if_newer(id, event_time, |account| {
            account.trading_condition_id = trading_condition_id;
            account.withdraw_transfer_limit = withdraw_transfer_limit;
            account.is_disabled = is_disabled;
            account.is_withdrawal_disabled = is_withdrawal_disabled;
        })
    }

    /// True if `event_time` is strictly newer than the stored update time.
    pub fn check_event_time_newer(&self, id: &AccountId, event_time: Timestamp) -> Result<bool, AccountError> {
        let account = self.get(id)?;
        Ok(account.last_update_time < event_time)
    }

    /// Applies an externally sourced change unless it is stale. Stale writes
    /// are dropped with a warning and reported as `Ok(false)`.
    pub fn apply_if_newer<F>(&self, id: &AccountId, event_time: Timestamp, change: F) -> Result<bool, AccountError>
    where
        F: FnOnce(&mut MarginTradingAccount),
    {
        self.mutate(id, Some(event_time), change)
    }

    fn mutate<F>(&self, id: &AccountId, event_time: Option<Timestamp>, change: F) -> Result<bool, AccountError>
    where
        F: FnOnce(&mut MarginTradingAccount),
    {
        let now = self.clock.now();
        let mut map = self.accounts.write();
        let stored = map
            .get(id)
            .ok_or_else(|| AccountError::AccountNotFound(id.clone()))?;

        if let Some(event_time) = event_time {
            if stored.last_update_time >= event_time {
                warn!(
                    account_id = %id,
                    event_time = %event_time,
                    stored_time = %stored.last_update_time,
                    "dropping stale account update"
                );
                return Ok(false);
            }
        }

        let mut updated = stored.clone();
        change(&mut updated);
        updated.last_update_time = now.max(stored.last_update_time);
        updated.aggregate.invalidate();
        map.insert(id.clone(), updated);
        Ok(true)
    }

    fn aggregate(&self, id: &AccountId) -> Result<Arc<AccountAggregate>, AccountError> {
        self.accounts
            .read()
            .get(id)
            .map(|a| Arc::clone(&a.aggregate))
            .ok_or_else(|| AccountError::AccountNotFound(id.clone()))
    }

    pub fn mark_dirty(&self, id: &AccountId) {
        if let Some(account) = self.accounts.read().get(id) {
            account.aggregate.invalidate();
        }
    }

    pub fn freeze_withdrawal_margin(&self, id: &AccountId, operation_id: &str, amount: Decimal) -> Result<(), AccountError> {
        self.aggregate(id)?.freeze_withdrawal(operation_id, amount);
        Ok(())
    }

    pub fn unfreeze_withdrawal_margin(&self, id: &AccountId, operation_id: &str) -> Result<Option<Decimal>, AccountError> {
        Ok(self.aggregate(id)?.unfreeze_withdrawal(operation_id))
    }

    pub fn add_unconfirmed_margin(&self, id: &AccountId, operation_id: &str, amount: Decimal) -> Result<(), AccountError> {
        self.aggregate(id)?.add_unconfirmed(operation_id, amount);
        Ok(())
    }

    pub fn remove_unconfirmed_margin(&self, id: &AccountId, operation_id: &str) -> Result<Option<Decimal>, AccountError> {
        Ok(self.aggregate(id)?.remove_unconfirmed(operation_id))
    }

    pub fn try_start_liquidation(&self, id: &AccountId, operation_id: &str) -> Result<bool, AccountError> {
        Ok(self.aggregate(id)?.try_start_liquidation(operation_id))
    }

    pub fn finish_liquidation(&self, id: &AccountId, operation_id: &str) -> Result<bool, AccountError> {
        Ok(self.aggregate(id)?.finish_liquidation(operation_id))
    }

    pub fn is_in_liquidation(&self, id: &AccountId) -> Result<bool, AccountError> {
        Ok(self.aggregate(id)?.liquidation_operation_id().is_some())
    }

    /// Records the latest level and returns the previous one.
    pub fn swap_level(&self, id: &AccountId, level: AccountLevel) -> Result<AccountLevel, AccountError> {
        Ok(self.aggregate(id)?.swap_level(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ManualClock;
    use rust_decimal_macros::dec;

    fn store() -> (AccountStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let store = AccountStore::new(clock.clone());
        assert!(store.try_add_new(MarginTradingAccount::new("a1", "tc", "USD", dec!(100), "LYKKEVU")));
        (store, clock)
    }

    #[test]
    fn missing_account_is_an_error() {
        let (store, _) = store();
        assert!(matches!(
            store.get(&AccountId::from("nope")),
            Err(AccountError::AccountNotFound(_))
        ));
    }

    #[test]
    fn duplicate_add_is_refused() {
        let (store, _) = store();
        assert!(!store.try_add_new(MarginTradingAccount::new("a1", "tc", "USD", dec!(5), "LYKKEVU")));
        assert_eq!(store.get(&AccountId::from("a1")).unwrap().balance, dec!(100));
    }

    #[test]
    fn update_stamps_time_and_keeps_aggregate() {
        let (store, clock) = store();
        let id = AccountId::from("a1");
        store.freeze_withdrawal_margin(&id, "w1", dec!(7)).unwrap();

        clock.advance(500);
        let mut replacement = MarginTradingAccount::new("a1", "tc", "USD", dec!(250), "LYKKEVU");
        replacement.is_disabled = true;
        store.update(replacement).unwrap();

        let account = store.get(&id).unwrap();
        assert_eq!(account.balance, dec!(250));
        assert_eq!(account.last_update_time, Timestamp::from_millis(1_500));
        assert_eq!(account.aggregate.withdrawal_frozen_margin(), dec!(7));
    }

    #[test]
    fn stale_changes_are_dropped() {
        let (store, clock) = store();
        let id = AccountId::from("a1");
        clock.set(Timestamp::from_millis(3_000));

        let applied = store
            .update_account_changes(&id, TradingConditionId::from("vip"), dec!(0), true, false, Timestamp::from_millis(2_000))
            .unwrap();
        assert!(applied);
        assert!(!store.check_event_time_newer(&id, Timestamp::from_millis(1_500)).unwrap());

        let applied = store
            .update_account_changes(&id, TradingConditionId::from("old"), dec!(0), false, false, Timestamp::from_millis(1_500))
            .unwrap();
        assert!(!applied);

        let account = store.get(&id).unwrap();
        assert_eq!(account.trading_condition_id.as_str(), "vip");
        assert!(account.is_disabled);
    }

    #[test]
    fn applied_change_is_stamped_with_apply_time() {
        let (store, clock) = store();
        let id = AccountId::from("a1");
        clock.set(Timestamp::from_millis(1_700_000_000_000));

        let applied = store
            .update_account_changes(&id, TradingConditionId::from("vip"), dec!(0), false, false, Timestamp::from_millis(1_000))
            .unwrap();
        assert!(!applied, "not newer than the add time");

        let applied = store
            .update_account_changes(&id, TradingConditionId::from("vip"), dec!(0), false, false, Timestamp::from_millis(2_000))
            .unwrap();
        assert!(applied);
        let account = store.get(&id).unwrap();
        assert_eq!(account.last_update_time, Timestamp::from_millis(1_700_000_000_000));

        // dated after the previous event but before it was applied
        assert!(!store.check_event_time_newer(&id, Timestamp::from_millis(3_000)).unwrap());
        let applied = store
            .update_account_changes(&id, TradingConditionId::from("late"), dec!(0), true, false, Timestamp::from_millis(3_000))
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get(&id).unwrap().trading_condition_id.as_str(), "vip");
    }

    #[test]
    fn balance_update_invalidates_aggregate() {
        let (store, _) = store();
        let id = AccountId::from("a1");
        let before = store.get(&id).unwrap().aggregate.actual_version();
        store.update_account_balance(&id, dec!(42)).unwrap();
        let account = store.get(&id).unwrap();
        assert_eq!(account.balance, dec!(42));
        assert!(account.aggregate.actual_version() > before);
    }
}
