//! In-memory order and position cache.
//!
//! Orders live in exactly one of three partitions (Active, Inactive,
//! InProgress); open positions live in their own group. Each group keeps its
//! instrument and account indices under the same lock as the items, so index
//! and partition changes are atomic. Every getter hands out clones.
//!
//! Adding a duplicate id or removing an absent one is a caller bug and panics.

use crate::order::Order;
use crate::position::Position;
use crate::types::{AccountId, AssetPairId, OrderId, PositionId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

pub trait CacheItem: Clone {
    type Id: Clone + Eq + Hash + Debug;

    fn cache_id(&self) -> &Self::Id;
    fn cache_account_id(&self) -> &AccountId;
    fn cache_asset_pair_id(&self) -> &AssetPairId;
}

impl CacheItem for Order {
    type Id = OrderId;

    fn cache_id(&self) -> &OrderId {
        &self.id
    }

    fn cache_account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn cache_asset_pair_id(&self) -> &AssetPairId {
        &self.asset_pair_id
    }
}

impl CacheItem for Position {
    type Id = PositionId;

    fn cache_id(&self) -> &PositionId {
        &self.id
    }

    fn cache_account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn cache_asset_pair_id(&self) -> &AssetPairId {
        &self.asset_pair_id
    }
}

#[derive(Debug)]
struct GroupInner<T: CacheItem> {
    items: HashMap<T::Id, T>,
    by_instrument: HashMap<AssetPairId, HashSet<T::Id>>,
    by_account: HashMap<AccountId, HashSet<T::Id>>,
}

impl<T: CacheItem> GroupInner<T> {
    fn index(&mut self, item: &T) {
        let id = item.cache_id().clone();
        self.by_instrument
            .entry(item.cache_asset_pair_id().clone())
            .or_default()
            .insert(id.clone());
        self.by_account
            .entry(item.cache_account_id().clone())
            .or_default()
            .insert(id);
    }

    fn unindex(&mut self, item: &T) {
        let id = item.cache_id();
        if let Some(ids) = self.by_instrument.get_mut(item.cache_asset_pair_id()) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_instrument.remove(item.cache_asset_pair_id());
            }
        }
        if let Some(ids) = self.by_account.get_mut(item.cache_account_id()) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_account.remove(item.cache_account_id());
            }
        }
    }

    fn collect(&self, ids: Option<&HashSet<T::Id>>) -> Vec<T> {
        ids.map(|ids| ids.iter().filter_map(|id| self.items.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// One indexed partition.
#[derive(Debug)]
pub struct CacheGroup<T: CacheItem> {
    name: &'static str,
    inner: RwLock<GroupInner<T>>,
}

impl<T: CacheItem> CacheGroup<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(GroupInner {
                items: HashMap::new(),
                by_instrument: HashMap::new(),
                by_account: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, item: T) {
        let mut inner = self.inner.write();
        let id = item.cache_id().clone();
        if inner.items.contains_key(&id) {
            panic!("{}: duplicate id {:?}", self.name, id);
        }
        inner.index(&item);
        inner.items.insert(id, item);
    }

    pub fn remove(&self, id: &T::Id) -> T {
        match self.try_remove(id) {
            Some(item) => item,
            None => panic!("{}: cannot remove absent id {:?}", self.name, id),
        }
    }

    pub fn try_remove(&self, id: &T::Id) -> Option<T> {
        let mut inner = self.inner.write();
        let item = inner.items.remove(id)?;
        inner.unindex(&item);
        Some(item)
    }

    /// Removes the item only if `predicate` holds for it.
    pub fn remove_if<F>(&self, id: &T::Id, predicate: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.inner.write();
        if !inner.items.get(id).map_or(false, predicate) {
            return None;
        }
        let item = inner.items.remove(id)?;
        inner.unindex(&item);
        Some(item)
    }

    /// Applies `change` to the stored item in place. Ids and index keys must not change.
    pub fn update<R, F>(&self, id: &T::Id, change: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut inner = self.inner.write();
        inner.items.get_mut(id).map(change)
    }

    pub fn add_or_update(&self, item: T) {
        let mut inner = self.inner.write();
        let id = item.cache_id().clone();
        if let Some(previous) = inner.items.remove(&id) {
            inner.unindex(&previous);
        }
        inner.index(&item);
        inner.items.insert(id, item);
    }

    pub fn get_or_add<F>(&self, id: &T::Id, create: F) -> T
    where
        F: FnOnce() -> T,
    {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.items.get(id) {
            return existing.clone();
        }
        let item = create();
        inner.index(&item);
        inner.items.insert(id.clone(), item.clone());
        item
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.inner.read().items.contains_key(id)
    }

    pub fn try_get(&self, id: &T::Id) -> Option<T> {
        self.inner.read().items.get(id).cloned()
    }

    pub fn get_all(&self) -> Vec<T> {
        self.inner.read().items.values().cloned().collect()
    }

    pub fn get_by_instrument(&self, asset_pair_id: &AssetPairId) -> Vec<T> {
        let inner = self.inner.read();
        inner.collect(inner.by_instrument.get(asset_pair_id))
    }

    pub fn get_by_account(&self, account_id: &AccountId) -> Vec<T> {
        let inner = self.inner.read();
        inner.collect(inner.by_account.get(account_id))
    }

    pub fn get_by_instrument_and_account(&self, asset_pair_id: &AssetPairId, account_id: &AccountId) -> Vec<T> {
        let inner = self.inner.read();
        let (Some(by_pair), Some(by_account)) =
            (inner.by_instrument.get(asset_pair_id), inner.by_account.get(account_id))
        else {
            return Vec::new();
        };
        by_pair
            .intersection(by_account)
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn count_by_account(&self, account_id: &AccountId) -> usize {
        self.inner
            .read()
            .by_account
            .get(account_id)
            .map_or(0, |ids| ids.len())
    }

    pub fn init(&self, items: Vec<T>) {
        let mut inner = self.inner.write();
        inner.items.clear();
        inner.by_instrument.clear();
        inner.by_account.clear();
        for item in items {
            inner.index(&item);
            inner.items.insert(item.cache_id().clone(), item);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPartition {
    Active,
    Inactive,
    InProgress,
}

#[derive(Debug)]
pub struct OrderCache {
    active: CacheGroup<Order>,
    inactive: CacheGroup<Order>,
    in_progress: CacheGroup<Order>,
    positions: CacheGroup<Position>,
}

impl Default for OrderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderCache {
    pub fn new() -> Self {
        Self {
            active: CacheGroup::new("active orders"),
            inactive: CacheGroup::new("inactive orders"),
            in_progress: CacheGroup::new("in progress orders"),
            positions: CacheGroup::new("positions"),
        }
    }

    pub fn active(&self) -> &CacheGroup<Order> {
        &self.active
    }

    pub fn inactive(&self) -> &CacheGroup<Order> {
        &self.inactive
    }

    pub fn in_progress(&self) -> &CacheGroup<Order> {
        &self.in_progress
    }

    pub fn positions(&self) -> &CacheGroup<Position> {
        &self.positions
    }

    pub fn partition(&self, partition: OrderPartition) -> &CacheGroup<Order> {
        match partition {
            OrderPartition::Active => &self.active,
            OrderPartition::Inactive => &self.inactive,
            OrderPartition::InProgress => &self.in_progress,
        }
    }

    pub fn locate_order(&self, id: &OrderId) -> Option<(OrderPartition, Order)> {
        [OrderPartition::Active, OrderPartition::Inactive, OrderPartition::InProgress]
            .into_iter()
            .find_map(|p| self.partition(p).try_get(id).map(|o| (p, o)))
    }

    pub fn try_get_order(&self, id: &OrderId) -> Option<Order> {
        self.locate_order(id).map(|(_, order)| order)
    }

    /// Removes an order from whichever partition holds it.
    pub fn take_order(&self, id: &OrderId) -> Option<(OrderPartition, Order)> {
        [OrderPartition::Active, OrderPartition::Inactive, OrderPartition::InProgress]
            .into_iter()
            .find_map(|p| self.partition(p).try_remove(id).map(|o| (p, o)))
    }

    pub fn update_order<R, F>(&self, id: &OrderId, change: F) -> Option<R>
    where
        F: FnOnce(&mut Order) -> R,
    {
        let (partition, _) = self.locate_order(id)?;
        self.partition(partition).update(id, change)
    }

    pub fn pending_orders_by_account(&self, account_id: &AccountId) -> Vec<Order> {
        let mut orders = self.active.get_by_account(account_id);
        orders.extend(self.inactive.get_by_account(account_id));
        orders
    }

    pub fn get_all_orders(&self) -> Vec<Order> {
        let mut orders = self.active.get_all();
        orders.extend(self.inactive.get_all());
        orders.extend(self.in_progress.get_all());
        orders
    }

    /// Cold start: replaces the open-position set.
    pub fn init_positions(&self, positions: Vec<Position>) {
        self.positions.init(positions);
    }

    pub fn init_orders(&self, active: Vec<Order>, inactive: Vec<Order>) {
        self.active.init(active);
        self.inactive.init(inactive);
        self.in_progress.init(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, Timestamp};
    use rust_decimal_macros::dec;

    fn order(id: &str, account: &str, pair: &str) -> Order {
        Order::pending(id, account, pair, dec!(1), OrderType::Limit, dec!(1), Timestamp::from_millis(0))
    }

    #[test]
    fn indices_follow_partition_changes() {
        let cache = OrderCache::new();
        cache.active().add(order("o1", "a1", "EURUSD"));
        cache.active().add(order("o2", "a1", "BTCUSD"));
        cache.active().add(order("o3", "a2", "EURUSD"));

        assert_eq!(cache.active().get_by_instrument(&AssetPairId::from("EURUSD")).len(), 2);
        assert_eq!(cache.active().get_by_account(&AccountId::from("a1")).len(), 2);
        assert_eq!(
            cache
                .active()
                .get_by_instrument_and_account(&AssetPairId::from("EURUSD"), &AccountId::from("a2"))
                .len(),
            1
        );

        let moved = cache.active().remove(&OrderId::from("o1"));
        cache.in_progress().add(moved);
        assert_eq!(cache.active().get_by_instrument(&AssetPairId::from("EURUSD")).len(), 1);
        assert_eq!(
            cache.locate_order(&OrderId::from("o1")).map(|(p, _)| p),
            Some(OrderPartition::InProgress)
        );
    }

    #[test]
    #[should_panic(expected = "duplicate id")]
    fn duplicate_add_panics() {
        let cache = OrderCache::new();
        cache.active().add(order("o1", "a1", "EURUSD"));
        cache.active().add(order("o1", "a1", "EURUSD"));
    }

    #[test]
    #[should_panic(expected = "absent id")]
    fn removing_absent_panics() {
        let cache = OrderCache::new();
        cache.inactive().remove(&OrderId::from("missing"));
    }

    #[test]
    fn snapshots_are_copies() {
        let cache = OrderCache::new();
        cache.active().add(order("o1", "a1", "EURUSD"));
        let mut snapshot = cache.active().try_get(&OrderId::from("o1")).unwrap();
        snapshot.volume = dec!(99);
        assert_eq!(cache.active().try_get(&OrderId::from("o1")).unwrap().volume, dec!(1));

        cache.update_order(&OrderId::from("o1"), |o| o.volume = dec!(5));
        assert_eq!(cache.try_get_order(&OrderId::from("o1")).unwrap().volume, dec!(5));
    }

    #[test]
    fn remove_if_checks_predicate_under_lock() {
        let cache = OrderCache::new();
        cache.active().add(order("o1", "a1", "EURUSD"));
        assert!(cache.active().remove_if(&OrderId::from("o1"), |o| o.volume > dec!(1)).is_none());
        assert!(cache.active().remove_if(&OrderId::from("o1"), |o| o.volume == dec!(1)).is_some());
        assert_eq!(cache.active().count(), 0);
    }

    #[test]
    fn get_or_add_is_idempotent() {
        let cache = OrderCache::new();
        let first = cache.active().get_or_add(&OrderId::from("o1"), || order("o1", "a1", "EURUSD"));
        let second = cache.active().get_or_add(&OrderId::from("o1"), || order("o1", "a9", "XXX"));
        assert_eq!(first.account_id, second.account_id);
        assert_eq!(cache.active().count_by_account(&AccountId::from("a1")), 1);
    }
}
