//! Order management: placement, pending activation, cancellation, changes
//! and the expiry sweep.

use super::core::TradingEngine;
use super::results::EngineError;
use crate::cache::OrderPartition;
use crate::events::{EventPayload, OrderCancelledEvent, OrderChangedEvent, OrderChangedField};
use crate::order::{Order, OrderCancellationReason, OrderRejectReason, OrderStateError};
use crate::position::{PositionCloseReason, PositionStatus};
use crate::types::{round_to, OrderId, OrderType, OriginatorType, PositionId, Timestamp};
use crate::validation::ValidationRejection;
use rust_decimal::Decimal;
use tracing::{info, warn};

impl TradingEngine {
    /// Entry point for new orders. Business rejections come back as an
    /// `Ok` order in the Rejected state.
    pub async fn place_order(&self, mut order: Order) -> Result<Order, EngineError> {
        if let Err(e) = order.validate() {
            let reason = match e {
                OrderStateError::AmbiguousParent(_) => OrderRejectReason::InvalidParent,
                OrderStateError::MissingPrice(_) => OrderRejectReason::InvalidExpectedOpenPrice,
                OrderStateError::ZeroVolume(_) => OrderRejectReason::InvalidVolume,
                _ => OrderRejectReason::TechnicalError,
            };
            self.reject_order(&mut order, reason, &e.to_string(), None);
            return Ok(order);
        }

        let Some(account) = self.accounts.try_get(&order.account_id) else {
            let message = format!("Account {} not found", order.account_id);
            self.reject_order(&mut order, OrderRejectReason::InvalidAccount, &message, None);
            return Ok(order);
        };
        order.trading_condition_id = account.trading_condition_id.clone();
        order.account_asset_id = account.base_asset_id.clone();
        if order.legal_entity.is_empty() {
            order.legal_entity = account.legal_entity.clone();
        }

        info!(
            order_id = %order.id,
            account_id = %order.account_id,
            instrument = %order.asset_pair_id,
            order_type = ?order.order_type,
            volume = %order.volume,
            "order placed"
        );
        self.emit(EventPayload::OrderPlaced(order.clone()));

        if order.order_type == OrderType::Market {
            self.place_order_by_market_price(order).await
        } else {
            self.place_pending_order(order).await
        }
    }

    pub(super) async fn place_order_by_market_price(&self, mut order: Order) -> Result<Order, EngineError> {
        let started = match self.start_closing_targets(&order) {
            Ok(started) => started,
            Err((reason, message)) => {
                self.reject_order(&mut order, reason, &message, None);
                return Ok(order);
            }
        };

        let matching_engine = self.router.for_order(&order);
        let executed = self
            .execute_order_by_matching_engine(order, matching_engine, true)
            .await;

        if executed.is_execution_not_started() {
            self.cancel_closing(&started);
        }
        Ok(executed)
    }

    pub(super) async fn place_pending_order(&self, mut order: Order) -> Result<Order, EngineError> {
        let now = self.clock.now();
        if order.is_expired(now) {
            self.reject_order(&mut order, OrderRejectReason::InvalidValidity, "Validity is already over", None);
            return Ok(order);
        }

        // 8.2: contingent orders wait on their parent order
        if let Some(parent_order_id) = order.parent_order_id.clone() {
            // parked before linking so a parent executing in between always
            // finds the child in Inactive
            let mut waiting = order.clone();
            waiting.make_inactive(now)?;
            self.cache.inactive().add(waiting.clone());
            let attached = self
                .cache
                .update_order(&parent_order_id, |parent| parent.add_related_order(&waiting))
                .is_some();
            if attached {
                return Ok(waiting);
            }
            self.cache.inactive().try_remove(&order.id);

            let position_id = PositionId::from(parent_order_id.clone());
            match self.cache.positions().try_get(&position_id) {
                Some(position) if position.status == PositionStatus::Active => {
                    order.change_volume(-position.volume, now);
                    order.relink_to_position(position_id, now);
                }
                _ => {
                    order.make_inactive(now)?;
                    let comment = format!("Parent order {parent_order_id} vanished");
                    order.cancel(now, OrderCancellationReason::ParentOrderVanished, Some(comment))?;
                    warn!(order_id = %order.id, parent_order_id = %parent_order_id, "parent order vanished");
                    self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
                        order: order.clone(),
                        reason: OrderCancellationReason::ParentOrderVanished,
                    }));
                    return Ok(order);
                }
            }
        }

        if let Some(position_id) = order.parent_position_id.clone() {
            let attached = self.cache.positions().update(&position_id, |position| {
                if position.status != PositionStatus::Active {
                    return false;
                }
                position.add_related_order(&order);
                true
            });
            let rejection = match attached {
                None => Some((OrderRejectReason::ParentPositionDoesNotExist, "Parent position does not exist")),
                Some(false) => Some((OrderRejectReason::ParentPositionIsNotActive, "Parent position is not active")),
                Some(true) => None,
            };
            if let Some((reason, message)) = rejection {
                self.reject_order(&mut order, reason, message, None);
                return Ok(order);
            }
        }

        order.activate(now)?;
        self.cache.active().add(order.clone());
        self.emit(EventPayload::OrderActivated(order.clone()));

        // the quote may have crossed while we were placing
        let executed = self.execute_pending_order_if_needed(&order.id).await?;
        Ok(executed.unwrap_or(order))
    }

    /// Executes an order already taken out of the cache.
    pub(super) async fn execute_pending_order(&self, mut order: Order) -> Result<Order, EngineError> {
        // a partially filled order already holds its targets in Closing
        let started = if order.matched_orders.is_empty() {
            match self.start_closing_targets(&order) {
                Ok(started) => started,
                Err((reason, message)) => {
                    self.reject_order(&mut order, reason, &message, None);
                    return Ok(order);
                }
            }
        } else {
            Vec::new()
        };

        let matching_engine = self.router.for_order(&order);
        let executed = self
            .execute_order_by_matching_engine(order, matching_engine, true)
            .await;

        if executed.is_execution_not_started() {
            self.cancel_closing(&started);
        }
        Ok(executed)
    }

    /// Executes the order right away when the cached quote already triggers it.
    pub(super) async fn execute_pending_order_if_needed(&self, order_id: &OrderId) -> Result<Option<Order>, EngineError> {
        let Some(order) = self.cache.active().try_get(order_id) else {
            return Ok(None);
        };
        let Some(quote) = self.quotes.try_get_quote(&order.asset_pair_id) else {
            return Ok(None);
        };
        if !self.is_ready_to_execute(&order, &quote) {
            return Ok(None);
        }
        // a tick may have dispatched it meanwhile
        let Some(order) = self.cache.active().try_remove(order_id) else {
            return Ok(None);
        };
        Ok(Some(self.execute_pending_order(order).await?))
    }

    pub async fn cancel_pending_order(
        &self,
        order_id: &OrderId,
        reason: OrderCancellationReason,
        comment: Option<String>,
    ) -> Result<Order, EngineError> {
        let Some((partition, _)) = self.cache.locate_order(order_id) else {
            return Err(EngineError::OrderNotFound(order_id.clone()));
        };
        if partition == OrderPartition::InProgress {
            return Err(EngineError::InvalidOperation(format!(
                "Order {order_id} is being executed and cannot be cancelled"
            )));
        }
        let Some(mut order) = self.cache.partition(partition).try_remove(order_id) else {
            return Err(EngineError::OrderNotFound(order_id.clone()));
        };

        if let Err(e) = order.cancel(self.clock.now(), reason, comment) {
            self.cache.partition(partition).add(order);
            return Err(e.into());
        }
        info!(order_id = %order.id, reason = ?reason, "order cancelled");
        self.detach_order(&order, OrderCancellationReason::BaseOrderCancelled);
        self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
            order: order.clone(),
            reason,
        }));
        if !order.matched_orders.is_empty() {
            let _token = self.account_locks.acquire(&order.account_id).await;
            self.settle_unfinished_order(&order);
        }
        Ok(order)
    }

    /// Changes price, validity and force-open of a resting order, one
    /// `OrderChanged` per field that actually changed.
    pub async fn change_order(
        &self,
        order_id: &OrderId,
        price: Decimal,
        validity: Option<Timestamp>,
        force_open: Option<bool>,
        originator: OriginatorType,
    ) -> Result<Order, EngineError> {
        let now = self.clock.now();
        let Some((partition, order)) = self.cache.locate_order(order_id) else {
            return Err(EngineError::OrderNotFound(order_id.clone()));
        };
        if partition == OrderPartition::InProgress {
            return Err(EngineError::InvalidOperation(format!(
                "Order {order_id} is being executed and cannot be changed"
            )));
        }

        let accuracy = self
            .assets
            .asset_pair(&order.asset_pair_id)
            .map(|pair| pair.accuracy)
            .unwrap_or(self.config.default_asset_pair_accuracy);
        let price = round_to(price, accuracy);
        if price <= Decimal::ZERO {
            return Err(ValidationRejection::new(
                OrderRejectReason::InvalidExpectedOpenPrice,
                format!("Price {price} must be positive"),
            )
            .into());
        }
        if validity.map_or(false, |v| now.day_index() > v.day_index()) {
            return Err(ValidationRejection::new(OrderRejectReason::InvalidValidity, "Validity is already over").into());
        }

        let (updated, changes) = self
            .cache
            .partition(partition)
            .update(order_id, |order| {
                let mut changes = Vec::new();
                if order.expected_open_price != Some(price) {
                    let old = order.change_price(price, now);
                    if order.order_type == OrderType::TrailingStop {
                        order.trailing_distance = None;
                    }
                    changes.push((OrderChangedField::Price, old.map(|p| p.to_string()).unwrap_or_default()));
                }
                if order.validity != validity {
                    let old = order.change_validity(validity, now);
                    changes.push((OrderChangedField::Validity, old.map(|v| v.to_string()).unwrap_or_default()));
                }
                if let Some(force_open) = force_open.filter(|f| *f != order.force_open) {
                    let old = order.change_force_open(force_open, now);
                    changes.push((OrderChangedField::ForceOpen, old.to_string()));
                }
                (order.clone(), changes)
            })
            .ok_or_else(|| EngineError::OrderNotFound(order_id.clone()))?;

        for (field, old_value) in changes {
            info!(order_id = %order_id, field = ?field, %old_value, originator = ?originator, "order changed");
            self.emit(EventPayload::OrderChanged(OrderChangedEvent {
                order: updated.clone(),
                field,
                old_value,
            }));
        }

        if partition != OrderPartition::Active {
            return Ok(updated);
        }
        let executed = self.execute_pending_order_if_needed(order_id).await?;
        Ok(executed.unwrap_or(updated))
    }

    /// Expires Active orders whose validity day ended before `interval_end`'s.
    pub async fn process_expired_orders(&self, interval_end: Timestamp) -> Vec<Order> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for candidate in self.cache.active().get_all() {
            if !candidate.validity.map_or(false, |v| v.day_index() < interval_end.day_index()) {
                continue;
            }
            let Some(mut order) = self.cache.active().try_remove(&candidate.id) else {
                continue;
            };
            if let Err(e) = order.expire(now) {
                warn!(order_id = %order.id, error = %e, "cannot expire order");
                continue;
            }
            self.detach_order(&order, OrderCancellationReason::BaseOrderCancelled);
            self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
                order: order.clone(),
                reason: OrderCancellationReason::Expired,
            }));
            if !order.matched_orders.is_empty() {
                let _token = self.account_locks.acquire(&order.account_id).await;
                self.settle_unfinished_order(&order);
            }
            expired.push(order);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), interval_end = %interval_end, "expired pending orders");
        }
        expired
    }

    /// Unlinks a finished order from its parent and cancels its contingent children.
    pub(super) fn detach_order(&self, order: &Order, children_reason: OrderCancellationReason) {
        if let Some(position_id) = &order.parent_position_id {
            self.cache
                .positions()
                .update(position_id, |p| p.remove_related_order(&order.id));
        }
        if let Some(parent_order_id) = &order.parent_order_id {
            self.cache
                .update_order(parent_order_id, |parent| parent.remove_related_order(&order.id));
        }
        self.cancel_related_orders(order.related_orders.iter().map(|r| &r.order_id), children_reason);
    }

    /// Cancels the listed Active or Inactive orders. In-flight ones are left alone.
    pub(super) fn cancel_related_orders<'a, I>(&self, order_ids: I, reason: OrderCancellationReason)
    where
        I: IntoIterator<Item = &'a OrderId>,
    {
        let now = self.clock.now();
        for order_id in order_ids {
            let Some(mut related) = self
                .cache
                .inactive()
                .try_remove(order_id)
                .or_else(|| self.cache.active().try_remove(order_id))
            else {
                continue;
            };
            if let Err(e) = related.cancel(now, reason, None) {
                warn!(order_id = %related.id, error = %e, "cannot cancel related order");
                continue;
            }
            info!(order_id = %related.id, reason = ?reason, "related order cancelled");
            self.emit(EventPayload::OrderCancelled(OrderCancelledEvent { order: related, reason }));
        }
    }

    /// Moves every targeted position to Closing. On any failure the ones
    /// already moved go back and the rejection to use is returned.
    pub(super) fn start_closing_targets(&self, order: &Order) -> Result<Vec<PositionId>, (OrderRejectReason, String)> {
        let now = self.clock.now();
        let reason = PositionCloseReason::for_order(order);
        let comment = order.comment.clone().unwrap_or_default();
        let mut started = Vec::new();

        for position_id in &order.positions_to_be_closed {
            let result = self
                .cache
                .positions()
                .update(position_id, |p| p.start_closing(now, reason, order.originator, &comment));
            let rejection = match result {
                Some(Ok(())) => {
                    started.push(position_id.clone());
                    continue;
                }
                None => (
                    OrderRejectReason::ParentPositionDoesNotExist,
                    format!("Position {position_id} does not exist"),
                ),
                Some(Err(_)) => (
                    OrderRejectReason::ParentPositionIsNotActive,
                    format!("Position {position_id} is not active"),
                ),
            };
            self.cancel_closing(&started);
            return Err(rejection);
        }
        Ok(started)
    }

    pub(super) fn cancel_closing(&self, position_ids: &[PositionId]) {
        let now = self.clock.now();
        for position_id in position_ids {
            self.cache.positions().update(position_id, |p| {
                if p.status == PositionStatus::Closing {
                    let _ = p.cancel_closing(now);
                }
            });
        }
    }

    /// Where a resting order currently sits. Orders being executed or
    /// already finished are not in the cache.
    pub fn get_order(&self, order_id: &OrderId) -> Option<(OrderPartition, Order)> {
        self.cache.locate_order(order_id)
    }
}
