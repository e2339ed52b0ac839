//! Order execution against a matching engine.
//!
//! Everything between "this order should trade now" and "fills are applied"
//! happens here under the account's execution token: expiry, rates, volume
//! reconciliation for closes, pre-trade validation, matching, and the
//! rejection/retry policy.

use super::core::TradingEngine;
use super::results::EngineError;
use crate::events::{EventPayload, OrderCancelledEvent, OrderChangedEvent, OrderChangedField, OrderRejectedEvent};
use crate::margin::MarginError;
use crate::matching::MatchingEngine;
use crate::order::{Order, OrderCancellationReason, OrderRejectReason, OrderStatus};
use crate::types::{
    is_zero_volume, round_volume, OrderFillType, OrderType, OriginatorType, PositionDirection, Timestamp,
};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl TradingEngine {
    /// Runs one execution attempt and returns the order in whatever state it
    /// ended. Technical failures become a TechnicalError rejection.
    pub(super) async fn execute_order_by_matching_engine(
        &self,
        mut order: Order,
        matching_engine: Arc<dyn MatchingEngine>,
        check_stop_out: bool,
    ) -> Order {
        let account_id = order.account_id.clone();
        let token = self.account_locks.acquire(&account_id).await;

        if let Err(e) = self.try_execute(&mut order, matching_engine.as_ref()).await {
            error!(order_id = %order.id, error = %e, "technical error while executing order");
            self.reject_order(&mut order, OrderRejectReason::TechnicalError, &e.to_string(), None);
        }
        if order.status.is_terminal() && order.status != OrderStatus::Executed && !order.matched_orders.is_empty() {
            self.settle_unfinished_order(&order);
        }
        drop(token);

        if check_stop_out && order.status == OrderStatus::Executed {
            if let Err(e) = self.check_stop_out(&account_id, None) {
                error!(account_id = %account_id, error = %e, "stop out check failed after execution");
            }
        }
        order
    }

    async fn try_execute(&self, order: &mut Order, matching_engine: &dyn MatchingEngine) -> Result<(), EngineError> {
        let now = self.clock.now();
        if self.check_if_order_is_expired(order, now) {
            return Ok(());
        }
        if !self.set_rates(order)? {
            return Ok(());
        }
        if !self.change_order_volume_if_needed(order, now) {
            return Ok(());
        }

        let (wants_to_open, released_margin) = self.match_on_existing_positions(order)?;

        if !order.modality.is_liquidation() && order.originator != OriginatorType::System {
            if let Err(rejection) = self
                .validator
                .pre_trade_validate(order, wants_to_open, matching_engine.id(), released_margin)
                .await
            {
                self.reject_order(order, rejection.reason, &rejection.message, rejection.comment);
                return Ok(());
            }
        }

        order.start_execution(now, matching_engine.id())?;
        self.emit(EventPayload::OrderExecutionStarted(order.clone()));

        let fills = matching_engine
            .match_order(order, wants_to_open, order.modality)
            .await?;
        let now = self.clock.now();

        if fills.is_empty() {
            self.reject_order(order, OrderRejectReason::NoLiquidity, "No liquidity", None);
            return Ok(());
        }

        if round_volume(fills.summary_volume()) < order.remaining_volume() {
            if order.fill_type == OrderFillType::FillOrKill {
                self.reject_order(order, OrderRejectReason::NoLiquidity, "Not fully matched", None);
                return Ok(());
            }
            order.partially_execute(now, fills)?;
            info!(
                order_id = %order.id,
                matched = %order.matched_orders.summary_volume(),
                volume = %order.volume,
                "order partially executed"
            );
            self.emit(EventPayload::OrderPartiallyExecuted(order.clone()));
            self.cache.in_progress().add(order.clone());
            return Ok(());
        }

        order.execute(now, fills)?;
        info!(
            order_id = %order.id,
            account_id = %order.account_id,
            price = ?order.execution_price,
            volume = %order.volume,
            "order executed"
        );
        self.emit(EventPayload::OrderExecuted(order.clone()));
        self.apply_executed_order(order)
    }

    /// NoLiquidity on a pending order requeues it to Active until the retry
    /// threshold. Everything else is terminal.
    pub(super) fn reject_order(
        &self,
        order: &mut Order,
        reason: OrderRejectReason,
        message: &str,
        comment: Option<String>,
    ) {
        let now = self.clock.now();
        let attempts = order.pending_order_retries_count + 1;
        let retryable = order.order_type != OrderType::Market
            && reason == OrderRejectReason::NoLiquidity
            && attempts < self.config.pending_order_retries_threshold;

        if retryable && !self.cache.active().contains(&order.id) && self.requeue(order, attempts, now) {
            return;
        }

        if let Err(e) = order.reject(reason, message, comment, now) {
            error!(order_id = %order.id, error = %e, "cannot reject order");
            return;
        }
        warn!(order_id = %order.id, reason = ?reason, message, "order rejected");
        self.detach_order(order, OrderCancellationReason::BaseOrderCancelled);
        self.emit(EventPayload::OrderRejected(OrderRejectedEvent {
            order: order.clone(),
            reason,
            message: message.to_string(),
        }));
    }

    fn requeue(&self, order: &mut Order, attempts: u32, now: Timestamp) -> bool {
        if order.status == OrderStatus::ExecutionStarted {
            if let Err(e) = order.cancel_execution(now) {
                error!(order_id = %order.id, error = %e, "cannot requeue order");
                return false;
            }
        }
        if order.status != OrderStatus::Active {
            return false;
        }

        let previous = order.pending_order_retries_count;
        order.pending_order_retries_count = attempts;
        self.cache.active().add(order.clone());
        warn!(order_id = %order.id, attempts, "no liquidity, pending order requeued");
        self.emit(EventPayload::OrderChanged(OrderChangedEvent {
            order: order.clone(),
            field: OrderChangedField::PendingRetries,
            old_value: previous.to_string(),
        }));
        true
    }

    /// Expires the order if its validity day is over. True when it did.
    pub(super) fn check_if_order_is_expired(&self, order: &mut Order, now: Timestamp) -> bool {
        if !order.is_expired(now) {
            return false;
        }
        if let Err(e) = order.expire(now) {
            error!(order_id = %order.id, error = %e, "cannot expire order");
            return false;
        }
        info!(order_id = %order.id, validity = ?order.validity, "order expired");
        self.detach_order(order, OrderCancellationReason::BaseOrderCancelled);
        self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
            order: order.clone(),
            reason: OrderCancellationReason::Expired,
        }));
        true
    }

    /// Converts the quote asset into the account asset. A missing cross quote
    /// means we cannot price the trade, which counts as no liquidity.
    pub(super) fn set_rates(&self, order: &mut Order) -> Result<bool, EngineError> {
        let rate = self.calculator.quote_rate_for_quote_asset(
            &order.account_asset_id,
            &order.asset_pair_id,
            &order.legal_entity,
            true,
        );
        match rate {
            Ok(rate) => {
                order.set_fx_rate(rate);
                Ok(true)
            }
            Err(MarginError::Quote(e)) => {
                self.reject_order(order, OrderRejectReason::NoLiquidity, &e.to_string(), None);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close orders trade the live net of their targets, not what was asked
    /// for at request time. False when nothing is left to close.
    pub(super) fn change_order_volume_if_needed(&self, order: &mut Order, now: Timestamp) -> bool {
        if order.positions_to_be_closed.is_empty() || !order.matched_orders.is_empty() {
            return true;
        }

        let net: Decimal = order
            .positions_to_be_closed
            .iter()
            .filter_map(|id| self.cache.positions().try_get(id))
            .map(|p| p.volume)
            .sum();
        let volume = (-net).round_dp(self.config.volume_accuracy);

        if is_zero_volume(volume) {
            self.reject_order(
                order,
                OrderRejectReason::ParentPositionDoesNotExist,
                "Positions to close no longer exist",
                None,
            );
            return false;
        }

        if volume != order.volume {
            let previous = order.volume;
            order.change_volume(volume, now);
            debug!(order_id = %order.id, %previous, %volume, "close volume reconciled with live positions");
            self.emit(EventPayload::OrderChanged(OrderChangedEvent {
                order: order.clone(),
                field: OrderChangedField::Volume,
                old_value: previous.to_string(),
            }));
        }
        true
    }

    /// Whether the order grows exposure, and how much margin the positions it
    /// reduces would free up.
    pub(super) fn match_on_existing_positions(&self, order: &Order) -> Result<(bool, Decimal), EngineError> {
        if order.force_open {
            return Ok((true, Decimal::ZERO));
        }

        if !order.positions_to_be_closed.is_empty() {
            let mut released = Decimal::ZERO;
            for position in order
                .positions_to_be_closed
                .iter()
                .filter_map(|id| self.cache.positions().try_get(id))
            {
                released += self.calculator.position_fpl(&position)?.margin_maintenance;
            }
            return Ok((false, released));
        }

        let positions = self
            .cache
            .positions()
            .get_by_instrument_and_account(&order.asset_pair_id, &order.account_id);
        let net: Decimal = positions.iter().map(|p| p.volume).sum();
        let new_net = net + order.volume;
        let wants_to_open = (new_net.signum() != net.signum() && !new_net.is_zero()) || new_net.abs() > net.abs();

        let opposite: Vec<_> = positions
            .iter()
            .filter(|p| p.direction() != PositionDirection::from_volume(order.volume))
            .collect();
        let opposite_volume: Decimal = opposite.iter().map(|p| p.volume.abs()).sum();
        if opposite_volume.is_zero() {
            return Ok((wants_to_open, Decimal::ZERO));
        }

        let share = order.volume.abs().min(opposite_volume) / opposite_volume;
        let mut released = Decimal::ZERO;
        for position in opposite {
            released += self.calculator.position_fpl(position)?.margin_maintenance * share;
        }
        Ok((wants_to_open, released))
    }
}
