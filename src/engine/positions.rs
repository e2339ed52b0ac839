//! Position management: applying executed orders to positions, and the
//! aggregated close used by group closes and special liquidation.

use super::core::TradingEngine;
use super::results::{EngineError, PositionCloseOutcome, PositionCloseResult, PositionsCloseData};
use crate::events::{EventPayload, OrderCancelledEvent, PositionClosedEvent};
use crate::liquidation::{
    LiquidationCommand, LiquidationType, StartLiquidationCommand, StartSpecialLiquidationCommand,
};
use crate::matching::MatchingEngine;
use crate::order::{MatchedOrderCollection, Order, OrderCancellationReason, OrderRejectReason, OrderStatus};
use crate::position::{Position, PositionCloseReason, PositionStatus};
use crate::types::{
    is_zero_volume, AccountId, AssetPairId, OrderFillType, OrderId, OrderModality, OrderType, OriginatorType,
    PositionDirection, PositionId,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

impl TradingEngine {
    // 8.3: fills to positions. caller holds the account's execution token

    /// Closes what the order targets, otherwise nets FIFO against opposite
    /// positions, and opens a position with whatever volume is left.
    pub(super) fn apply_executed_order(&self, order: &Order) -> Result<(), EngineError> {
        let mut fills = order.matched_orders.clone();
        let reason = PositionCloseReason::for_order(order);
        let mut opened = None;

        if !order.positions_to_be_closed.is_empty() {
            for position_id in &order.positions_to_be_closed {
                let Some(position) = self.cache.positions().try_get(position_id) else {
                    warn!(order_id = %order.id, position_id = %position_id, "targeted position vanished before close");
                    continue;
                };
                let part = fills.take_volume(position.volume.abs());
                if part.is_empty() {
                    break;
                }
                self.close_position_part(position, part, order, reason)?;
            }
            if !is_zero_volume(fills.summary_volume()) {
                warn!(order_id = %order.id, left = %fills.summary_volume(), "close order overfilled its targets");
            }
        } else {
            if !order.force_open {
                let mut opposite: Vec<Position> = self
                    .cache
                    .positions()
                    .get_by_instrument_and_account(&order.asset_pair_id, &order.account_id)
                    .into_iter()
                    .filter(|p| p.status == PositionStatus::Active)
                    .filter(|p| p.direction().close_direction() == order.direction())
                    .collect();
                opposite.sort_by(|a, b| a.open_date.cmp(&b.open_date).then_with(|| a.id.cmp(&b.id)));

                for position in opposite {
                    if is_zero_volume(fills.summary_volume()) {
                        break;
                    }
                    let part = fills.take_volume(position.volume.abs());
                    self.close_position_part(position, part, order, reason)?;
                }
            }
            if !is_zero_volume(fills.summary_volume()) {
                opened = Some(self.open_position(order, fills)?);
            }
        }

        self.activate_contingent_orders(order, opened.as_ref());
        self.accounts.mark_dirty(&order.account_id);
        Ok(())
    }

    fn close_position_part(
        &self,
        position: Position,
        fills: MatchedOrderCollection,
        order: &Order,
        reason: PositionCloseReason,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let closed_volume = fills.summary_volume();
        let Some(close_price) = fills.weighted_average_price() else {
            return Ok(());
        };
        let realized_pnl = self.calculator.realized_pnl(&position, closed_volume, close_price)?;

        let (fully_closed, updated) = self
            .cache
            .positions()
            .update(&position.id, |p| {
                let fully_closed = p.partially_close(now, fills, reason, order.originator)?;
                if !fully_closed && p.status == PositionStatus::Closing {
                    p.cancel_closing(now)?;
                }
                Ok::<_, EngineError>((fully_closed, p.clone()))
            })
            .ok_or_else(|| EngineError::PositionNotFound(position.id.clone()))??;

        let event = PositionClosedEvent {
            position: updated,
            closed_volume,
            realized_pnl,
        };
        if !fully_closed {
            info!(position_id = %position.id, %closed_volume, %realized_pnl, "position partially closed");
            self.emit(EventPayload::PositionPartiallyClosed(event));
            return Ok(());
        }

        self.cache.positions().try_remove(&position.id);
        info!(
            position_id = %position.id,
            account_id = %position.account_id,
            close_price = %close_price,
            %realized_pnl,
            "position closed"
        );
        let related: Vec<OrderId> = event.position.related_orders.iter().map(|r| r.order_id.clone()).collect();
        self.emit(EventPayload::PositionClosed(event));
        self.cancel_related_orders(related.iter(), OrderCancellationReason::ParentPositionClosed);
        Ok(())
    }

    fn open_position(&self, order: &Order, fills: MatchedOrderCollection) -> Result<Position, EngineError> {
        let instrument = self
            .assets
            .instrument(&order.trading_condition_id, &order.asset_pair_id)?;
        let position = Position::open(order, fills, self.clock.now())
            .with_commissions(instrument.open_commission_rate, instrument.close_commission_rate);

        self.cache.positions().add(position.clone());
        info!(
            position_id = %position.id,
            account_id = %position.account_id,
            volume = %position.volume,
            open_price = %position.open_price,
            "position opened"
        );
        self.emit(EventPayload::PositionOpened(position.clone()));
        Ok(position)
    }

    /// Inactive orders waiting on `order` follow it into the position it
    /// opened, or die with it when it opened none.
    fn activate_contingent_orders(&self, order: &Order, opened: Option<&Position>) {
        let now = self.clock.now();
        for related in &order.related_orders {
            let Some(mut child) = self.cache.inactive().try_remove(&related.order_id) else {
                continue;
            };

            let Some(position) = opened else {
                let comment = format!("Parent order {} opened no position", order.id);
                if child
                    .cancel(now, OrderCancellationReason::ParentOrderVanished, Some(comment))
                    .is_ok()
                {
                    self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
                        order: child,
                        reason: OrderCancellationReason::ParentOrderVanished,
                    }));
                }
                continue;
            };

            child.change_volume(-position.volume, now);
            child.relink_to_position(position.id.clone(), now);
            if let Err(e) = child.activate(now) {
                warn!(order_id = %child.id, error = %e, "cannot activate contingent order");
                continue;
            }
            self.cache
                .positions()
                .update(&position.id, |p| p.add_related_order(&child));
            self.cache.active().add(child.clone());
            info!(order_id = %child.id, position_id = %position.id, "contingent order activated");
            self.emit(EventPayload::OrderActivated(child));
        }
    }

    /// An order that matched part of its volume and then ended without
    /// executing still applies what it matched. Targets it held in Closing
    /// go back to Active. Caller holds the account's execution token.
    pub(super) fn settle_unfinished_order(&self, order: &Order) {
        info!(
            order_id = %order.id,
            status = ?order.status,
            matched = %order.matched_orders.summary_volume(),
            "applying fills of unfinished order"
        );
        if let Err(e) = self.apply_executed_order(order) {
            error!(order_id = %order.id, error = %e, "cannot apply fills of unfinished order");
        }
        self.cancel_closing(&order.positions_to_be_closed);
    }

    // 8.4: aggregated closes

    /// Closes a group of positions already in Closing with one fill-or-kill
    /// market order sized at execution time. On NoLiquidity the positions
    /// either go back to Active or, when allowed, go to special liquidation.
    pub async fn close_positions(
        &self,
        data: PositionsCloseData,
        matching_engine: Arc<dyn MatchingEngine>,
        special_liquidation_enabled: bool,
    ) -> Result<(Order, PositionCloseResult), EngineError> {
        let now = self.clock.now();
        let account = self.accounts.get(&data.account_id)?;
        let position_ids = data.position_ids();
        let volume: Decimal = -data.positions.iter().map(|p| p.volume).sum::<Decimal>();

        let mut order = Order::new(
            OrderId::new(self.ids.generate()),
            data.account_id.clone(),
            data.asset_pair_id.clone(),
            volume.round_dp(self.config.volume_accuracy),
            OrderType::Market,
            now,
        )
        .with_fill_type(OrderFillType::FillOrKill)
        .with_originator(data.originator)
        .with_modality(data.modality);
        if let [single] = position_ids.as_slice() {
            order.parent_position_id = Some(single.clone());
        }
        order.positions_to_be_closed = position_ids.clone();
        order.trading_condition_id = account.trading_condition_id.clone();
        order.account_asset_id = account.base_asset_id.clone();
        order.legal_entity = data.legal_entity.clone();
        order.external_provider_id = data.external_provider_id.clone();
        order.additional_info = data.additional_info.clone();
        order.correlation_id = data.correlation_id.clone();
        order.comment = data.comment.clone();

        self.emit(EventPayload::OrderPlaced(order.clone()));
        let order = self
            .execute_order_by_matching_engine(order, matching_engine, true)
            .await;

        match order.status {
            OrderStatus::Executed => return Ok((order, PositionCloseResult::Closed)),
            OrderStatus::PartiallyFilled | OrderStatus::ExecutionStarted => {
                return Ok((order, PositionCloseResult::ClosingIsInProgress))
            }
            _ => {}
        }

        if order.reject_reason == Some(OrderRejectReason::NoLiquidity) && special_liquidation_enabled {
            let command = StartSpecialLiquidationCommand {
                operation_id: self.ids.generate(),
                account_id: data.account_id.clone(),
                position_ids: position_ids.clone(),
                additional_info: data.additional_info.clone(),
                originator: data.originator,
                correlation_id: data.correlation_id.clone(),
                creation_time: self.clock.now(),
            };
            info!(
                account_id = %data.account_id,
                operation_id = %command.operation_id,
                positions = position_ids.len(),
                "no liquidity for close, starting special liquidation"
            );
            match self.commands.send(LiquidationCommand::StartSpecialLiquidation(command)) {
                Ok(()) => return Ok((order, PositionCloseResult::ClosingStarted)),
                Err(e) => warn!(account_id = %data.account_id, error = %e, "cannot start special liquidation"),
            }
        }

        self.cancel_closing(&position_ids);
        Err(EngineError::PositionsNotClosed(
            order
                .reject_reason_text
                .clone()
                .unwrap_or_else(|| format!("Close order ended {:?}", order.status)),
        ))
    }

    /// Closes an account's positions, optionally one instrument and direction
    /// only. Without an instrument the whole account goes to forced liquidation.
    pub async fn close_positions_group(
        &self,
        account_id: &AccountId,
        asset_pair_id: Option<&AssetPairId>,
        direction: Option<PositionDirection>,
        originator: OriginatorType,
        additional_info: &str,
        correlation_id: &str,
    ) -> Result<Vec<PositionCloseOutcome>, EngineError> {
        let account = self.accounts.get(account_id)?;

        let Some(asset_pair_id) = asset_pair_id else {
            return self.start_forced_liquidation(account_id, direction, originator, additional_info);
        };

        let now = self.clock.now();
        let positions: Vec<Position> = self
            .cache
            .positions()
            .get_by_instrument_and_account(asset_pair_id, account_id)
            .into_iter()
            .filter(|p| direction.map_or(true, |d| p.direction() == d))
            .collect();

        let mut outcomes = Vec::new();
        let mut groups: Vec<((PositionDirection, String, Option<String>), Vec<Position>)> = Vec::new();
        for position in positions {
            let started = self
                .cache
                .positions()
                .update(&position.id, |p| {
                    p.start_closing(now, PositionCloseReason::Close, originator, additional_info)
                })
                .map_or(false, |r| r.is_ok());
            if !started {
                outcomes.push(PositionCloseOutcome::new(
                    position.id.clone(),
                    PositionCloseResult::ClosingIsInProgress,
                    None,
                ));
                continue;
            }

            let key = (
                position.direction(),
                position.open_matching_engine_id.clone(),
                position.external_provider_id.clone(),
            );
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(position),
                None => groups.push((key, vec![position])),
            }
        }

        for ((_, open_matching_engine_id, external_provider_id), group) in groups {
            let data = PositionsCloseData {
                positions: group,
                account_id: account_id.clone(),
                asset_pair_id: asset_pair_id.clone(),
                open_matching_engine_id: open_matching_engine_id.clone(),
                external_provider_id,
                legal_entity: account.legal_entity.clone(),
                originator,
                modality: OrderModality::Regular,
                additional_info: additional_info.to_string(),
                correlation_id: correlation_id.to_string(),
                comment: None,
            };
            let ids = data.position_ids();
            let matching_engine = self.router.for_close(&open_matching_engine_id, asset_pair_id);

            match self
                .close_positions(data, matching_engine, self.config.special_liquidation_enabled)
                .await
            {
                Ok((order, result)) => outcomes.extend(
                    ids.into_iter()
                        .map(|id| PositionCloseOutcome::new(id, result, Some(order.clone()))),
                ),
                Err(e) => {
                    warn!(account_id = %account_id, instrument = %asset_pair_id, error = %e, "failed to close positions");
                    outcomes.extend(
                        ids.into_iter()
                            .map(|id| PositionCloseOutcome::new(id, PositionCloseResult::FailedToClose, None)),
                    );
                }
            }
        }
        Ok(outcomes)
    }

    fn start_forced_liquidation(
        &self,
        account_id: &AccountId,
        direction: Option<PositionDirection>,
        originator: OriginatorType,
        additional_info: &str,
    ) -> Result<Vec<PositionCloseOutcome>, EngineError> {
        let positions = self.cache.positions().get_by_account(account_id);
        let operation_id = self.ids.generate();

        let result = if self.accounts.try_start_liquidation(account_id, &operation_id)? {
            let command = StartLiquidationCommand {
                operation_id: operation_id.clone(),
                account_id: account_id.clone(),
                liquidation_type: LiquidationType::Forced,
                direction,
                asset_pair_id: None,
                quote_info: None,
                originator,
                creation_time: self.clock.now(),
                additional_info: additional_info.to_string(),
            };
            if let Err(e) = self.commands.send(LiquidationCommand::StartLiquidation(command)) {
                self.accounts.finish_liquidation(account_id, &operation_id)?;
                return Err(e.into());
            }
            info!(account_id = %account_id, operation_id = %operation_id, "forced liquidation started");
            PositionCloseResult::ClosingStarted
        } else {
            PositionCloseResult::ClosingIsInProgress
        };

        Ok(positions
            .into_iter()
            .filter(|p| direction.map_or(true, |d| p.direction() == d))
            .map(|p| PositionCloseOutcome::new(p.id, result, None))
            .collect())
    }

    /// Saga entry: executes the special-liquidation close of `position_ids`
    /// on the given engine, one aggregated order per account and instrument.
    pub async fn liquidate_positions_using_special_workflow(
        &self,
        matching_engine: Arc<dyn MatchingEngine>,
        position_ids: &[PositionId],
        correlation_id: &str,
        additional_info: &str,
        originator: OriginatorType,
        modality: OrderModality,
    ) -> Result<Vec<Order>, EngineError> {
        let now = self.clock.now();
        let failed = || EngineError::SpecialLiquidationFailed {
            correlation_id: correlation_id.to_string(),
            position_ids: position_ids.to_vec(),
        };

        let mut groups: Vec<((AccountId, AssetPairId, PositionDirection), Vec<Position>)> = Vec::new();
        for position_id in position_ids {
            let position = self
                .cache
                .positions()
                .update(position_id, |p| {
                    if p.status == PositionStatus::Active {
                        p.start_closing(now, PositionCloseReason::StopOut, originator, additional_info)?;
                    }
                    Ok::<_, EngineError>(p.clone())
                })
                .ok_or_else(|| EngineError::PositionNotFound(position_id.clone()))??;

            let key = (position.account_id.clone(), position.asset_pair_id.clone(), position.direction());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(position),
                None => groups.push((key, vec![position])),
            }
        }

        let mut orders = Vec::new();
        for ((account_id, asset_pair_id, _), group) in groups {
            let account = self.accounts.get(&account_id)?;
            let data = PositionsCloseData {
                open_matching_engine_id: matching_engine.id().to_string(),
                external_provider_id: group.first().and_then(|p| p.external_provider_id.clone()),
                positions: group,
                account_id,
                asset_pair_id,
                legal_entity: account.legal_entity.clone(),
                originator,
                modality,
                additional_info: additional_info.to_string(),
                correlation_id: correlation_id.to_string(),
                comment: Some("Special liquidation".to_string()),
            };
            match self.close_positions(data, Arc::clone(&matching_engine), false).await {
                Ok((order, _)) => orders.push(order),
                Err(e) => {
                    warn!(correlation_id, error = %e, "special liquidation close failed");
                    return Err(failed());
                }
            }
        }
        info!(correlation_id, orders = orders.len(), "special liquidation executed");
        Ok(orders)
    }
}
