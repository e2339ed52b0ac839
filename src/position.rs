// 4.0: open position tracking. created by the first execution of an opening order,
// revalued on every tick, reduced by close fills, removed once fully closed.
// 4.1 has the closing transitions at the bottom.

use crate::fpl::{FplData, Priced};
use crate::order::{MatchedOrderCollection, Order, RelatedOrderInfo};
use crate::types::{
    is_zero_volume, round_volume, AccountId, AssetId, AssetPairId, OrderId, OrderModality, OrderType,
    OriginatorType, PositionDirection, PositionId, Timestamp, TradingConditionId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionCloseReason {
    Close,
    StopLoss,
    TakeProfit,
    StopOut,
}

impl PositionCloseReason {
    pub fn for_order(order: &Order) -> Self {
        match order.order_type {
            OrderType::Limit => PositionCloseReason::TakeProfit,
            OrderType::Stop | OrderType::TrailingStop => PositionCloseReason::StopLoss,
            OrderType::Market if order.modality == OrderModality::LiquidationMarginCall => {
                PositionCloseReason::StopOut
            }
            OrderType::Market => PositionCloseReason::Close,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("Position {position_id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        position_id: PositionId,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("Position {position_id}: close volume {closing} exceeds remaining {remaining}")]
    Overclose {
        position_id: PositionId,
        closing: Decimal,
        remaining: Decimal,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub asset_pair_id: AssetPairId,
    pub volume: Decimal,
    pub status: PositionStatus,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub open_matching_engine_id: String,
    pub external_provider_id: Option<String>,
    pub open_matched_orders: MatchedOrderCollection,
    pub close_matched_orders: MatchedOrderCollection,
    pub related_orders: Vec<RelatedOrderInfo>,
    pub trading_condition_id: TradingConditionId,
    pub account_asset_id: AssetId,
    /// Older snapshots may lack it; restore fills it from the account.
    pub legal_entity: Option<String>,
    pub open_fx_price: Decimal,
    pub open_commission_rate: Decimal,
    pub close_commission_rate: Decimal,
    pub open_originator: OriginatorType,
    pub close_originator: Option<OriginatorType>,
    pub close_reason: Option<PositionCloseReason>,
    pub close_comment: Option<String>,
    pub opened_by_order: OrderId,
    pub open_date: Timestamp,
    pub close_date: Option<Timestamp>,
    pub last_modified: Timestamp,
    pub fpl: FplData,
}

impl Position {
    /// Opens a position from (part of) an executed order. Position id = order id.
    pub fn open(order: &Order, fills: MatchedOrderCollection, now: Timestamp) -> Self {
        let direction = order.direction().sign();
        let volume = round_volume(direction * fills.summary_volume());
        let open_price = fills
            .weighted_average_price()
            .or(order.execution_price)
            .unwrap_or(Decimal::ZERO);

        Self {
            id: PositionId::from(order.id.clone()),
            account_id: order.account_id.clone(),
            asset_pair_id: order.asset_pair_id.clone(),
            volume,
            status: PositionStatus::Active,
            open_price,
            close_price: open_price,
            open_matching_engine_id: order.matching_engine_id.clone().unwrap_or_default(),
            external_provider_id: order.external_provider_id.clone(),
            open_matched_orders: fills,
            close_matched_orders: MatchedOrderCollection::default(),
            related_orders: Vec::new(),
            trading_condition_id: order.trading_condition_id.clone(),
            account_asset_id: order.account_asset_id.clone(),
            legal_entity: Some(order.legal_entity.clone()),
            open_fx_price: order.fx_rate,
            open_commission_rate: Decimal::ZERO,
            close_commission_rate: Decimal::ZERO,
            open_originator: order.originator,
            close_originator: None,
            close_reason: None,
            close_comment: None,
            opened_by_order: order.id.clone(),
            open_date: now,
            close_date: None,
            last_modified: now,
            fpl: FplData::default(),
        }
    }

    pub fn with_commissions(mut self, open_rate: Decimal, close_rate: Decimal) -> Self {
        self.open_commission_rate = open_rate;
        self.close_commission_rate = close_rate;
        self.fpl.invalidate();
        self
    }

    pub fn direction(&self) -> PositionDirection {
        PositionDirection::from_volume(self.volume)
    }

    pub fn matched_volume(&self) -> Decimal {
        self.open_matched_orders.summary_volume()
    }

    pub fn matched_close_volume(&self) -> Decimal {
        self.close_matched_orders.summary_volume()
    }

    pub fn is_close_fulfilled(&self) -> bool {
        is_zero_volume(self.matched_volume() - self.matched_close_volume())
    }

    pub fn update_close_price(&mut self, price: Decimal) {
        if self.close_price != price {
            self.close_price = price;
            self.fpl.invalidate();
        }
    }

    pub fn add_related_order(&mut self, order: &Order) {
        if !self.related_orders.iter().any(|r| r.order_id == order.id) {
            self.related_orders.push(RelatedOrderInfo {
                order_id: order.id.clone(),
                order_type: order.order_type,
            });
        }
    }

    pub fn remove_related_order(&mut self, order_id: &OrderId) {
        self.related_orders.retain(|r| &r.order_id != order_id);
    }

    // 4.1: closing
    pub fn start_closing(
        &mut self,
        now: Timestamp,
        reason: PositionCloseReason,
        originator: OriginatorType,
        comment: &str,
    ) -> Result<(), PositionError> {
        if self.status != PositionStatus::Active {
            return Err(self.invalid(PositionStatus::Closing));
        }
        self.status = PositionStatus::Closing;
        self.close_reason = Some(reason);
        self.close_originator = Some(originator);
        self.close_comment = Some(comment.to_string());
        self.last_modified = now;
        Ok(())
    }

    pub fn cancel_closing(&mut self, now: Timestamp) -> Result<(), PositionError> {
        if self.status != PositionStatus::Closing {
            return Err(self.invalid(PositionStatus::Active));
        }
        self.status = PositionStatus::Active;
        self.close_reason = None;
        self.close_originator = None;
        self.close_comment = None;
        self.last_modified = now;
        Ok(())
    }

    /// Applies close fills. Returns true once the position is fully closed.
    pub fn partially_close(
        &mut self,
        now: Timestamp,
        fills: MatchedOrderCollection,
        reason: PositionCloseReason,
        originator: OriginatorType,
    ) -> Result<bool, PositionError> {
        if self.status == PositionStatus::Closed {
            return Err(self.invalid(PositionStatus::Closed));
        }
        let remaining = round_volume(self.matched_volume() - self.matched_close_volume());
        if round_volume(fills.summary_volume()) > remaining {
            return Err(PositionError::Overclose {
                position_id: self.id.clone(),
                closing: fills.summary_volume(),
                remaining,
            });
        }

        if let Some(price) = fills.weighted_average_price() {
            self.close_price = price;
        }
        self.close_matched_orders.extend(fills);
        self.volume = round_volume(
            self.direction().sign() * (self.matched_volume() - self.matched_close_volume()),
        );
        self.last_modified = now;
        self.fpl.invalidate();

        if self.is_close_fulfilled() {
            self.status = PositionStatus::Closed;
            self.close_date = Some(now);
            self.close_reason.get_or_insert(reason);
            self.close_originator.get_or_insert(originator);
            return Ok(true);
        }
        Ok(false)
    }

    fn invalid(&self, to: PositionStatus) -> PositionError {
        PositionError::InvalidTransition {
            position_id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

impl Priced for Position {
    fn fpl_data(&self) -> &FplData {
        &self.fpl
    }

    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn asset_pair_id(&self) -> &AssetPairId {
        &self.asset_pair_id
    }

    fn trading_condition_id(&self) -> &TradingConditionId {
        &self.trading_condition_id
    }

    fn account_asset_id(&self) -> &AssetId {
        &self.account_asset_id
    }

    fn legal_entity(&self) -> &str {
        self.legal_entity.as_deref().unwrap_or_default()
    }

    fn volume(&self) -> Decimal {
        self.volume
    }

    fn open_price(&self) -> Decimal {
        self.open_price
    }

    fn close_price(&self) -> Decimal {
        self.close_price
    }

    fn commission(&self) -> Decimal {
        self.matched_volume() * self.open_commission_rate
            + self.matched_close_volume() * self.close_commission_rate
    }
}
