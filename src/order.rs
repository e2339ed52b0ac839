// 3.0: orders. status state machine, fills, rejection and cancellation reasons.
// 3.1 MatchedOrderCollection, 3.2 the Order struct, 3.3 transitions, 3.4 pending triggers.

use crate::fpl::{FplData, Priced};
use crate::types::{
    is_zero_volume, round_volume, AccountId, AssetId, AssetPairId, OrderDirection, OrderFillType,
    OrderId, OrderModality, OrderType, OriginatorType, PositionId, Timestamp, TradingConditionId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Placed,
    Inactive,
    Active,
    ExecutionStarted,
    PartiallyFilled,
    Executed,
    Rejected,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Executed | OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Placed => matches!(to, Inactive | Active | ExecutionStarted | Rejected | Cancelled | Expired),
            Inactive => matches!(to, Active | Cancelled | Expired | Rejected),
            Active => matches!(to, ExecutionStarted | Cancelled | Expired | Rejected),
            // back to Active is the NoLiquidity requeue of a pending order
            ExecutionStarted => matches!(to, Executed | PartiallyFilled | Rejected | Active),
            PartiallyFilled => matches!(to, ExecutionStarted | Cancelled | Expired | Rejected),
            Executed | Rejected | Cancelled | Expired => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderStateError {
    #[error("Order {order_id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Order {order_id}: matched volume {matched} exceeds order volume {volume}")]
    Overfill {
        order_id: OrderId,
        matched: Decimal,
        volume: Decimal,
    },

    #[error("Order {0}: parent position and parent order are mutually exclusive")]
    AmbiguousParent(OrderId),

    #[error("Order {0}: pending orders need an expected open price")]
    MissingPrice(OrderId),

    #[error("Order {0}: volume must be non-zero")]
    ZeroVolume(OrderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRejectReason {
    NoLiquidity,
    NotEnoughBalance,
    LeadToStopOut,
    AccountDisabled,
    InvalidExpectedOpenPrice,
    InvalidVolume,
    InvalidInstrument,
    InvalidAccount,
    InvalidParent,
    InvalidValidity,
    TradingConditionError,
    TechnicalError,
    ParentPositionDoesNotExist,
    ParentPositionIsNotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCancellationReason {
    UserRequest,
    Expired,
    BaseOrderCancelled,
    ParentPositionClosed,
    ParentOrderVanished,
    AccountInactivated,
}

// 3.1: a single fill from the matching engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedOrder {
    pub counterparty_id: String,
    pub price: Decimal,
    /// Always positive.
    pub volume: Decimal,
    pub matched_at: Timestamp,
    pub is_external: bool,
}

impl MatchedOrder {
    pub fn new(counterparty_id: impl Into<String>, price: Decimal, volume: Decimal, matched_at: Timestamp) -> Self {
        Self {
            counterparty_id: counterparty_id.into(),
            price,
            volume: volume.abs(),
            matched_at,
            is_external: false,
        }
    }
}

/// Fills kept best-price-first with a running summary volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchedOrderCollection {
    items: Vec<MatchedOrder>,
    summary_volume: Decimal,
}

impl MatchedOrderCollection {
    pub fn new(items: Vec<MatchedOrder>) -> Self {
        let summary_volume = items.iter().map(|m| m.volume).sum();
        Self { items, summary_volume }
    }

    pub fn push(&mut self, matched: MatchedOrder) {
        self.summary_volume += matched.volume;
        self.items.push(matched);
    }

    pub fn extend(&mut self, other: MatchedOrderCollection) {
        for matched in other.items {
            self.push(matched);
        }
    }

    pub fn items(&self) -> &[MatchedOrder] {
        &self.items
    }

    pub fn summary_volume(&self) -> Decimal {
        self.summary_volume
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn weighted_average_price(&self) -> Option<Decimal> {
        if self.summary_volume.is_zero() {
            return None;
        }
        let notional: Decimal = self.items.iter().map(|m| m.price * m.volume).sum();
        Some(notional / self.summary_volume)
    }

    /// Splits off up to `volume` from the front, cutting the last fill if needed.
    pub fn take_volume(&mut self, volume: Decimal) -> MatchedOrderCollection {
        let mut wanted = volume.abs();
        let mut taken = MatchedOrderCollection::default();
        let mut rest = Vec::new();

        for mut matched in self.items.drain(..) {
            if is_zero_volume(wanted) {
                rest.push(matched);
                continue;
            }
            if matched.volume <= wanted {
                wanted -= matched.volume;
                taken.push(matched);
            } else {
                let mut part = matched.clone();
                part.volume = wanted;
                matched.volume -= wanted;
                wanted = Decimal::ZERO;
                taken.push(part);
                rest.push(matched);
            }
        }

        *self = MatchedOrderCollection::new(rest);
        taken
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedOrderInfo {
    pub order_id: OrderId,
    pub order_type: OrderType,
}

// 3.2: the order. exactly one of {no parent, parent_position_id, parent_order_id}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub asset_pair_id: AssetPairId,
    pub volume: Decimal,
    pub order_type: OrderType,
    pub fill_type: OrderFillType,
    pub status: OrderStatus,
    pub originator: OriginatorType,
    pub modality: OrderModality,
    pub parent_position_id: Option<PositionId>,
    pub parent_order_id: Option<OrderId>,
    pub expected_open_price: Option<Decimal>,
    pub execution_price: Option<Decimal>,
    pub close_price: Option<Decimal>,
    pub trailing_distance: Option<Decimal>,
    pub validity: Option<Timestamp>,
    pub force_open: bool,
    pub matched_orders: MatchedOrderCollection,
    pub reject_reason: Option<OrderRejectReason>,
    pub reject_reason_text: Option<String>,
    pub cancellation_reason: Option<OrderCancellationReason>,
    pub comment: Option<String>,
    pub fx_rate: Decimal,
    pub legal_entity: String,
    pub trading_condition_id: TradingConditionId,
    pub account_asset_id: AssetId,
    pub related_orders: Vec<RelatedOrderInfo>,
    pub positions_to_be_closed: Vec<PositionId>,
    pub pending_order_retries_count: u32,
    pub matching_engine_id: Option<String>,
    pub external_provider_id: Option<String>,
    pub additional_info: String,
    pub correlation_id: String,
    pub created: Timestamp,
    pub last_modified: Timestamp,
    pub executed: Option<Timestamp>,
    pub fpl: FplData,
}

impl Order {
    pub fn new(
        id: OrderId,
        account_id: AccountId,
        asset_pair_id: AssetPairId,
        volume: Decimal,
        order_type: OrderType,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            account_id,
            asset_pair_id,
            volume,
            order_type,
            fill_type: OrderFillType::FillOrKill,
            status: OrderStatus::Placed,
            originator: OriginatorType::Investor,
            modality: OrderModality::Regular,
            parent_position_id: None,
            parent_order_id: None,
            expected_open_price: None,
            execution_price: None,
            close_price: None,
            trailing_distance: None,
            validity: None,
            force_open: false,
            matched_orders: MatchedOrderCollection::default(),
            reject_reason: None,
            reject_reason_text: None,
            cancellation_reason: None,
            comment: None,
            fx_rate: Decimal::ONE,
            legal_entity: String::new(),
            trading_condition_id: TradingConditionId::from(""),
            account_asset_id: AssetId::from(""),
            related_orders: Vec::new(),
            positions_to_be_closed: Vec::new(),
            pending_order_retries_count: 0,
            matching_engine_id: None,
            external_provider_id: None,
            additional_info: String::new(),
            correlation_id: String::new(),
            created: now,
            last_modified: now,
            executed: None,
            fpl: FplData::default(),
        }
    }

    pub fn market(id: &str, account_id: &str, asset_pair_id: &str, volume: Decimal, now: Timestamp) -> Self {
        Self::new(
            OrderId::from(id),
            AccountId::from(account_id),
            AssetPairId::from(asset_pair_id),
            volume,
            OrderType::Market,
            now,
        )
    }

    pub fn pending(
        id: &str,
        account_id: &str,
        asset_pair_id: &str,
        volume: Decimal,
        order_type: OrderType,
        price: Decimal,
        now: Timestamp,
    ) -> Self {
        let mut order = Self::new(
            OrderId::from(id),
            AccountId::from(account_id),
            AssetPairId::from(asset_pair_id),
            volume,
            order_type,
            now,
        );
        order.expected_open_price = Some(price);
        order
    }

    pub fn with_fill_type(mut self, fill_type: OrderFillType) -> Self {
        self.fill_type = fill_type;
        self
    }

    pub fn with_originator(mut self, originator: OriginatorType) -> Self {
        self.originator = originator;
        self
    }

    pub fn with_modality(mut self, modality: OrderModality) -> Self {
        self.modality = modality;
        self
    }

    pub fn with_parent_position(mut self, position_id: PositionId) -> Self {
        self.positions_to_be_closed = vec![position_id.clone()];
        self.parent_position_id = Some(position_id);
        self
    }

    pub fn with_parent_order(mut self, order_id: OrderId) -> Self {
        self.parent_order_id = Some(order_id);
        self
    }

    pub fn with_validity(mut self, validity: Timestamp) -> Self {
        self.validity = Some(validity);
        self
    }

    pub fn with_force_open(mut self, force_open: bool) -> Self {
        self.force_open = force_open;
        self
    }

    pub fn direction(&self) -> OrderDirection {
        OrderDirection::from_volume(self.volume)
    }

    pub fn is_basic(&self) -> bool {
        self.parent_position_id.is_none() && self.parent_order_id.is_none()
    }

    pub fn is_contingent(&self) -> bool {
        self.parent_order_id.is_some()
    }

    /// Good till the end of the validity day.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.validity.map_or(false, |v| now.day_index() > v.day_index())
    }

    pub fn is_execution_not_started(&self) -> bool {
        !matches!(
            self.status,
            OrderStatus::ExecutionStarted | OrderStatus::PartiallyFilled | OrderStatus::Executed
        )
    }

    pub fn remaining_volume(&self) -> Decimal {
        round_volume(self.volume.abs() - self.matched_orders.summary_volume())
    }

    pub fn validate(&self) -> Result<(), OrderStateError> {
        if self.parent_position_id.is_some() && self.parent_order_id.is_some() {
            return Err(OrderStateError::AmbiguousParent(self.id.clone()));
        }
        if is_zero_volume(self.volume) && self.positions_to_be_closed.is_empty() {
            return Err(OrderStateError::ZeroVolume(self.id.clone()));
        }
        if self.order_type.is_pending() && self.expected_open_price.is_none() {
            return Err(OrderStateError::MissingPrice(self.id.clone()));
        }
        Ok(())
    }

    // 3.3: transitions
    fn transition(&mut self, to: OrderStatus, now: Timestamp) -> Result<(), OrderStateError> {
        if !self.status.can_transition_to(to) {
            return Err(OrderStateError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.last_modified = now;
        Ok(())
    }

    pub fn activate(&mut self, now: Timestamp) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::Active, now)
    }

    pub fn make_inactive(&mut self, now: Timestamp) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::Inactive, now)
    }

    pub fn start_execution(&mut self, now: Timestamp, matching_engine_id: &str) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::ExecutionStarted, now)?;
        self.matching_engine_id = Some(matching_engine_id.to_string());
        Ok(())
    }

    /// Puts a pending order back to Active after a failed match.
    pub fn cancel_execution(&mut self, now: Timestamp) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::Active, now)?;
        self.matching_engine_id = None;
        Ok(())
    }

    pub fn partially_execute(&mut self, now: Timestamp, fills: MatchedOrderCollection) -> Result<(), OrderStateError> {
        self.add_fills(fills)?;
        self.transition(OrderStatus::PartiallyFilled, now)
    }

    pub fn execute(&mut self, now: Timestamp, fills: MatchedOrderCollection) -> Result<(), OrderStateError> {
        self.add_fills(fills)?;
        self.transition(OrderStatus::Executed, now)?;
        self.execution_price = self.matched_orders.weighted_average_price();
        self.executed = Some(now);
        self.fpl.invalidate();
        Ok(())
    }

    fn add_fills(&mut self, fills: MatchedOrderCollection) -> Result<(), OrderStateError> {
        let matched = self.matched_orders.summary_volume() + fills.summary_volume();
        if round_volume(matched) > round_volume(self.volume.abs()) {
            return Err(OrderStateError::Overfill {
                order_id: self.id.clone(),
                matched,
                volume: self.volume.abs(),
            });
        }
        self.matched_orders.extend(fills);
        Ok(())
    }

    pub fn reject(
        &mut self,
        reason: OrderRejectReason,
        text: &str,
        comment: Option<String>,
        now: Timestamp,
    ) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::Rejected, now)?;
        self.reject_reason = Some(reason);
        self.reject_reason_text = Some(text.to_string());
        if comment.is_some() {
            self.comment = comment;
        }
        Ok(())
    }

    pub fn cancel(
        &mut self,
        now: Timestamp,
        reason: OrderCancellationReason,
        comment: Option<String>,
    ) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::Cancelled, now)?;
        self.cancellation_reason = Some(reason);
        if comment.is_some() {
            self.comment = comment;
        }
        Ok(())
    }

    pub fn expire(&mut self, now: Timestamp) -> Result<(), OrderStateError> {
        self.transition(OrderStatus::Expired, now)?;
        self.cancellation_reason = Some(OrderCancellationReason::Expired);
        Ok(())
    }

    // field changes return the previous value for the OrderChanged event
    pub fn change_price(&mut self, price: Decimal, now: Timestamp) -> Option<Decimal> {
        let old = self.expected_open_price.replace(price);
        self.last_modified = now;
        self.fpl.invalidate();
        old
    }

    pub fn change_validity(&mut self, validity: Option<Timestamp>, now: Timestamp) -> Option<Timestamp> {
        let old = std::mem::replace(&mut self.validity, validity);
        self.last_modified = now;
        old
    }

    pub fn change_force_open(&mut self, force_open: bool, now: Timestamp) -> bool {
        let old = std::mem::replace(&mut self.force_open, force_open);
        self.last_modified = now;
        old
    }

    pub fn change_volume(&mut self, volume: Decimal, now: Timestamp) {
        if self.volume != volume {
            self.volume = volume;
            self.last_modified = now;
            self.fpl.invalidate();
        }
    }

    pub fn set_fx_rate(&mut self, fx_rate: Decimal) {
        if self.fx_rate != fx_rate {
            self.fx_rate = fx_rate;
            self.fpl.invalidate();
        }
    }

    pub fn update_close_price(&mut self, price: Decimal) {
        if self.close_price != Some(price) {
            self.close_price = Some(price);
            self.fpl.invalidate();
        }
    }

    /// A contingent order whose parent order became a position now closes that position.
    pub fn relink_to_position(&mut self, position_id: PositionId, now: Timestamp) {
        self.parent_order_id = None;
        self.positions_to_be_closed = vec![position_id.clone()];
        self.parent_position_id = Some(position_id);
        self.last_modified = now;
    }

    pub fn add_related_order(&mut self, related: &Order) {
        if !self.related_orders.iter().any(|r| r.order_id == related.id) {
            self.related_orders.push(RelatedOrderInfo {
                order_id: related.id.clone(),
                order_type: related.order_type,
            });
        }
    }

    pub fn remove_related_order(&mut self, order_id: &OrderId) {
        self.related_orders.retain(|r| &r.order_id != order_id);
    }

    // 3.4: pending trigger. limits fill at or better, stops once the market crosses
    pub fn is_suitable_price(&self, price: Decimal) -> bool {
        let Some(expected) = self.expected_open_price else {
            return self.order_type == OrderType::Market;
        };
        match (self.order_type, self.direction()) {
            (OrderType::Market, _) => true,
            (OrderType::Limit, OrderDirection::Buy) => price <= expected,
            (OrderType::Limit, OrderDirection::Sell) => price >= expected,
            (OrderType::Stop | OrderType::TrailingStop, OrderDirection::Buy) => price >= expected,
            (OrderType::Stop | OrderType::TrailingStop, OrderDirection::Sell) => price <= expected,
        }
    }
}

impl Priced for Order {
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
        &self.legal_entity
    }

    fn volume(&self) -> Decimal {
        self.volume
    }

    fn open_price(&self) -> Decimal {
        self.execution_price
            .or(self.expected_open_price)
            .unwrap_or(Decimal::ZERO)
    }

    fn close_price(&self) -> Decimal {
        self.close_price.unwrap_or_else(|| self.open_price())
    }
}
