//! Liquidation saga contract.
//!
//! The engine decides *when* an account or a position group must be
//! liquidated and sends a command; the saga orchestrator that actually walks
//! the steps lives outside this crate. What is modelled here is the command
//! shapes, the state machines both sides agree on, and the operation state
//! repository with optimistic concurrency the orchestrator persists through.

use crate::services::Clock;
use crate::types::{AccountId, AssetPairId, OriginatorType, PositionDirection, PositionId, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// `Normal` when used margin is fully explained by open positions,
/// `Mco` when frozen or unconfirmed margin is part of it, `Forced` for
/// account-wide closes requested by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationType {
    Normal,
    Mco,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartLiquidationCommand {
    pub operation_id: String,
    pub account_id: AccountId,
    pub liquidation_type: LiquidationType,
    /// Only positions in this direction, all when absent.
    pub direction: Option<PositionDirection>,
    pub asset_pair_id: Option<AssetPairId>,
    /// JSON snapshot of the quote that triggered the liquidation.
    pub quote_info: Option<String>,
    pub originator: OriginatorType,
    pub creation_time: Timestamp,
    pub additional_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSpecialLiquidationCommand {
    pub operation_id: String,
    pub account_id: AccountId,
    pub position_ids: Vec<PositionId>,
    pub additional_info: String,
    pub originator: OriginatorType,
    pub correlation_id: String,
    pub creation_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiquidationCommand {
    StartLiquidation(StartLiquidationCommand),
    StartSpecialLiquidation(StartSpecialLiquidationCommand),
}

impl LiquidationCommand {
    pub fn operation_id(&self) -> &str {
        match self {
            LiquidationCommand::StartLiquidation(c) => &c.operation_id,
            LiquidationCommand::StartSpecialLiquidation(c) => &c.operation_id,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        match self {
            LiquidationCommand::StartLiquidation(c) => &c.account_id,
            LiquidationCommand::StartSpecialLiquidation(c) => &c.account_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Command channel closed")]
    ChannelClosed,
}

pub trait CommandSender: Send + Sync {
    fn send(&self, command: LiquidationCommand) -> Result<(), CommandError>;
}

/// Hands commands to whoever drains the receiving half.
#[derive(Debug, Clone)]
pub struct ChannelCommandSender {
    tx: mpsc::UnboundedSender<LiquidationCommand>,
}

impl ChannelCommandSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LiquidationCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CommandSender for ChannelCommandSender {
    fn send(&self, command: LiquidationCommand) -> Result<(), CommandError> {
        self.tx.send(command).map_err(|_| CommandError::ChannelClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationOperationState {
    Initiated,
    Started,
    SpecialLiquidationStarted,
    Finished,
    Failed,
}

impl LiquidationOperationState {
    pub fn can_transition_to(&self, to: LiquidationOperationState) -> bool {
        use LiquidationOperationState::*;
        match self {
            Initiated => matches!(to, Started | Failed),
            Started => matches!(to, SpecialLiquidationStarted | Finished | Failed),
            SpecialLiquidationStarted => matches!(to, Started | Finished | Failed),
            Finished | Failed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialLiquidationOperationState {
    Initiated,
    PriceRequested,
    PriceReceived,
    InternalOrderExecutionStarted,
    Finished,
    OnTheWayToFail,
    Failed,
}

impl SpecialLiquidationOperationState {
    pub fn can_transition_to(&self, to: SpecialLiquidationOperationState) -> bool {
        use SpecialLiquidationOperationState::*;
        match self {
            Initiated => matches!(to, PriceRequested | OnTheWayToFail),
            // a timed out request may be retried from the price request step
            PriceRequested => matches!(to, PriceReceived | PriceRequested | OnTheWayToFail),
            PriceReceived => matches!(to, InternalOrderExecutionStarted | OnTheWayToFail),
            InternalOrderExecutionStarted => matches!(to, Finished | OnTheWayToFail),
            OnTheWayToFail => matches!(to, Failed | PriceRequested),
            Finished | Failed => false,
        }
    }
}

/// Saga-side state of one special liquidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialLiquidationOperationData {
    pub state: SpecialLiquidationOperationState,
    pub asset_pair_id: AssetPairId,
    pub position_ids: Vec<PositionId>,
    pub volume: Decimal,
    pub price: Option<Decimal>,
    pub external_provider_id: Option<String>,
    pub account_id: Option<AccountId>,
    pub causation_operation_id: Option<String>,
    pub additional_info: String,
    pub originator: OriginatorType,
    pub request_number: u32,
    pub price_request_deadline: Option<Timestamp>,
    pub retry_from_price_request: bool,
}

impl SpecialLiquidationOperationData {
    pub fn new(asset_pair_id: AssetPairId, position_ids: Vec<PositionId>, volume: Decimal, originator: OriginatorType) -> Self {
        Self {
            state: SpecialLiquidationOperationState::Initiated,
            asset_pair_id,
            position_ids,
            volume,
            price: None,
            external_provider_id: None,
            account_id: None,
            causation_operation_id: None,
            additional_info: String::new(),
            originator,
            request_number: 0,
            price_request_deadline: None,
            retry_from_price_request: false,
        }
    }

    pub fn switch_state(&mut self, to: SpecialLiquidationOperationState) -> Result<(), OperationError> {
        if !self.state.can_transition_to(to) {
            return Err(OperationError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn request_price(&mut self, now: Timestamp, timeout_millis: i64) -> Result<(), OperationError> {
        self.switch_state(SpecialLiquidationOperationState::PriceRequested)?;
        self.request_number += 1;
        self.price_request_deadline = Some(now.plus_millis(timeout_millis));
        Ok(())
    }

    pub fn receive_price(&mut self, price: Decimal, provider_id: &str) -> Result<(), OperationError> {
        self.switch_state(SpecialLiquidationOperationState::PriceReceived)?;
        self.price = Some(price);
        self.external_provider_id = Some(provider_id.to_string());
        self.price_request_deadline = None;
        Ok(())
    }

    /// Marks the saga as failing once the price deadline has passed. Returns
    /// true when the timeout fired.
    pub fn check_price_timeout(&mut self, now: Timestamp) -> Result<bool, OperationError> {
        let timed_out = self.state == SpecialLiquidationOperationState::PriceRequested
            && self.price_request_deadline.map_or(false, |deadline| deadline <= now);
        if timed_out {
            self.switch_state(SpecialLiquidationOperationState::OnTheWayToFail)?;
            self.retry_from_price_request = true;
        }
        Ok(timed_out)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationError {
    #[error("Optimistic concurrency violation on {operation_name}/{id}")]
    ConcurrencyViolation { operation_name: String, id: String },

    #[error("Operation {operation_name}/{id} not found")]
    NotFound { operation_name: String, id: String },

    #[error("Invalid operation state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationExecutionInfo<T> {
    pub operation_name: String,
    pub id: String,
    pub last_modified: Timestamp,
    pub data: T,
}

/// Persisted operation state. `save` only succeeds when the caller read the
/// latest stored version.
#[async_trait]
pub trait OperationExecutionInfoRepository<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    async fn get_or_add(
        &self,
        operation_name: &str,
        id: &str,
        factory: Box<dyn FnOnce() -> T + Send>,
    ) -> (OperationExecutionInfo<T>, bool);

    async fn get(&self, operation_name: &str, id: &str) -> Option<OperationExecutionInfo<T>>;

    async fn save(&self, info: OperationExecutionInfo<T>) -> Result<OperationExecutionInfo<T>, OperationError>;
}

pub struct InMemoryOperationRepository<T> {
    items: Mutex<HashMap<(String, String), OperationExecutionInfo<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T> InMemoryOperationRepository<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl<T> OperationExecutionInfoRepository<T> for InMemoryOperationRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get_or_add(
        &self,
        operation_name: &str,
        id: &str,
        factory: Box<dyn FnOnce() -> T + Send>,
    ) -> (OperationExecutionInfo<T>, bool) {
        let key = (operation_name.to_string(), id.to_string());
        let mut items = self.items.lock();
        if let Some(existing) = items.get(&key) {
            return (existing.clone(), false);
        }
        let info = OperationExecutionInfo {
            operation_name: operation_name.to_string(),
            id: id.to_string(),
            last_modified: self.clock.now(),
            data: factory(),
        };
        items.insert(key, info.clone());
        (info, true)
    }

    async fn get(&self, operation_name: &str, id: &str) -> Option<OperationExecutionInfo<T>> {
        self.items
            .lock()
            .get(&(operation_name.to_string(), id.to_string()))
            .cloned()
    }

    async fn save(&self, mut info: OperationExecutionInfo<T>) -> Result<OperationExecutionInfo<T>, OperationError> {
        let key = (info.operation_name.clone(), info.id.clone());
        let mut items = self.items.lock();
        let stored = items.get(&key).ok_or_else(|| OperationError::NotFound {
            operation_name: info.operation_name.clone(),
            id: info.id.clone(),
        })?;
        if stored.last_modified != info.last_modified {
            return Err(OperationError::ConcurrencyViolation {
                operation_name: info.operation_name,
                id: info.id,
            });
        }
        // strictly increasing so a stale copy can never match again
        let now = self.clock.now();
        info.last_modified = if now > stored.last_modified {
            now
        } else {
            stored.last_modified.plus_millis(1)
        };
        items.insert(key, info.clone());
        Ok(info)
    }
}
