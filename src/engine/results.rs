// 8.0.2: result types and errors for engine operations.

use crate::account::AccountError;
use crate::assets::AssetError;
use crate::liquidation::CommandError;
use crate::margin::MarginError;
use crate::matching::MatchingError;
use crate::order::{Order, OrderStateError};
use crate::persistence::PersistenceError;
use crate::position::{Position, PositionError};
use crate::quotes::QuoteError;
use crate::types::{AccountId, AssetPairId, OrderId, OrderModality, OriginatorType, PositionId};
use crate::validation::ValidationRejection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionCloseResult {
    Closed,
    ClosingIsInProgress,
    ClosingStarted,
    FailedToClose,
}

#[derive(Debug, Clone)]
pub struct PositionCloseOutcome {
    pub position_id: PositionId,
    pub result: PositionCloseResult,
    /// The aggregated close order, when one was sent to matching.
    pub order: Option<Order>,
}

impl PositionCloseOutcome {
    pub fn new(position_id: PositionId, result: PositionCloseResult, order: Option<Order>) -> Self {
        Self {
            position_id,
            result,
            order,
        }
    }
}

/// One group of positions closed by a single aggregated order. All of them
/// share account, instrument, direction and the engine that opened them.
#[derive(Debug, Clone)]
pub struct PositionsCloseData {
    pub positions: Vec<Position>,
    pub account_id: AccountId,
    pub asset_pair_id: AssetPairId,
    pub open_matching_engine_id: String,
    pub external_provider_id: Option<String>,
    pub legal_entity: String,
    pub originator: OriginatorType,
    pub modality: OrderModality,
    pub additional_info: String,
    pub correlation_id: String,
    pub comment: Option<String>,
}

impl PositionsCloseData {
    pub fn position_ids(&self) -> Vec<PositionId> {
        self.positions.iter().map(|p| p.id.clone()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Positions were not closed: {0}")]
    PositionsNotClosed(String),

    #[error("Special liquidation {correlation_id} failed for positions {position_ids:?}")]
    SpecialLiquidationFailed {
        correlation_id: String,
        position_ids: Vec<PositionId>,
    },

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Quote error: {0}")]
    Quote(#[from] QuoteError),

    #[error("Margin error: {0}")]
    Margin(#[from] MarginError),

    #[error("Order state error: {0}")]
    OrderState(#[from] OrderStateError),

    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    #[error("Matching error: {0}")]
    Matching(#[from] MatchingError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationRejection),
}
