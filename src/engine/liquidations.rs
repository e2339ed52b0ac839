//! Stop out detection and hand-off to the liquidation saga.

use super::core::TradingEngine;
use super::results::EngineError;
use crate::account::{AccountFpl, AccountLevel};
use crate::events::{EventPayload, StopOutEvent};
use crate::liquidation::{LiquidationCommand, LiquidationType, StartLiquidationCommand};
use crate::quotes::InstrumentBidAskPair;
use crate::types::{AccountId, OriginatorType};
use tracing::{error, info};

impl TradingEngine {
    /// Re-evaluates the account and starts a liquidation when it sits at stop
    /// out. Returns the operation id when one was started by this call.
    pub fn check_stop_out(
        &self,
        account_id: &AccountId,
        quote: Option<&InstrumentBidAskPair>,
    ) -> Result<Option<String>, EngineError> {
        let (level, fpl) = self.check_account_level(account_id)?;
        if level != AccountLevel::StopOut {
            return Ok(None);
        }
        self.commit_stop_out(account_id, &fpl, quote)
    }

    fn commit_stop_out(
        &self,
        account_id: &AccountId,
        fpl: &AccountFpl,
        quote: Option<&InstrumentBidAskPair>,
    ) -> Result<Option<String>, EngineError> {
        let operation_id = self.ids.generate();
        if !self.accounts.try_start_liquidation(account_id, &operation_id)? {
            // one liquidation per account at a time
            return Ok(None);
        }

        // frozen or unconfirmed margin pushed it over the edge
        let liquidation_type = if fpl.used_margin() == fpl.currently_used_margin {
            LiquidationType::Normal
        } else {
            LiquidationType::Mco
        };

        let command = StartLiquidationCommand {
            operation_id: operation_id.clone(),
            account_id: account_id.clone(),
            liquidation_type,
            direction: None,
            asset_pair_id: None,
            quote_info: quote.and_then(|q| serde_json::to_string(q).ok()),
            originator: OriginatorType::System,
            creation_time: self.clock.now(),
            additional_info: String::new(),
        };

        if let Err(e) = self.commands.send(LiquidationCommand::StartLiquidation(command)) {
            error!(account_id = %account_id, operation_id = %operation_id, error = %e, "cannot send stop out liquidation");
            self.accounts.finish_liquidation(account_id, &operation_id)?;
            return Err(e.into());
        }

        info!(
            account_id = %account_id,
            operation_id = %operation_id,
            ?liquidation_type,
            usage = ?fpl.margin_usage_level(),
            "stop out, liquidation started"
        );
        self.emit(EventPayload::StopOut(StopOutEvent {
            account_id: account_id.clone(),
            operation_id: operation_id.clone(),
            liquidation_type,
        }));
        Ok(Some(operation_id))
    }

    /// Saga callback once a liquidation operation completes or fails.
    /// False when `operation_id` was not the account's running liquidation.
    pub fn finish_liquidation(&self, account_id: &AccountId, operation_id: &str) -> Result<bool, EngineError> {
        let finished = self.accounts.finish_liquidation(account_id, operation_id)?;
        if finished {
            info!(account_id = %account_id, operation_id, "liquidation finished");
        }
        Ok(finished)
    }
}
