//! Quote ticks: close prices, trailing stops, margin levels and the
//! pending-order scan.

use super::core::TradingEngine;
use super::results::EngineError;
use crate::account::{AccountFpl, AccountLevel};
use crate::events::{EventPayload, MarginCallEvent, OrderChangedEvent, OrderChangedField};
use crate::position::{Position, PositionStatus};
use crate::quotes::InstrumentBidAskPair;
use crate::types::{AccountId, OrderType};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info};

impl TradingEngine {
    // 8.5: one tick for one instrument. ticks for the same instrument never overlap

    /// Stores the quote, revalues every position on the instrument, checks the
    /// affected accounts for stop out, then triggers pending orders.
    pub async fn on_quote(self: &Arc<Self>, quote: InstrumentBidAskPair) -> Result<(), EngineError> {
        let token = self.instrument_locks.acquire(&quote.instrument).await;
        self.quotes.set_quote(quote.clone())?;

        let accounts = self.process_positions(&quote);
        for account_id in &accounts {
            if let Err(e) = self.check_stop_out(account_id, Some(&quote)) {
                error!(account_id = %account_id, error = %e, "stop out check failed on quote");
            }
        }

        self.process_pending_orders(&quote);
        drop(token);
        Ok(())
    }

    fn process_positions(&self, quote: &InstrumentBidAskPair) -> BTreeSet<AccountId> {
        let mut accounts = BTreeSet::new();
        for position in self.cache.positions().get_by_instrument(&quote.instrument) {
            let close_price = self.close_price_for(&position, quote);
            self.cache
                .positions()
                .update(&position.id, |p| p.update_close_price(close_price));
            if position.status == PositionStatus::Active {
                self.update_trailing_stops(&position, close_price);
            }
            accounts.insert(position.account_id.clone());
        }
        for account_id in &accounts {
            self.accounts.mark_dirty(account_id);
        }
        accounts
    }

    /// Top of book when it covers the volume, otherwise what the engine that
    /// would close the position says.
    fn close_price_for(&self, position: &Position, quote: &InstrumentBidAskPair) -> Decimal {
        let top = quote.close_price_for(position.direction());
        if quote.has_depth_for(position.direction().close_direction(), position.volume.abs()) {
            return top;
        }
        self.router
            .for_close(&position.open_matching_engine_id, &position.asset_pair_id)
            .get_price_for_close(
                &position.asset_pair_id,
                position.volume,
                position.external_provider_id.as_deref(),
            )
            .unwrap_or(top)
    }

    /// Trailing stops follow the close price while it moves in the
    /// position's favour and stay put when it moves against it.
    fn update_trailing_stops(&self, position: &Position, close_price: Decimal) {
        let now = self.clock.now();
        let trailing = position
            .related_orders
            .iter()
            .filter(|r| r.order_type == OrderType::TrailingStop);

        for related in trailing {
            let changed = self.cache.active().update(&related.order_id, |order| {
                let Some(price) = order.expected_open_price else {
                    return None;
                };
                let Some(distance) = order.trailing_distance else {
                    order.trailing_distance = Some(price - close_price);
                    return None;
                };
                let moved = price - close_price;
                if moved.abs() <= distance.abs() || moved.signum() != distance.signum() {
                    return None;
                }
                let previous = order.change_price(close_price + distance, now)?;
                Some((order.clone(), previous))
            });

            if let Some(Some((order, previous))) = changed {
                info!(
                    order_id = %order.id,
                    %previous,
                    price = ?order.expected_open_price,
                    "trailing stop moved"
                );
                self.emit(EventPayload::OrderChanged(OrderChangedEvent {
                    order,
                    field: OrderChangedField::Price,
                    old_value: previous.to_string(),
                }));
            }
        }
    }

    // 8.6: margin levels

    /// Recomputes the account's level and records it. Moving into a margin
    /// call level publishes MarginCall; stop out is left to the caller.
    pub(super) fn check_account_level(&self, account_id: &AccountId) -> Result<(AccountLevel, AccountFpl), EngineError> {
        let account = self.accounts.get(account_id)?;
        let fpl = self.calculator.account_fpl(&account)?;
        let level = fpl.level();
        let previous = self.accounts.swap_level(account_id, level)?;

        if level != previous && level != AccountLevel::StopOut && level != AccountLevel::None {
            info!(
                account_id = %account_id,
                ?level,
                ?previous,
                usage = ?fpl.margin_usage_level(),
                "margin call"
            );
            self.emit(EventPayload::MarginCall(MarginCallEvent {
                account_id: account_id.clone(),
                level,
                previous_level: previous,
                margin_usage_level: fpl.margin_usage_level(),
            }));
        } else if level != previous {
            debug!(account_id = %account_id, ?level, ?previous, "account level changed");
        }
        Ok((level, fpl))
    }

    /// Cross-rate tick. Only revalues positions whose quote asset converts
    /// through this pair; nothing trades on it.
    pub fn on_fx_quote(&self, quote: InstrumentBidAskPair) -> Result<(), EngineError> {
        self.fx_quotes.set_quote(quote.clone())?;

        let mut accounts = BTreeSet::new();
        for position in self.cache.positions().get_all() {
            if !self.converts_through(&position, &quote) {
                continue;
            }
            self.cache.positions().update(&position.id, |p| p.fpl.invalidate());
            accounts.insert(position.account_id.clone());
        }

        for account_id in &accounts {
            self.accounts.mark_dirty(account_id);
            if let Err(e) = self.check_stop_out(account_id, None) {
                error!(account_id = %account_id, error = %e, "stop out check failed on fx quote");
            }
        }
        Ok(())
    }

    fn converts_through(&self, position: &Position, quote: &InstrumentBidAskPair) -> bool {
        let Ok(pair) = self.assets.asset_pair(&position.asset_pair_id) else {
            return false;
        };
        if pair.quote_asset_id == position.account_asset_id {
            return false;
        }
        let legal_entity = position.legal_entity.as_deref().unwrap_or_default();
        self.assets
            .find_asset_pair(&pair.quote_asset_id, &position.account_asset_id, legal_entity)
            .map_or(false, |cross| cross.id == quote.instrument)
    }
}
