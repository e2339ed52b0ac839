//! Margin and PnL calculation.
//!
//! `fpl = (close - open) * quote_rate * |volume| * direction`, margins are
//! `|volume| * margin_rate / leverage`, everything rounded to the accuracy of
//! the account asset. Callers go through [`MarginCalculator::fpl`], which only
//! recomputes when the item's version stamp moved since the cached snapshot.

use crate::account::{AccountError, AccountFpl, MarginTradingAccount};
use crate::account_store::AccountStore;
use crate::assets::{AssetError, AssetsCache};
use crate::cache::OrderCache;
use crate::fpl::{FplSnapshot, Priced};
use crate::position::Position;
use crate::quotes::{InstrumentBidAskPair, QuoteError, QuoteStore};
use crate::types::{round_to, AccountId, AssetId, AssetPairId};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarginError {
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Quote error: {0}")]
    Quote(#[from] QuoteError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Leverage for {0} must be positive")]
    InvalidLeverage(AssetPairId),
}

#[derive(Debug)]
pub struct MarginCalculator {
    assets: Arc<AssetsCache>,
    quotes: Arc<QuoteStore>,
    fx_quotes: Arc<QuoteStore>,
    accounts: Arc<AccountStore>,
    cache: Arc<OrderCache>,
    recomputes: AtomicU64,
}

impl MarginCalculator {
    pub fn new(
        assets: Arc<AssetsCache>,
        quotes: Arc<QuoteStore>,
        fx_quotes: Arc<QuoteStore>,
        accounts: Arc<AccountStore>,
        cache: Arc<OrderCache>,
    ) -> Self {
        Self {
            assets,
            quotes,
            fx_quotes,
            accounts,
            cache,
            recomputes: AtomicU64::new(0),
        }
    }

    /// Number of item-level recomputes performed so far.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    // fx store first, trading quotes as a fallback for pairs we also trade
    fn cross_quote(&self, asset_pair_id: &AssetPairId) -> Result<InstrumentBidAskPair, QuoteError> {
        match self.fx_quotes.try_get_quote(asset_pair_id) {
            Some(quote) => Ok(quote),
            None => self.quotes.get_quote(asset_pair_id),
        }
    }

    /// Rate converting the instrument's quote asset into the account asset.
    /// `metric_is_positive` picks the side: gains convert at the better rate for the house.
    pub fn quote_rate_for_quote_asset(
        &self,
        account_asset_id: &AssetId,
        asset_pair_id: &AssetPairId,
        legal_entity: &str,
        metric_is_positive: bool,
    ) -> Result<Decimal, MarginError> {
        let pair = self.assets.asset_pair(asset_pair_id)?;
        if &pair.quote_asset_id == account_asset_id {
            return Ok(Decimal::ONE);
        }

        let cross = self
            .assets
            .find_asset_pair(&pair.quote_asset_id, account_asset_id, legal_entity)?;
        let quote = self.cross_quote(&cross.id)?;
        let direct = cross.base_asset_id == pair.quote_asset_id;

        let rate = match (metric_is_positive, direct) {
            (true, true) => quote.ask,
            (true, false) => Decimal::ONE / quote.bid,
            (false, true) => quote.bid,
            (false, false) => Decimal::ONE / quote.ask,
        };
        Ok(rate)
    }

    /// Lazy gate. Returns the cached snapshot when current, otherwise recomputes
    /// and marks the owning account's aggregate dirty.
    pub fn fpl<P: Priced>(&self, item: &P) -> Result<FplSnapshot, MarginError> {
        if let Some(snapshot) = item.fpl_data().fresh() {
            return Ok(snapshot);
        }
        let snapshot = self.recompute(item)?;
        item.fpl_data().store(snapshot.clone());
        self.accounts.mark_dirty(item.account_id());
        Ok(snapshot)
    }

    /// Same as [`fpl`](Self::fpl) but also publishes the snapshot back to the
    /// live cached position when nothing changed it meanwhile.
    pub fn position_fpl(&self, position: &Position) -> Result<FplSnapshot, MarginError> {
        let snapshot = self.fpl(position)?;
        self.sync_back(position, &snapshot);
        Ok(snapshot)
    }

    fn sync_back(&self, position: &Position, snapshot: &FplSnapshot) {
        self.cache
            .positions()
            .update(&position.id, |live| live.fpl.store(snapshot.clone()));
    }

    fn recompute<P: Priced>(&self, item: &P) -> Result<FplSnapshot, MarginError> {
        self.recomputes.fetch_add(1, Ordering::Relaxed);

        let accuracy = self.assets.asset_accuracy(item.account_asset_id());
        let volume = item.volume();
        let open = item.open_price();
        let close = item.close_price();
        let raw_fpl = (close - open) * volume;

        let quote_rate = self.quote_rate_for_quote_asset(
            item.account_asset_id(),
            item.asset_pair_id(),
            item.legal_entity(),
            raw_fpl > Decimal::ZERO,
        )?;
        let margin_quote_rate = if raw_fpl > Decimal::ZERO {
            quote_rate
        } else {
            self.quote_rate_for_quote_asset(item.account_asset_id(), item.asset_pair_id(), item.legal_entity(), true)?
        };

        let instrument = self
            .assets
            .instrument(item.trading_condition_id(), item.asset_pair_id())?;
        if instrument.leverage_init <= Decimal::ZERO || instrument.leverage_maintenance <= Decimal::ZERO {
            return Err(MarginError::InvalidLeverage(item.asset_pair_id().clone()));
        }

        let reference_price = if close.is_zero() { open } else { close };
        let margin_rate = reference_price * margin_quote_rate;
        let matched = volume.abs();
        let fpl = round_to(raw_fpl * quote_rate, accuracy);

        Ok(FplSnapshot {
            quote_rate,
            margin_rate,
            margin_init: round_to(matched * margin_rate / instrument.leverage_init, accuracy),
            margin_maintenance: round_to(matched * margin_rate / instrument.leverage_maintenance, accuracy),
            fpl,
            total_fpl: round_to(fpl - item.commission(), accuracy),
            account_base_asset_accuracy: accuracy,
            calculated_version: item.fpl_data().version(),
        })
    }

    /// Account aggregate, recomputed only when the account's version moved.
    pub fn account_fpl(&self, account: &MarginTradingAccount) -> Result<AccountFpl, MarginError> {
        if let Some(cached) = account.aggregate.fresh() {
            return Ok(cached);
        }
        let version = account.aggregate.actual_version();
        let condition = self.assets.trading_condition(&account.trading_condition_id)?;
        let positions = self.cache.positions().get_by_account(&account.id);

        let mut pnl = Decimal::ZERO;
        let mut currently_used_margin = Decimal::ZERO;
        let mut margin_init = Decimal::ZERO;
        for position in &positions {
            // position-level recomputes here must not dirty the aggregate being built
            let snapshot = match position.fpl.fresh() {
                Some(snapshot) => snapshot,
                None => {
                    let snapshot = self.recompute(position)?;
                    position.fpl.store(snapshot.clone());
                    self.sync_back(position, &snapshot);
                    snapshot
                }
            };
            pnl += snapshot.total_fpl;
            currently_used_margin += snapshot.margin_maintenance;
            margin_init += snapshot.margin_init;
        }

        let figures = AccountFpl {
            balance: account.balance,
            pnl,
            currently_used_margin,
            margin_init,
            withdrawal_frozen_margin: account.aggregate.withdrawal_frozen_margin(),
            unconfirmed_margin: account.aggregate.unconfirmed_margin(),
            open_positions_count: positions.len(),
            active_orders_count: self.cache.active().count_by_account(&account.id),
            margin_call1_level: condition.margin_call1,
            margin_call2_level: condition.margin_call2,
            stop_out_level: condition.stop_out,
            overnight_margin_call_level: condition.overnight_margin_call,
            calculated_version: version,
        };
        account.aggregate.store(figures.clone());
        Ok(figures)
    }

    pub fn account_fpl_by_id(&self, account_id: &AccountId) -> Result<AccountFpl, MarginError> {
        let account = self.accounts.get(account_id)?;
        self.account_fpl(&account)
    }

    /// PnL realized by closing `closed_volume` of `position` at `close_price`,
    /// in the account asset. Uses the direction the position had before the close.
    pub fn realized_pnl(&self, position: &Position, closed_volume: Decimal, close_price: Decimal) -> Result<Decimal, MarginError> {
        let accuracy = self.assets.asset_accuracy(&position.account_asset_id);
        let raw = (close_price - position.open_price) * closed_volume.abs() * position.direction().sign();
        let rate = self.quote_rate_for_quote_asset(
            &position.account_asset_id,
            &position.asset_pair_id,
            position.legal_entity(),
            raw > Decimal::ZERO,
        )?;
        Ok(round_to(raw * rate, accuracy))
    }

    /// Initial margin an order would consume if filled at `price`.
    pub fn initial_margin_for<P: Priced>(&self, item: &P, price: Decimal) -> Result<Decimal, MarginError> {
        let accuracy = self.assets.asset_accuracy(item.account_asset_id());
        let rate = self.quote_rate_for_quote_asset(item.account_asset_id(), item.asset_pair_id(), item.legal_entity(), true)?;
        let instrument = self
            .assets
            .instrument(item.trading_condition_id(), item.asset_pair_id())?;
        if instrument.leverage_init <= Decimal::ZERO {
            return Err(MarginError::InvalidLeverage(item.asset_pair_id().clone()));
        }
        Ok(round_to(item.volume().abs() * price * rate / instrument.leverage_init, accuracy))
    }
}
