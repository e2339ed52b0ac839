// 7.0: pre-trade validation. runs before an order reaches a matching engine,
// skipped for liquidation modalities and system originated orders.

use crate::account_store::AccountStore;
use crate::assets::AssetsCache;
use crate::margin::MarginCalculator;
use crate::order::{Order, OrderRejectReason};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Structured business rejection. Always terminal for the order.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason:?}: {message}")]
pub struct ValidationRejection {
    pub reason: OrderRejectReason,
    pub message: String,
    pub comment: Option<String>,
}

impl ValidationRejection {
    pub fn new(reason: OrderRejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[async_trait]
pub trait OrderValidator: Send + Sync {
    /// `released_margin` is margin freed by positions this order closes.
    async fn pre_trade_validate(
        &self,
        order: &Order,
        wants_to_open: bool,
        matching_engine_id: &str,
        released_margin: Decimal,
    ) -> Result<(), ValidationRejection>;
}

/// Accepts everything.
#[derive(Debug, Default)]
pub struct PermissiveValidator;

#[async_trait]
impl OrderValidator for PermissiveValidator {
    async fn pre_trade_validate(&self, _: &Order, _: bool, _: &str, _: Decimal) -> Result<(), ValidationRejection> {
        Ok(())
    }
}

/// Account and margin checks against local state.
pub struct AccountStateValidator {
    accounts: Arc<AccountStore>,
    assets: Arc<AssetsCache>,
    calculator: Arc<MarginCalculator>,
}

impl AccountStateValidator {
    pub fn new(accounts: Arc<AccountStore>, assets: Arc<AssetsCache>, calculator: Arc<MarginCalculator>) -> Self {
        Self {
            accounts,
            assets,
            calculator,
        }
    }
}

#[async_trait]
impl OrderValidator for AccountStateValidator {
    async fn pre_trade_validate(
        &self,
        order: &Order,
        wants_to_open: bool,
        _matching_engine_id: &str,
        released_margin: Decimal,
    ) -> Result<(), ValidationRejection> {
        let account = self
            .accounts
            .get(&order.account_id)
            .map_err(|e| ValidationRejection::new(OrderRejectReason::InvalidAccount, e.to_string()))?;
        if account.is_disabled {
            return Err(ValidationRejection::new(
                OrderRejectReason::AccountDisabled,
                format!("Account {} is disabled", account.id),
            ));
        }
        self.assets
            .instrument(&account.trading_condition_id, &order.asset_pair_id)
            .map_err(|e| ValidationRejection::new(OrderRejectReason::InvalidInstrument, e.to_string()))?;

        if !wants_to_open {
            return Ok(());
        }

        let Some(price) = order.execution_price.or(order.expected_open_price) else {
            // market orders without a probed price are checked after matching
            return Ok(());
        };
        let required = self
            .calculator
            .initial_margin_for(order, price)
            .map_err(|e| ValidationRejection::new(OrderRejectReason::TechnicalError, e.to_string()))?;
        let available = self
            .calculator
            .account_fpl(&account)
            .map_err(|e| ValidationRejection::new(OrderRejectReason::TechnicalError, e.to_string()))?
            .margin_available()
            + released_margin;

        if required > available {
            return Err(ValidationRejection::new(
                OrderRejectReason::NotEnoughBalance,
                format!("Required margin {required} exceeds available {available}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MarginTradingAccount;
    use crate::assets::{AssetPair, TradingCondition, TradingInstrument};
    use crate::cache::OrderCache;
    use crate::quotes::QuoteStore;
    use crate::services::ManualClock;
    use crate::types::{OrderType, Timestamp};
    use rust_decimal_macros::dec;

    fn validator() -> (AccountStateValidator, Arc<AccountStore>) {
        let assets = Arc::new(AssetsCache::default());
        assets.add_asset_pair(AssetPair::new("EURUSD", "EUR", "USD", 5, "LE"));
        assets.add_trading_condition(TradingCondition::new("tc", "LE"));
        assets.add_instrument(TradingInstrument::new("tc", "EURUSD", dec!(10), dec!(20)));
        let accounts = Arc::new(AccountStore::new(Arc::new(ManualClock::new(Timestamp::from_millis(0)))));
        accounts.try_add_new(MarginTradingAccount::new("a1", "tc", "USD", dec!(100), "LE"));
        let calculator = Arc::new(MarginCalculator::new(
            Arc::clone(&assets),
            Arc::new(QuoteStore::new()),
            Arc::new(QuoteStore::new()),
            Arc::clone(&accounts),
            Arc::new(OrderCache::new()),
        ));
        (AccountStateValidator::new(Arc::clone(&accounts), assets, calculator), accounts)
    }

    fn limit(volume: Decimal) -> Order {
        let mut order = Order::pending("o1", "a1", "EURUSD", volume, OrderType::Limit, dec!(1), Timestamp::from_millis(0));
        order.trading_condition_id = "tc".into();
        order.account_asset_id = "USD".into();
        order.legal_entity = "LE".to_string();
        order
    }

    #[tokio::test]
    async fn margin_check_counts_released_margin() {
        let (validator, _) = validator();
        // 1500 * 1 / 10 = 150 > 100
        let err = validator
            .pre_trade_validate(&limit(dec!(1500)), true, "MM", Decimal::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.reason, OrderRejectReason::NotEnoughBalance);

        validator
            .pre_trade_validate(&limit(dec!(1500)), true, "MM", dec!(60))
            .await
            .unwrap();
        validator
            .pre_trade_validate(&limit(dec!(1500)), false, "MM", Decimal::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_account_is_rejected() {
        let (validator, accounts) = validator();
        let mut account = accounts.get(&"a1".into()).unwrap();
        account.is_disabled = true;
        accounts.update(account).unwrap();
        let err = validator
            .pre_trade_validate(&limit(dec!(1)), true, "MM", Decimal::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.reason, OrderRejectReason::AccountDisabled);
    }
}
