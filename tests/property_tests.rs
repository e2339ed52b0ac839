//! Property-based tests for the position and PnL math.
//!
//! These tests verify invariants hold under random inputs.

use margin_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)) // 1.00 to 100,000
}

fn volume_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 4)) // 0.0001 to 100
}

fn direction_strategy() -> impl Strategy<Value = Decimal> {
    prop_oneof![Just(Decimal::ONE), Just(Decimal::NEGATIVE_ONE)]
}

/// Close chunks as fractions (in percent) of the remaining volume.
fn close_plan_strategy() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(1u32..=100u32, 1..6)
}

fn now() -> Timestamp {
    Timestamp::from_millis(1_700_000_000_000)
}

fn calculator() -> (MarginCalculator, Arc<AccountStore>) {
    let assets = Arc::new(AssetsCache::default());
    assets.add_asset(Asset { id: AssetId::from("USD"), accuracy: 2 });
    assets.add_asset_pair(AssetPair::new("BTCUSD", "BTC", "USD", 2, "LE1"));
    assets.add_trading_condition(TradingCondition::new("TC1", "LE1"));
    assets.add_instrument(TradingInstrument::new("TC1", "BTCUSD", dec!(50), dec!(100)));

    let clock = Arc::new(ManualClock::new(now()));
    let accounts = Arc::new(AccountStore::new(clock));
    accounts.try_add_new(MarginTradingAccount::new("AA0001", "TC1", "USD", dec!(1000000), "LE1"));

    let calculator = MarginCalculator::new(
        assets,
        Arc::new(QuoteStore::new()),
        Arc::new(QuoteStore::new()),
        Arc::clone(&accounts),
        Arc::new(OrderCache::new()),
    );
    (calculator, accounts)
}

fn open_position(volume: Decimal, price: Decimal) -> Position {
    let mut order = Order::market("P1", "AA0001", "BTCUSD", volume, now());
    order.trading_condition_id = TradingConditionId::from("TC1");
    order.account_asset_id = AssetId::from("USD");
    order.legal_entity = "LE1".to_string();
    let fills = MatchedOrderCollection::new(vec![MatchedOrder::new("MM", price, volume.abs(), now())]);
    Position::open(&order, fills, now())
}

proptest! {
    /// Unrealized PnL is zero while the close price equals the open price
    #[test]
    fn fpl_zero_at_open_price(
        volume in volume_strategy(),
        sign in direction_strategy(),
        price in price_strategy(),
    ) {
        let (calc, _) = calculator();
        let position = open_position(volume * sign, price);

        let snapshot = calc.fpl(&position).unwrap();
        prop_assert_eq!(snapshot.fpl, Decimal::ZERO);
        prop_assert!(snapshot.margin_init >= snapshot.margin_maintenance);
    }

    /// Longs gain when the price rises, shorts gain when it falls
    #[test]
    fn fpl_sign_follows_direction(
        volume in volume_strategy(),
        sign in direction_strategy(),
        open in price_strategy(),
        close in price_strategy(),
    ) {
        let (calc, _) = calculator();
        let mut position = open_position(volume * sign, open);
        position.update_close_price(close);

        let fpl = calc.fpl(&position).unwrap().fpl;
        let expected = ((close - open) * volume * sign).round_dp(2);
        prop_assert_eq!(fpl, expected);
        if expected > Decimal::ZERO {
            prop_assert!((close > open) == (sign > Decimal::ZERO));
        }
    }

    /// A snapshot is only recomputed after something moved the version stamp
    #[test]
    fn recompute_only_after_version_moves(
        volume in volume_strategy(),
        open in price_strategy(),
        closes in prop::collection::vec(price_strategy(), 1..8),
    ) {
        let (calc, _) = calculator();
        let mut position = open_position(volume, open);

        calc.fpl(&position).unwrap();
        let mut expected = 1;
        prop_assert_eq!(calc.recompute_count(), expected);

        for close in closes {
            let version = position.fpl.version();
            position.update_close_price(close);
            if position.fpl.version() != version {
                expected += 1;
            }
            calc.fpl(&position).unwrap();
            calc.fpl(&position).unwrap();
            prop_assert_eq!(calc.recompute_count(), expected);
        }
    }

    /// Partial closes keep volume equal to what is left unmatched, and the
    /// position reports closed exactly when nothing is left
    #[test]
    fn partial_closes_conserve_volume(
        volume in volume_strategy(),
        sign in direction_strategy(),
        price in price_strategy(),
        plan in close_plan_strategy(),
    ) {
        let mut position = open_position(volume * sign, price);
        let opened = position.volume;

        let mut closed = Decimal::ZERO;
        for percent in plan {
            let remaining = position.volume.abs();
            let chunk = round_volume(remaining * Decimal::from(percent) / dec!(100));
            if chunk.is_zero() {
                continue;
            }
            let fills = MatchedOrderCollection::new(vec![MatchedOrder::new("MM", price, chunk, now())]);
            let done = position
                .partially_close(now(), fills, PositionCloseReason::Close, OriginatorType::Investor)
                .unwrap();
            closed += chunk;

            prop_assert_eq!(position.volume, round_volume(opened - closed * sign));
            prop_assert_eq!(done, position.volume.is_zero());
            prop_assert_eq!(done, position.status == PositionStatus::Closed);
            if done {
                break;
            }
        }
    }

    /// Closing more than is left is refused and leaves the position untouched
    #[test]
    fn overclose_is_refused(
        volume in volume_strategy(),
        sign in direction_strategy(),
        price in price_strategy(),
        extra in 1i64..10_000i64,
    ) {
        let mut position = open_position(volume * sign, price);
        let before = position.volume;
        let too_much = volume + Decimal::new(extra, 4);
        let fills = MatchedOrderCollection::new(vec![MatchedOrder::new("MM", price, too_much, now())]);

        let result = position.partially_close(now(), fills, PositionCloseReason::Close, OriginatorType::Investor);
        let refused = matches!(result, Err(PositionError::Overclose { .. }));
        prop_assert!(refused);
        prop_assert_eq!(position.volume, before);
        prop_assert_eq!(position.status, PositionStatus::Active);
    }

    /// A lower balance never leaves the account at a healthier level
    #[test]
    fn level_is_monotonic_in_capital(
        used in (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        low in (0i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        bump in (0i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        pnl in (-1_000_000i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let figures = |balance: Decimal| AccountFpl {
            balance,
            pnl,
            currently_used_margin: used,
            margin_init: used,
            withdrawal_frozen_margin: Decimal::ZERO,
            unconfirmed_margin: Decimal::ZERO,
            open_positions_count: 1,
            active_orders_count: 0,
            margin_call1_level: dec!(1.5),
            margin_call2_level: dec!(1.2),
            stop_out_level: dec!(1.0),
            overnight_margin_call_level: None,
            calculated_version: 0,
        };

        let poorer = figures(low);
        let richer = figures(low + bump);
        prop_assert!(poorer.level() >= richer.level());
        prop_assert_eq!(poorer.level() == AccountLevel::StopOut, poorer.total_capital() <= used);
    }
}
