//! Price-level liquidity book used by the internal market maker engine.
//!
//! Bids and asks are aggregated volume per price. Taking liquidity walks the
//! opposing side best price first and returns one fill per level touched.

use crate::types::{AssetPairId, OrderDirection};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// A single price level in the book
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone)]
pub struct LiquidityBook {
    pub asset_pair_id: AssetPairId,
    /// price -> volume, best bid is the last key
    bids: BTreeMap<Decimal, Decimal>,
    /// price -> volume, best ask is the first key
    asks: BTreeMap<Decimal, Decimal>,
}

impl LiquidityBook {
    pub fn new(asset_pair_id: AssetPairId) -> Self {
        Self {
            asset_pair_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Adds resting volume. Zero or negative volume removes the level.
    pub fn set_level(&mut self, side: OrderDirection, price: Decimal, volume: Decimal) {
        let levels = match side {
            OrderDirection::Buy => &mut self.bids,
            OrderDirection::Sell => &mut self.asks,
        };
        if volume <= Decimal::ZERO {
            levels.remove(&price);
        } else {
            levels.insert(price, volume);
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Levels a taker in `direction` would consume, best first.
    pub fn opposing_levels(&self, direction: OrderDirection) -> Vec<PriceLevel> {
        let to_level = |(price, volume): (&Decimal, &Decimal)| PriceLevel {
            price: *price,
            volume: *volume,
        };
        match direction {
            OrderDirection::Buy => self.asks.iter().map(to_level).collect(),
            OrderDirection::Sell => self.bids.iter().rev().map(to_level).collect(),
        }
    }

    pub fn available_volume(&self, direction: OrderDirection) -> Decimal {
        match direction {
            OrderDirection::Buy => self.asks.values().sum(),
            OrderDirection::Sell => self.bids.values().sum(),
        }
    }

    /// Volume-weighted price to fill `volume` in `direction`, if depth allows.
    pub fn price_for_volume(&self, direction: OrderDirection, volume: Decimal) -> Option<Decimal> {
        let wanted = volume.abs();
        if wanted.is_zero() {
            return self.opposing_levels(direction).first().map(|l| l.price);
        }
        let mut remaining = wanted;
        let mut notional = Decimal::ZERO;
        for level in self.opposing_levels(direction) {
            let take = remaining.min(level.volume);
            notional += take * level.price;
            remaining -= take;
            if remaining.is_zero() {
                return Some(notional / wanted);
            }
        }
        None
    }

    /// Consumes up to `volume` from the opposing side. Returns (price, volume) per level.
    pub fn take(&mut self, direction: OrderDirection, volume: Decimal) -> Vec<PriceLevel> {
        let mut remaining = volume.abs();
        let mut fills = Vec::new();

        for level in self.opposing_levels(direction) {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(level.volume);
            remaining -= take;
            fills.push(PriceLevel {
                price: level.price,
                volume: take,
            });
            let opposing = match direction {
                OrderDirection::Buy => OrderDirection::Sell,
                OrderDirection::Sell => OrderDirection::Buy,
            };
            self.set_level(opposing, level.price, level.volume - take);
        }

        fills
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> LiquidityBook {
        let mut book = LiquidityBook::new(AssetPairId::from("BTCUSD"));
        book.set_level(OrderDirection::Sell, dec!(50000), dec!(1));
        book.set_level(OrderDirection::Sell, dec!(50100), dec!(2));
        book.set_level(OrderDirection::Buy, dec!(49900), dec!(1));
        book.set_level(OrderDirection::Buy, dec!(49800), dec!(3));
        book
    }

    #[test]
    fn empty_book() {
        let book = LiquidityBook::new(AssetPairId::from("BTCUSD"));
        assert!(book.is_empty());
        assert!(book.best_bid().is_none());
        assert!(book.mid_price().is_none());
    }

    #[test]
    fn top_of_book() {
        let book = book();
        assert_eq!(book.best_bid(), Some(dec!(49900)));
        assert_eq!(book.best_ask(), Some(dec!(50000)));
        assert_eq!(book.spread(), Some(dec!(100)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn take_walks_best_price_first() {
        let mut book = book();
        let fills = book.take(OrderDirection::Buy, dec!(1.5));
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0], PriceLevel { price: dec!(50000), volume: dec!(1) });
        assert_eq!(fills[1], PriceLevel { price: dec!(50100), volume: dec!(0.5) });
        assert_eq!(book.best_ask(), Some(dec!(50100)));
        assert_eq!(book.available_volume(OrderDirection::Buy), dec!(1.5));
    }

    #[test]
    fn sell_takes_bids_from_the_top() {
        let mut book = book();
        let fills = book.take(OrderDirection::Sell, dec!(-10));
        assert_eq!(fills.iter().map(|f| f.volume).sum::<Decimal>(), dec!(4));
        assert_eq!(fills[0].price, dec!(49900));
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn price_for_volume_needs_depth() {
        let book = book();
        assert_eq!(book.price_for_volume(OrderDirection::Sell, dec!(2)), Some(dec!(49850)));
        assert_eq!(book.price_for_volume(OrderDirection::Buy, dec!(5)), None);
    }
}
