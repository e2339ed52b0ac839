//! Latest best bid/ask per instrument.
//!
//! The engine keeps two stores: one fed by the trading quote feed and one fed
//! by FX rates used for cross-currency conversion. Crossed and out-of-order
//! ticks are refused here so nothing downstream has to re-check them.

use crate::types::{AssetPairId, OrderDirection, PositionDirection, Timestamp};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuoteError {
    #[error("No quote for {0}")]
    QuoteNotFound(AssetPairId),

    #[error("Crossed quote for {instrument}: bid {bid} > ask {ask}")]
    Crossed {
        instrument: AssetPairId,
        bid: Decimal,
        ask: Decimal,
    },

    #[error("Non-positive price in quote for {0}")]
    NonPositive(AssetPairId),

    #[error("Out of order quote for {instrument}: {received} is older than {stored}")]
    OutOfOrder {
        instrument: AssetPairId,
        received: Timestamp,
        stored: Timestamp,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentBidAskPair {
    pub instrument: AssetPairId,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Top of book depth. `None` means the feed does not report depth.
    pub bid_volume: Option<Decimal>,
    pub ask_volume: Option<Decimal>,
    pub timestamp: Timestamp,
}

impl InstrumentBidAskPair {
    pub fn new(instrument: &str, bid: Decimal, ask: Decimal, timestamp: Timestamp) -> Self {
        Self {
            instrument: AssetPairId::from(instrument),
            bid,
            ask,
            bid_volume: None,
            ask_volume: None,
            timestamp,
        }
    }

    pub fn with_depth(mut self, bid_volume: Decimal, ask_volume: Decimal) -> Self {
        self.bid_volume = Some(bid_volume);
        self.ask_volume = Some(ask_volume);
        self
    }

    // buyers lift the ask, sellers hit the bid
    pub fn price_for(&self, direction: OrderDirection) -> Decimal {
        match direction {
            OrderDirection::Buy => self.ask,
            OrderDirection::Sell => self.bid,
        }
    }

    pub fn volume_for(&self, direction: OrderDirection) -> Option<Decimal> {
        match direction {
            OrderDirection::Buy => self.ask_volume,
            OrderDirection::Sell => self.bid_volume,
        }
    }

    pub fn close_price_for(&self, direction: PositionDirection) -> Decimal {
        self.price_for(direction.close_direction())
    }

    /// True when the top of book on `direction`'s side can absorb `volume`.
    pub fn has_depth_for(&self, direction: OrderDirection, volume: Decimal) -> bool {
        self.volume_for(direction)
            .map_or(true, |available| available >= volume.abs())
    }

    pub fn validate(&self) -> Result<(), QuoteError> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return Err(QuoteError::NonPositive(self.instrument.clone()));
        }
        if self.bid > self.ask {
            return Err(QuoteError::Crossed {
                instrument: self.instrument.clone(),
                bid: self.bid,
                ask: self.ask,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct QuoteStore {
    quotes: RwLock<HashMap<AssetPairId, InstrumentBidAskPair>>,
}

impl QuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, quote: InstrumentBidAskPair) -> Result<(), QuoteError> {
        quote.validate()?;
        let mut quotes = self.quotes.write();
        if let Some(stored) = quotes.get(&quote.instrument) {
            if quote.timestamp < stored.timestamp {
                return Err(QuoteError::OutOfOrder {
                    instrument: quote.instrument.clone(),
                    received: quote.timestamp,
                    stored: stored.timestamp,
                });
            }
        }
        quotes.insert(quote.instrument.clone(), quote);
        Ok(())
    }

    pub fn get_quote(&self, instrument: &AssetPairId) -> Result<InstrumentBidAskPair, QuoteError> {
        self.try_get_quote(instrument)
            .ok_or_else(|| QuoteError::QuoteNotFound(instrument.clone()))
    }

    pub fn try_get_quote(&self, instrument: &AssetPairId) -> Option<InstrumentBidAskPair> {
        self.quotes.read().get(instrument).cloned()
    }

    pub fn remove_quote(&self, instrument: &AssetPairId) -> Option<InstrumentBidAskPair> {
        self.quotes.write().remove(instrument)
    }

    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_crossed_quote() {
        let store = QuoteStore::new();
        let quote = InstrumentBidAskPair::new("EURUSD", dec!(1.2), dec!(1.1), Timestamp::from_millis(1));
        assert!(matches!(store.set_quote(quote), Err(QuoteError::Crossed { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn rejects_out_of_order_quote() {
        let store = QuoteStore::new();
        store
            .set_quote(InstrumentBidAskPair::new("EURUSD", dec!(1.1), dec!(1.2), Timestamp::from_millis(10)))
            .unwrap();
        let stale = InstrumentBidAskPair::new("EURUSD", dec!(1.0), dec!(1.3), Timestamp::from_millis(5));
        assert!(matches!(store.set_quote(stale), Err(QuoteError::OutOfOrder { .. })));
        assert_eq!(store.get_quote(&AssetPairId::from("EURUSD")).unwrap().bid, dec!(1.1));
    }

    #[test]
    fn sides_and_depth() {
        let quote = InstrumentBidAskPair::new("EURUSD", dec!(790), dec!(800), Timestamp::from_millis(1))
            .with_depth(dec!(5), dec!(20));
        assert_eq!(quote.price_for(OrderDirection::Buy), dec!(800));
        assert_eq!(quote.close_price_for(PositionDirection::Long), dec!(790));
        assert!(quote.has_depth_for(OrderDirection::Buy, dec!(-20)));
        assert!(!quote.has_depth_for(OrderDirection::Sell, dec!(6)));

        let undisclosed = InstrumentBidAskPair::new("EURUSD", dec!(1), dec!(2), Timestamp::from_millis(1));
        assert!(undisclosed.has_depth_for(OrderDirection::Sell, dec!(1_000_000)));
    }

    #[test]
    fn missing_quote_is_an_error() {
        let store = QuoteStore::new();
        assert!(matches!(
            store.get_quote(&AssetPairId::from("BTCUSD")),
            Err(QuoteError::QuoteNotFound(_))
        ));
    }
}
