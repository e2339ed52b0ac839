// 1.0: all the primitives live here. nothing in the engine works without these types.
// IDs, directions, order classifications, timestamps and rounding helpers.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places used when comparing volumes for equality.
pub const VOLUME_ACCURACY: u32 = 10;

pub const MILLIS_PER_DAY: i64 = 86_400_000;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(AccountId);
string_id!(AssetPairId);
string_id!(AssetId);
string_id!(OrderId);
string_id!(PositionId);
string_id!(TradingConditionId);

// a position is opened by exactly one order and inherits its id
impl From<OrderId> for PositionId {
    fn from(value: OrderId) -> Self {
        Self(value.0)
    }
}

impl From<&PositionId> for OrderId {
    fn from(value: &PositionId) -> Self {
        Self(value.0.clone())
    }
}

// 1.1: order direction. Buy adds volume, Sell removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl OrderDirection {
    pub fn from_volume(volume: Decimal) -> Self {
        if volume >= Decimal::ZERO {
            OrderDirection::Buy
        } else {
            OrderDirection::Sell
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            OrderDirection::Buy => dec!(1),
            OrderDirection::Sell => dec!(-1),
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderDirection::Buy => OrderDirection::Sell,
            OrderDirection::Sell => OrderDirection::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionDirection {
    Long,
    Short,
}

impl PositionDirection {
    pub fn from_volume(volume: Decimal) -> Self {
        if volume >= Decimal::ZERO {
            PositionDirection::Long
        } else {
            PositionDirection::Short
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            PositionDirection::Long => dec!(1),
            PositionDirection::Short => dec!(-1),
        }
    }

    // direction of the order that reduces this position
    pub fn close_direction(&self) -> OrderDirection {
        match self {
            PositionDirection::Long => OrderDirection::Sell,
            PositionDirection::Short => OrderDirection::Buy,
        }
    }
}

// 1.2: order classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    TrailingStop,
}

impl OrderType {
    pub fn is_pending(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderFillType {
    FillOrKill,
    PartialFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginatorType {
    Investor,
    System,
}

/// Why an order or close is happening. Anything but `Regular` skips pre-trade validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderModality {
    Unspecified,
    Regular,
    LiquidationMarginCall,
    LiquidationCorporateAction,
}

impl OrderModality {
    pub fn is_liquidation(&self) -> bool {
        matches!(
            self,
            OrderModality::LiquidationMarginCall | OrderModality::LiquidationCorporateAction
        )
    }
}

// 1.3: millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn plus_millis(&self, ms: i64) -> Self {
        Self(self.0 + ms)
    }

    /// Days since the epoch. Validity dates compare at day granularity.
    pub fn day_index(&self) -> i64 {
        self.0.div_euclid(MILLIS_PER_DAY)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

// 1.4: rounding. money to the account asset accuracy, volumes to VOLUME_ACCURACY.
pub fn round_to(value: Decimal, accuracy: u32) -> Decimal {
    value.round_dp(accuracy)
}

pub fn round_volume(volume: Decimal) -> Decimal {
    volume.round_dp(VOLUME_ACCURACY)
}

pub fn is_zero_volume(volume: Decimal) -> bool {
    round_volume(volume).is_zero()
}
