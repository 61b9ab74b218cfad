use crate::{PlayerId, TradeGoodSymbol, WaypointSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Copy, Clone, Debug, strum::Display, strum::EnumString, strum::EnumIter, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplyLevel {
    Scarce = 0,
    Limited = 1,
    Moderate = 2,
    High = 3,
    Abundant = 4,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, strum::Display, strum::EnumString, strum::EnumIter, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityLevel {
    Restricted = 0,
    Weak = 1,
    Growing = 2,
    Strong = 3,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, strum::Display, strum::EnumString, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeGoodType {
    Export,
    Import,
    Exchange,
}

/// Latest observed quote for one good at one waypoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    pub waypoint_symbol: WaypointSymbol,
    pub good_symbol: TradeGoodSymbol,
    pub supply: Option<SupplyLevel>,
    pub activity: Option<ActivityLevel>,
    pub trade_type: Option<TradeGoodType>,
    pub purchase_price: i64,
    pub sell_price: i64,
    pub trade_volume: i32,
    pub last_updated: DateTime<Utc>,
    pub player_id: PlayerId,
}

impl MarketData {
    pub fn supply_at_least(&self, floor: SupplyLevel) -> bool {
        self.supply.map(|s| s >= floor).unwrap_or(false)
    }

    pub fn accepts(&self) -> bool {
        matches!(self.trade_type, Some(TradeGoodType::Import) | Some(TradeGoodType::Exchange))
    }

    pub fn exports(&self) -> bool {
        self.trade_type == Some(TradeGoodType::Export)
    }
}

/// One row of the price-volatility read (LAG window over ordered quotes).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PriceSwing {
    pub waypoint_symbol: WaypointSymbol,
    pub good_symbol: TradeGoodSymbol,
    pub max_abs_swing: i64,
}
