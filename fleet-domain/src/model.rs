use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PlayerId(pub i64);

impl Display for PlayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SystemSymbol(pub String);

impl Display for SystemSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct WaypointSymbol(pub String);

impl WaypointSymbol {
    /// `X1-AB12-C3` belongs to system `X1-AB12`.
    pub fn system_symbol(&self) -> SystemSymbol {
        let parts: Vec<&str> = self.0.splitn(3, '-').collect();
        SystemSymbol(parts.iter().take(2).cloned().collect::<Vec<_>>().join("-"))
    }
}

impl Display for WaypointSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ShipSymbol(pub String);

impl ShipSymbol {
    /// The `-1` ship of an agent is the command frigate. It stays under manual
    /// control and is never handed to automation pools.
    pub fn is_command_ship(&self) -> bool {
        self.0.ends_with("-1")
    }
}

impl Display for ShipSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TradeGoodSymbol(pub String);

impl Display for TradeGoodSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TradeGoodSymbol {
    fn from(value: &str) -> Self {
        TradeGoodSymbol(value.to_string())
    }
}

pub fn distance_to(x1: i64, y1: i64, x2: i64, y2: i64) -> u32 {
    let dx = (x1 - x2) as f64;
    let dy = (y1 - y2) as f64;
    (dx * dx + dy * dy).sqrt().round() as u32
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub symbol: WaypointSymbol,
    pub x: i64,
    pub y: i64,
}

impl Waypoint {
    pub fn distance_to(&self, other: &Waypoint) -> u32 {
        distance_to(self.x, self.y, other.x, other.y)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipNavStatus {
    InTransit,
    InOrbit,
    Docked,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipRole {
    Command,
    Hauler,
    Excavator,
    Transport,
    Satellite,
    Surveyor,
    Refinery,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct CargoItem {
    pub symbol: TradeGoodSymbol,
    pub units: i32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct Cargo {
    pub capacity: i32,
    pub units: i32,
    pub inventory: Vec<CargoItem>,
}

impl Cargo {
    pub fn empty(capacity: i32) -> Self {
        Self {
            capacity,
            units: 0,
            inventory: vec![],
        }
    }

    pub fn units_of(&self, good: &TradeGoodSymbol) -> i32 {
        self.inventory
            .iter()
            .filter(|item| &item.symbol == good)
            .map(|item| item.units)
            .sum()
    }

    pub fn available_space(&self) -> i32 {
        self.capacity - self.units
    }

    pub fn is_empty(&self) -> bool {
        self.units == 0
    }
}

/// Point-in-time view of a ship as returned by the upstream API. The engine
/// never mutates these; workers re-fetch after every action.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShipSnapshot {
    pub symbol: ShipSymbol,
    pub role: ShipRole,
    pub nav_status: ShipNavStatus,
    pub waypoint_symbol: WaypointSymbol,
    pub x: i64,
    pub y: i64,
    pub cargo: Cargo,
    pub fuel_current: i32,
    pub fuel_capacity: i32,
    pub engine_speed: i32,
}

impl ShipSnapshot {
    pub fn is_in_transit(&self) -> bool {
        self.nav_status == ShipNavStatus::InTransit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waypoint_symbol_derives_system() {
        let wp = WaypointSymbol("X1-AU21-F1".to_string());
        assert_eq!(wp.system_symbol(), SystemSymbol("X1-AU21".to_string()));
    }

    #[test]
    fn command_ship_detection() {
        assert!(ShipSymbol("AGENT-1".to_string()).is_command_ship());
        assert!(!ShipSymbol("AGENT-1A".to_string()).is_command_ship());
        assert!(!ShipSymbol("AGENT-2".to_string()).is_command_ship());
    }

    #[test]
    fn cargo_units_of_sums_matching_items() {
        let cargo = Cargo {
            capacity: 60,
            units: 25,
            inventory: vec![
                CargoItem {
                    symbol: "IRON".into(),
                    units: 10,
                },
                CargoItem {
                    symbol: "COPPER".into(),
                    units: 15,
                },
            ],
        };
        assert_eq!(cargo.units_of(&"IRON".into()), 10);
        assert_eq!(cargo.units_of(&"FAB_MATS".into()), 0);
        assert_eq!(cargo.available_space(), 35);
    }
}
