use crate::{ContainerId, PlayerId, ShipSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AssignmentStatus {
    Idle,
    Active,
    Released,
}

/// One row of the ship-assignment ledger. The ledger is the single source of
/// truth for ship ownership: at most one row per (ship, player) is `active`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ShipAssignment {
    pub ship_symbol: ShipSymbol,
    pub player_id: PlayerId,
    pub container_id: Option<ContainerId>,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<String>,
}

impl ShipAssignment {
    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }

    pub fn is_owned_by(&self, container_id: &ContainerId) -> bool {
        self.is_active() && self.container_id.as_ref() == Some(container_id)
    }
}
