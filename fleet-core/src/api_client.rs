use async_trait::async_trait;
use fleet_domain::{ApiError, MarketData, ShipSnapshot, ShipSymbol, SupplyChain, SystemSymbol, TradeGoodSymbol, Waypoint, WaypointSymbol};
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Upstream error code for "agent already has an active contract". The client
/// maps it to `ApiError::AlreadyHasContract`; callers treat it as success.
pub const ERROR_CODE_ACTIVE_CONTRACT: i64 = 4511;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContractDelivery {
    pub trade_symbol: TradeGoodSymbol,
    pub destination_symbol: WaypointSymbol,
    pub units_required: i32,
    pub units_fulfilled: i32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContractInfo {
    pub id: String,
    pub accepted: bool,
    pub fulfilled: bool,
    pub deliveries: Vec<ContractDelivery>,
}

impl ContractInfo {
    pub fn open_deliveries(&self) -> impl Iterator<Item = &ContractDelivery> {
        self.deliveries.iter().filter(|d| d.units_fulfilled < d.units_required)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseOutcome {
    pub ship: ShipSnapshot,
    pub total_price: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellOutcome {
    pub ship: ShipSnapshot,
    pub total_price: i64,
}

/// The upstream game API as the engine sees it. The concrete HTTP client
/// (rate limiting included) lives outside the core; everything here is
/// exercised through this seam.
#[automock]
#[async_trait]
pub trait ApiClientTrait: Send + Sync + Debug {
    async fn accept_contract(&self, contract_id: &str) -> Result<ContractInfo, ApiError>;
    async fn negotiate_contract(&self, ship: &ShipSymbol) -> Result<ContractInfo, ApiError>;
    async fn fulfill_contract(&self, contract_id: &str) -> Result<ContractInfo, ApiError>;
    async fn deliver_contract(&self, contract_id: &str, ship: &ShipSymbol, good: &TradeGoodSymbol, units: i32) -> Result<ContractInfo, ApiError>;
    async fn get_contract(&self, contract_id: &str) -> Result<ContractInfo, ApiError>;

    async fn navigate_ship(&self, ship: &ShipSymbol, to: &WaypointSymbol) -> Result<ShipSnapshot, ApiError>;
    async fn dock_ship(&self, ship: &ShipSymbol) -> Result<ShipSnapshot, ApiError>;
    async fn refuel_ship(&self, ship: &ShipSymbol) -> Result<ShipSnapshot, ApiError>;
    async fn purchase_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: i32) -> Result<PurchaseOutcome, ApiError>;
    async fn sell_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: i32) -> Result<SellOutcome, ApiError>;
    async fn transfer_cargo(&self, from: &ShipSymbol, to: &ShipSymbol, good: &TradeGoodSymbol, units: i32) -> Result<ShipSnapshot, ApiError>;
    async fn extract_resources(&self, ship: &ShipSymbol) -> Result<ShipSnapshot, ApiError>;
    async fn jettison_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: i32) -> Result<ShipSnapshot, ApiError>;

    async fn get_ship(&self, ship: &ShipSymbol) -> Result<ShipSnapshot, ApiError>;
    async fn list_ships(&self) -> Result<Vec<ShipSnapshot>, ApiError>;
    async fn get_market(&self, waypoint: &WaypointSymbol) -> Result<Vec<MarketData>, ApiError>;
    async fn list_waypoints(&self, system: &SystemSymbol) -> Result<Vec<Waypoint>, ApiError>;
    async fn get_supply_chain(&self) -> Result<SupplyChain, ApiError>;
}
