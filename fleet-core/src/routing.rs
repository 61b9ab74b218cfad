use anyhow::Result;
use async_trait::async_trait;
use fleet_domain::{SystemSymbol, Waypoint, WaypointSymbol};
use mockall::automock;
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteStep {
    pub from: WaypointSymbol,
    pub to: WaypointSymbol,
    pub fuel_cost: i64,
    pub time_seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub steps: Vec<RouteStep>,
    pub total_fuel_cost: i64,
    pub total_time_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub system: SystemSymbol,
    pub start: WaypointSymbol,
    pub goal: WaypointSymbol,
    pub current_fuel: i32,
    pub fuel_capacity: i32,
    pub engine_speed: i32,
    pub waypoints: Vec<Waypoint>,
    pub fuel_efficient: bool,
    pub prefer_cruise: bool,
}

/// Pathfinding over the star-system graph, provided from outside the core.
/// Deterministic; the core caches nothing.
#[automock]
#[async_trait]
pub trait RoutingClientTrait: Send + Sync + Debug {
    async fn plan_route(&self, request: RouteRequest) -> Result<Route>;
}
