//! Ports — the named interfaces the core consumes.
//!
//! RULE: Only adapters behind these traits touch the outside world.
//! Agents call ports; they never reach for a database, an HTTP client
//! or a message gateway directly. Every port call may suspend and is
//! expected to honour the caller's deadline.

use crate::error::CoreResult;
use crate::event::ActionPriority;
use crate::types::{
    Driver, DriverId, DriverStatus, EscalationLevel, Location, Order, OrderId, OrderStatus,
    ServiceType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Order repository ─────────────────────────────────────────────────────────

/// Filter for `OrderRepository::get_active`. Empty filter = all
/// non-terminal orders.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub service_type: Option<ServiceType>,
    pub status:       Option<OrderStatus>,
    pub assigned_to:  Option<DriverId>,
}

/// Partial update applied together with a status transition. Monotonic
/// flags (`sla_notified`, `delay_notified`) can only be raised; the
/// adapter enforces that.
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub sla_notified:      Option<bool>,
    pub delay_notified:    Option<bool>,
    pub delivery_attempts: Option<u32>,
    pub priority_boost:    Option<u8>,
    pub service_type:      Option<ServiceType>,
    pub delivered_at:      Option<DateTime<Utc>>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get_active(&self, filter: OrderFilter) -> CoreResult<Vec<Order>>;

    async fn get_by_id(&self, id: &str) -> CoreResult<Option<Order>>;

    async fn insert(&self, order: Order) -> CoreResult<()>;

    /// Transition status and apply the patch atomically. Returns the
    /// updated order.
    async fn update_status(
        &self,
        id: &str,
        new_status: OrderStatus,
        patch: OrderPatch,
    ) -> CoreResult<Order>;

    /// Compare-and-set on `assigned_driver_id`. Returns true when the
    /// swap happened; false when the current value didn't match
    /// `expected` (the caller refreshes and retries once).
    async fn cas_assigned_driver(
        &self,
        id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> CoreResult<bool>;
}

// ── Driver repository ────────────────────────────────────────────────────────

#[async_trait]
pub trait DriverRepository: Send + Sync {
    async fn list(&self) -> CoreResult<Vec<Driver>>;

    async fn get_by_id(&self, id: &str) -> CoreResult<Option<Driver>>;

    async fn insert(&self, driver: Driver) -> CoreResult<()>;

    async fn update_location(&self, id: &str, location: Location, at: DateTime<Utc>)
        -> CoreResult<()>;

    async fn update_status(&self, id: &str, status: DriverStatus) -> CoreResult<()>;

    /// Add an order to the driver's active set, maintaining the
    /// per-service counters.
    async fn attach_order(
        &self,
        driver_id: &str,
        order_id: &str,
        service: ServiceType,
    ) -> CoreResult<()>;

    /// Remove an order from the driver's active set.
    async fn detach_order(
        &self,
        driver_id: &str,
        order_id: &str,
        service: ServiceType,
    ) -> CoreResult<()>;
}

// ── Activity log ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Assignment,
    Reassignment,
    Escalation,
    Recovery,
    Notification,
    Breach,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id:        String,
    pub at:        DateTime<Utc>,
    pub kind:      ActivityKind,
    pub order_id:  Option<OrderId>,
    pub driver_id: Option<DriverId>,
    pub detail:    String,
}

#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn append(&self, record: ActivityRecord) -> CoreResult<()>;

    async fn recent(&self, limit: usize) -> CoreResult<Vec<ActivityRecord>>;

    async fn for_order(&self, order_id: &str) -> CoreResult<Vec<ActivityRecord>>;
}

// ── Autonomous action ledger ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousActionRecord {
    pub id:       String,
    pub at:       DateTime<Utc>,
    pub source:   String,
    pub reason:   String,
    pub priority: ActionPriority,
    pub context:  serde_json::Value,
}

#[async_trait]
pub trait AutonomousActionRepository: Send + Sync {
    async fn append(&self, record: AutonomousActionRecord) -> CoreResult<()>;

    async fn recent(&self, limit: usize) -> CoreResult<Vec<AutonomousActionRecord>>;
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLeg {
    pub distance_km:  f64,
    pub duration_min: f64,
    pub geometry:     Option<Vec<Location>>,
}

#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, from: Location, to: Location) -> CoreResult<RouteLeg>;
}

/// Optional route-quality oracle. Any error is treated as absence.
#[async_trait]
pub trait RouteOracle: Send + Sync {
    /// Return an ordering of `stops` as indices into the input slice.
    async fn rank(&self, start: Location, stops: &[Location]) -> CoreResult<Vec<usize>>;
}

// ── Outbound side-effects ────────────────────────────────────────────────────

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn sms(&self, phone: &str, message: &str) -> CoreResult<()>;

    async fn email(&self, to: &str, subject: &str, body: &str) -> CoreResult<()>;

    async fn in_app(&self, user_id: &str, payload: serde_json::Value) -> CoreResult<()>;

    async fn voice(&self, phone: &str, message: &str) -> CoreResult<()>;
}

#[async_trait]
pub trait EscalationGateway: Send + Sync {
    async fn notify(&self, level: EscalationLevel, payload: serde_json::Value) -> CoreResult<()>;
}

/// Sink for self-initiated work directives.
#[async_trait]
pub trait AutonomousPort: Send + Sync {
    async fn trigger(
        &self,
        source: &str,
        reason: &str,
        context: serde_json::Value,
        priority: ActionPriority,
    ) -> CoreResult<()>;
}
