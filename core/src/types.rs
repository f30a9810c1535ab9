//! Shared primitive and entity types used across the entire decision core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stable, unique identifier for an order. Assigned upstream; opaque here.
pub type OrderId = String;

/// A stable, unique identifier for a driver.
pub type DriverId = String;

/// A stable zone identifier ("north", "south", "east", "west", "central").
pub type ZoneId = String;

/// The two delivery service classes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Express,
    Standard,
}

impl ServiceType {
    /// Promised delivery window in minutes.
    pub fn sla_minutes(&self) -> i64 {
        match self {
            Self::Express => 60,
            Self::Standard => 240,
        }
    }

    /// Compensation rate per minute of delay on a breach.
    pub fn compensation_rate(&self) -> f64 {
        match self {
            Self::Express => 10.0,
            Self::Standard => 5.0,
        }
    }

    /// Maximum assignment search radius in km.
    pub fn max_radius_km(&self) -> f64 {
        match self {
            Self::Express => 5.0,
            Self::Standard => 10.0,
        }
    }
}

/// Vehicle classes in the fleet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    Bike,
    Car,
    Van,
}

/// Maximum concurrent orders per vehicle type, split by service class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capacity {
    pub express:  u32,
    pub standard: u32,
}

impl Capacity {
    pub fn total(&self) -> u32 {
        self.express + self.standard
    }

    /// Slots for one service class.
    pub fn for_service(&self, service: ServiceType) -> u32 {
        match service {
            ServiceType::Express => self.express,
            ServiceType::Standard => self.standard,
        }
    }
}

/// A WGS84 point. All distances between locations are geographic
/// (Haversine, km) — there is exactly one distance function in the core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Order lifecycle states. Transitions happen only through
/// `OrderRepository::update_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    PickupInProgress,
    DeliveryInProgress,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    /// Terminal states never re-enter the decision loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled | Self::Failed)
    }
}

/// Driver lifecycle states as stored. The fleet agent derives its own
/// bucketing on top of this (a stored `Available` driver with a stale
/// location reads as offline).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Available,
    Busy,
    Break,
    Offline,
    Full,
}

/// An order as owned by the OrderRepository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id:                 OrderId,
    pub service_type:       ServiceType,
    pub status:             OrderStatus,
    pub created_at:         DateTime<Utc>,
    pub promised_at:        DateTime<Utc>,
    pub pickup:             Location,
    pub delivery:           Location,
    /// 1 (lowest) .. 10 (highest).
    pub priority:           u8,
    pub assigned_driver_id: Option<DriverId>,
    pub priority_boost:     Option<u8>,
    pub delivery_attempts:  u32,
    /// Customer consented to leave-at-door on a failed handoff.
    pub leave_at_door:      bool,
    /// Monotonic: once true, never cleared.
    pub sla_notified:       bool,
    /// Monotonic: once true, never cleared.
    pub delay_notified:     bool,
    pub delivered_at:       Option<DateTime<Utc>>,
}

impl Order {
    /// Minutes elapsed since creation.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds() as f64 / 60.0
    }

    /// Effective priority including any boost, capped at 10.
    pub fn effective_priority(&self) -> u8 {
        self.priority.saturating_add(self.priority_boost.unwrap_or(0)).min(10)
    }
}

/// A driver as owned by the DriverRepository.
///
/// `active_express`/`active_standard` are maintained by the repository on
/// attach/detach so capacity checks never need an order lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id:                      DriverId,
    pub vehicle_type:            VehicleType,
    pub status:                  DriverStatus,
    pub location:                Location,
    pub location_at:             DateTime<Utc>,
    pub active_order_ids:        Vec<OrderId>,
    pub active_express:          u32,
    pub active_standard:         u32,
    pub continuous_minutes:      f64,
    pub orders_today:            u32,
    pub last_break_at:           Option<DateTime<Utc>>,
    /// 0..100.
    pub battery:                 u8,
    /// 0.0..5.0 customer rating.
    pub rating:                  f64,
    /// Share of express orders delivered inside the window, 0.0..1.0.
    pub express_success_rate:    f64,
    /// When the current workload is expected to clear.
    pub estimated_completion_at: Option<DateTime<Utc>>,
}

impl Driver {
    pub fn active_count(&self) -> u32 {
        self.active_order_ids.len() as u32
    }
}

/// Escalation severity, ordered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Organisational tiers authorised to resolve an emergency, ordered.
/// Within one escalation's lifetime the level never decreases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscalationLevel {
    L1,
    L2,
    L3,
    L4,
}

impl EscalationLevel {
    /// Minutes the tier has to respond before the chain moves up.
    pub fn response_minutes(&self) -> i64 {
        match self {
            Self::L1 => 2,
            Self::L2 => 5,
            Self::L3 => 10,
            Self::L4 => 15,
        }
    }

    /// The next tier up, saturating at L4.
    pub fn bumped(&self) -> Self {
        match self {
            Self::L1 => Self::L2,
            Self::L2 => Self::L3,
            Self::L3 | Self::L4 => Self::L4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::L1 => "supervisor",
            Self::L2 => "manager",
            Self::L3 => "director",
            Self::L4 => "executive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_split_per_service() {
        let cap = Capacity { express: 5, standard: 8 };
        assert_eq!(cap.for_service(ServiceType::Express), 5);
        assert_eq!(cap.for_service(ServiceType::Standard), 8);
        assert_eq!(cap.total(), 13);
    }

    #[test]
    fn effective_priority_caps_at_ten() {
        let mut order = Order {
            id: "o1".into(),
            service_type: ServiceType::Express,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            promised_at: Utc::now(),
            pickup: Location::new(24.71, 46.67),
            delivery: Location::new(24.72, 46.68),
            priority: 8,
            assigned_driver_id: None,
            priority_boost: Some(5),
            delivery_attempts: 0,
            leave_at_door: false,
            sla_notified: false,
            delay_notified: false,
            delivered_at: None,
        };
        assert_eq!(order.effective_priority(), 10);
        order.priority_boost = None;
        assert_eq!(order.effective_priority(), 8);
    }
}
