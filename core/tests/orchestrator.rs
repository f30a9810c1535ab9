//! Orchestrator tests.
//!
//! Covers: envelope validation, NEW_ORDER idempotency, queueing with
//! standby recommendation when the fleet is empty, overload
//! backpressure, per-event deadlines, and system-state transitions.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use dispatch_core::clock::ManualClock;
use dispatch_core::config::CoreConfig;
use dispatch_core::error::CoreResult;
use dispatch_core::event::{DecisionAction, EventEnvelope};
use dispatch_core::geo::haversine_km;
use dispatch_core::orchestrator::{SlaRisk, SystemMode};
use dispatch_core::ports::{DriverRepository, OrderRepository, RouteLeg, Router};
use dispatch_core::system::{DispatchCore, InMemoryCore};
use dispatch_core::types::{
    Driver, DriverStatus, Location, Order, OrderStatus, ServiceType, VehicleType,
};
use std::sync::Arc;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn build() -> (Arc<ManualClock>, InMemoryCore) {
    build_with(CoreConfig::default(), None)
}

fn build_with(
    config: CoreConfig,
    router: Option<Arc<dyn Router>>,
) -> (Arc<ManualClock>, InMemoryCore) {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let system = DispatchCore::build_in_memory(config, clock.clone(), router, None);
    (clock, system)
}

fn driver(id: &str) -> Driver {
    Driver {
        id: id.into(),
        vehicle_type: VehicleType::Van,
        status: DriverStatus::Available,
        location: Location::new(24.710, 46.671),
        location_at: t0(),
        active_order_ids: Vec::new(),
        active_express: 0,
        active_standard: 0,
        continuous_minutes: 60.0,
        orders_today: 0,
        last_break_at: Some(t0() - Duration::minutes(30)),
        battery: 100,
        rating: 4.8,
        express_success_rate: 0.95,
        estimated_completion_at: None,
    }
}

fn order(id: &str, service: ServiceType) -> Order {
    Order {
        id: id.into(),
        service_type: service,
        status: OrderStatus::Pending,
        created_at: t0(),
        promised_at: t0() + Duration::minutes(service.sla_minutes()),
        pickup: Location::new(24.71, 46.67),
        delivery: Location::new(24.72, 46.68),
        priority: 5,
        assigned_driver_id: None,
        priority_boost: None,
        delivery_attempts: 0,
        leave_at_door: false,
        sla_notified: false,
        delay_notified: false,
        delivered_at: None,
    }
}

fn envelope(kind: &str, order_id: Option<&str>) -> EventEnvelope {
    EventEnvelope {
        kind: kind.into(),
        order_id: order_id.map(str::to_string),
        driver_id: None,
        service_type: None,
        payload: serde_json::Value::Null,
        deadline_ms: None,
    }
}

#[tokio::test]
async fn unknown_event_queues() {
    let (_clock, system) = build();
    let decision = system.core.orchestrator.handle(envelope("SOLAR_FLARE", None)).await;
    assert_eq!(decision.action, DecisionAction::Queued);
    assert!(decision.risks.iter().any(|r| r == "UNKNOWN_EVENT"));
}

#[tokio::test]
async fn invalid_event_fails_immediately() {
    let (_clock, system) = build();
    let decision = system.core.orchestrator.handle(envelope("NEW_ORDER", None)).await;
    assert_eq!(decision.action, DecisionAction::Failed);
    assert!(decision.risks.iter().any(|r| r.starts_with("INVALID_EVENT")));
    assert!(decision.requires_manual_intervention);
}

/// A replayed NEW_ORDER answers with the recorded decision: same
/// driver, no double assignment.
#[tokio::test]
async fn new_order_is_idempotent() {
    let (_clock, system) = build();
    system.drivers.insert(driver("d1")).await.unwrap();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();

    let first = system.core.orchestrator.handle(envelope("NEW_ORDER", Some("o1"))).await;
    let second = system.core.orchestrator.handle(envelope("NEW_ORDER", Some("o1"))).await;

    assert_eq!(first.action, DecisionAction::Assigned);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap(),
        "replay must return the recorded decision"
    );
    let d1 = system.drivers.get_by_id("d1").await.unwrap().unwrap();
    assert_eq!(
        d1.active_order_ids.iter().filter(|id| *id == "o1").count(),
        1,
        "no double attach on replay"
    );
}

/// Ten express orders, zero drivers: every decision queues and
/// recommends standby activation.
#[tokio::test]
async fn no_drivers_queues_with_standby_recommendation() {
    let (_clock, system) = build();
    for i in 0..10 {
        let id = format!("o{i}");
        system.orders.insert(order(&id, ServiceType::Express)).await.unwrap();
        let decision =
            system.core.orchestrator.handle(envelope("NEW_ORDER", Some(&id))).await;
        assert_eq!(decision.action, DecisionAction::Queued);
        assert!(
            decision.recommendations.iter().any(|r| r == "ACTIVATE_STANDBY_DRIVERS"),
            "recommendations: {:?}",
            decision.recommendations
        );
        assert!(decision.risks.iter().any(|r| r == "NO_DRIVER_AVAILABLE"));
    }
}

// A router slow enough to keep events in flight.
struct SlowRouter {
    delay: std::time::Duration,
}

#[async_trait]
impl Router for SlowRouter {
    async fn route(&self, from: Location, to: Location) -> CoreResult<RouteLeg> {
        tokio::time::sleep(self.delay).await;
        let distance_km = haversine_km(from, to);
        Ok(RouteLeg { distance_km, duration_min: distance_km * 3.0, geometry: None })
    }
}

/// Concurrent flood past the inflight cap: overflow queues with an
/// OVERLOAD risk and nothing escalates to FAILED.
#[tokio::test]
async fn overload_backpressure() {
    let mut config = CoreConfig::default();
    config.orchestrator.inflight_max = 8;
    let (_clock, system) = build_with(
        config,
        Some(Arc::new(SlowRouter { delay: std::time::Duration::from_millis(150) })),
    );
    for i in 0..3 {
        system.drivers.insert(driver(&format!("d{i}"))).await.unwrap();
    }
    for i in 0..64 {
        system
            .orders
            .insert(order(&format!("o{i}"), ServiceType::Standard))
            .await
            .unwrap();
    }

    let orchestrator = system.core.orchestrator.clone();
    let mut joins = Vec::new();
    for i in 0..64 {
        let orchestrator = orchestrator.clone();
        joins.push(tokio::spawn(async move {
            orchestrator.handle(envelope("NEW_ORDER", Some(&format!("o{i}")))).await
        }));
    }

    let mut overloaded = 0;
    for join in joins {
        let decision = join.await.unwrap();
        assert_ne!(decision.action, DecisionAction::Failed, "risks: {:?}", decision.risks);
        assert_ne!(decision.action, DecisionAction::EmergencyQueue);
        if decision.risks.iter().any(|r| r == "OVERLOAD") {
            overloaded += 1;
        }
    }
    assert!(overloaded >= 1, "expected overflow refusals past the inflight cap");
}

/// An explicit 1 ms deadline on a slow route: QUEUED with a timeout
/// risk, not an error.
#[tokio::test]
async fn deadline_timeout_queues() {
    let (_clock, system) = build_with(
        CoreConfig::default(),
        Some(Arc::new(SlowRouter { delay: std::time::Duration::from_millis(300) })),
    );
    system.drivers.insert(driver("d1")).await.unwrap();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();

    let mut event = envelope("NEW_ORDER", Some("o1"));
    event.deadline_ms = Some(1);
    let decision = system.core.orchestrator.handle(event).await;
    assert_eq!(decision.action, DecisionAction::Queued);
    assert!(decision.risks.iter().any(|r| r == "timeout"));
}

/// More than 30 active express orders flips the system into peak mode.
#[tokio::test]
async fn peak_mode_on_express_volume() {
    let (_clock, system) = build();
    for i in 0..31 {
        let id = format!("o{i}");
        system.orders.insert(order(&id, ServiceType::Express)).await.unwrap();
        system.core.orchestrator.handle(envelope("NEW_ORDER", Some(&id))).await;
    }
    assert_eq!(system.core.orchestrator.state().mode, SystemMode::Peak);
}

/// An offline driver strands its orders; recovery reassigns them to
/// whoever is left.
#[tokio::test]
async fn offline_driver_orders_are_recovered() {
    let (_clock, system) = build();
    system.drivers.insert(driver("d1")).await.unwrap();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();
    let first = system.core.orchestrator.handle(envelope("NEW_ORDER", Some("o1"))).await;
    assert_eq!(first.driver_id.as_deref(), Some("d1"));

    system.drivers.insert(driver("d2")).await.unwrap();
    system
        .drivers
        .update_status("d1", DriverStatus::Offline)
        .await
        .unwrap();

    let mut event = envelope("DRIVER_STATUS_CHANGE", None);
    event.driver_id = Some("d1".into());
    event.payload = serde_json::json!({ "new_status": "OFFLINE" });
    let decision = system.core.orchestrator.handle(event).await;

    let stored = system.orders.get_by_id("o1").await.unwrap().unwrap();
    assert_eq!(
        stored.assigned_driver_id.as_deref(),
        Some("d2"),
        "risks: {:?}",
        decision.risks
    );
    let d1 = system.drivers.get_by_id("d1").await.unwrap().unwrap();
    assert!(!d1.active_order_ids.contains(&"o1".to_string()));
}

/// A batch pass over pending standard orders recommends consolidation
/// and previews a route.
#[tokio::test]
async fn batch_event_recommends_consolidation() {
    let (_clock, system) = build();
    for i in 0..4 {
        system
            .orders
            .insert(order(&format!("b{i}"), ServiceType::Standard))
            .await
            .unwrap();
    }
    let decision = system.core.orchestrator.handle(envelope("BATCH_OPTIMIZATION", None)).await;
    assert_eq!(decision.action, DecisionAction::Queued);
    assert!(
        decision.recommendations.iter().any(|r| r.starts_with("CONSOLIDATE_BATCHES")),
        "recommendations: {:?}",
        decision.recommendations
    );
}

/// SLA risk goes high on a warning and decays after a full quiet tick.
#[tokio::test]
async fn sla_risk_decays_without_warnings() {
    let (_clock, system) = build();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();
    system.core.orchestrator.handle(envelope("SLA_WARNING", Some("o1"))).await;
    assert_eq!(system.core.orchestrator.state().sla_risk, SlaRisk::High);

    // First decay tick observes the warning flag; the second is quiet.
    system.core.orchestrator.decay_sla_risk();
    assert_eq!(system.core.orchestrator.state().sla_risk, SlaRisk::High);
    system.core.orchestrator.decay_sla_risk();
    assert_eq!(system.core.orchestrator.state().sla_risk, SlaRisk::Normal);
}
