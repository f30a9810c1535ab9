//! SLA monitor tests.
//!
//! Covers: threshold categories and actions per band, breach
//! compensation at completion (amount, exactly-once), the suppression
//! window across ticks, the monotonic category floor, the autonomous
//! trigger, and tick survival when the order port is down.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use dispatch_core::clock::ManualClock;
use dispatch_core::config::CoreConfig;
use dispatch_core::error::{CoreError, CoreResult};
use dispatch_core::event::{ActionPriority, ActionType, EventEnvelope};
use dispatch_core::notify::NotificationPolicy;
use dispatch_core::ports::{
    OrderFilter, OrderPatch, OrderRepository,
};
use dispatch_core::sla_monitor::{SlaCategory, SlaMonitor};
use dispatch_core::store::{
    InMemoryActivities, InMemoryAutonomousActions, RecordingAutonomousPort, RecordingNotifier,
};
use dispatch_core::system::{DispatchCore, InMemoryCore};
use dispatch_core::types::{Location, Order, OrderStatus, ServiceType};
use std::sync::Arc;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn build() -> (Arc<ManualClock>, InMemoryCore) {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let system = DispatchCore::build_in_memory(CoreConfig::default(), clock.clone(), None, None);
    (clock, system)
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

/// At T+41 every pending express order is a warning: one optimize_route
/// per order, suppressed to exactly one across back-to-back ticks.
#[tokio::test]
async fn warning_actions_suppressed_across_ticks() {
    let (clock, system) = build();
    for i in 0..10 {
        system.orders.insert(order(&format!("o{i}"), ServiceType::Express)).await.unwrap();
    }

    clock.advance_minutes(41);
    let first = system.core.agents.sla.tick().await;
    let optimizes = first
        .actions
        .iter()
        .filter(|a| a.action_type == ActionType::OptimizeRoute)
        .count();
    assert_eq!(optimizes, 10, "one optimize_route per warning order");
    assert_eq!(first.warning, 10);

    clock.advance_minutes(1);
    let second = system.core.agents.sla.tick().await;
    let optimizes = second
        .actions
        .iter()
        .filter(|a| a.action_type == ActionType::OptimizeRoute)
        .count();
    assert_eq!(optimizes, 0, "suppression window holds");
}

/// Critical with an unreachable window demands an immediate emergency
/// reassignment plus a supervisor alert.
#[tokio::test]
async fn critical_unreachable_demands_reassignment() {
    let (clock, system) = build();
    let mut o = order("o1", ServiceType::Express);
    o.status = OrderStatus::Assigned;
    o.assigned_driver_id = Some("d1".into());
    system.orders.insert(o).await.unwrap();

    clock.advance_minutes(51);
    let stored = system.orders.get_by_id("o1").await.unwrap().unwrap();
    let (status, actions) = system.core.agents.sla.assess(&stored).await.unwrap();

    assert_eq!(status.category, SlaCategory::Critical);
    assert!(!status.can_meet_sla);
    let reassign = actions
        .iter()
        .find(|a| a.action_type == ActionType::EmergencyReassignment)
        .expect("emergency reassignment expected");
    assert!(reassign.immediate);
    assert_eq!(reassign.priority, ActionPriority::Critical);
    assert!(actions.iter().any(|a| a.action_type == ActionType::SupervisorAlert));
}

/// EXPRESS delivered at T+75: exactly one compensation of
/// min(200, 15×10) = 150, one incident report, breach recorded with
/// exceed_minutes = 15.
#[tokio::test]
async fn breach_compensation_on_completion() {
    let (clock, system) = build();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();

    clock.advance_minutes(75);
    let decision = system
        .core
        .orchestrator
        .handle(EventEnvelope {
            kind: "ORDER_COMPLETED".into(),
            order_id: Some("o1".into()),
            driver_id: None,
            service_type: None,
            payload: serde_json::Value::Null,
            deadline_ms: None,
        })
        .await;
    assert!(decision.risks.iter().any(|r| r == "SLA_BREACHED"));

    let history = system.core.agents.sla.breach_history();
    assert_eq!(history.len(), 1);
    assert!((history[0].exceed_minutes - 15.0).abs() < 1e-6);
    assert!((history[0].compensation - 150.0).abs() < 1e-6);

    // Replay: already settled, still exactly one breach record.
    let replay = system
        .core
        .orchestrator
        .handle(EventEnvelope {
            kind: "ORDER_COMPLETED".into(),
            order_id: Some("o1".into()),
            driver_id: None,
            service_type: None,
            payload: serde_json::Value::Null,
            deadline_ms: None,
        })
        .await;
    assert!(replay.risks.iter().any(|r| r == "ALREADY_SETTLED"));
    assert_eq!(system.core.agents.sla.breach_history().len(), 1);

    // The customer heard about it exactly once, through a critical SMS.
    let sms: Vec<_> = system
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.channel == "sms" && n.to == "customer:o1")
        .collect();
    assert_eq!(sms.len(), 1);
}

/// Compensation is capped at 200 however late the order runs.
#[tokio::test]
async fn breach_compensation_caps() {
    let (clock, system) = build();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();

    clock.advance_minutes(60 + 300); // five hours late
    system
        .core
        .orchestrator
        .handle(EventEnvelope {
            kind: "ORDER_COMPLETED".into(),
            order_id: Some("o1".into()),
            driver_id: None,
            service_type: None,
            payload: serde_json::Value::Null,
            deadline_ms: None,
        })
        .await;
    let history = system.core.agents.sla.breach_history();
    assert_eq!(history.len(), 1);
    assert!((history[0].compensation - 200.0).abs() < 1e-6);
}

/// The category floor never regresses while the order is in flight,
/// even when the forecast improves.
#[tokio::test]
async fn category_floor_is_monotonic() {
    let (clock, system) = build();
    // Assigned order with a very long delivery leg: the forecast alone
    // grades as breached.
    let mut o = order("o1", ServiceType::Express);
    o.status = OrderStatus::Assigned;
    o.assigned_driver_id = Some("d1".into());
    o.delivery = Location::new(24.71, 46.97); // ~30 km east
    system.orders.insert(o).await.unwrap();

    clock.advance_minutes(10);
    let stored = system.orders.get_by_id("o1").await.unwrap().unwrap();
    let status = system.core.agents.sla.status_for(&stored);
    assert_eq!(status.category, SlaCategory::Breached, "forecast-driven breach");

    // Handoff starts: the forecast drops sharply, the category must not.
    let updated = system
        .orders
        .update_status("o1", OrderStatus::DeliveryInProgress, OrderPatch::default())
        .await
        .unwrap();
    clock.advance_minutes(1);
    let status = system.core.agents.sla.status_for(&updated);
    assert_eq!(status.category, SlaCategory::Breached, "category floor held");
}

/// A breached pass publishes a critical autonomous directive and writes
/// the ledger.
#[tokio::test]
async fn autonomous_trigger_on_breach() {
    let (clock, system) = build();
    system.orders.insert(order("o1", ServiceType::Express)).await.unwrap();

    clock.advance_minutes(61);
    let snapshot = system.core.agents.sla.tick().await;
    assert_eq!(snapshot.breached, 1);

    let triggers = system.autonomous.triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].source, "sla-monitor");
    assert_eq!(triggers[0].priority, ActionPriority::Critical);

    use dispatch_core::ports::AutonomousActionRepository;
    let ledger = system.autonomous_log.recent(10).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].reason, "sla_breaches_detected");
}

// ── Monitor survives a dead order port ───────────────────────────────────────

struct DeadOrders;

#[async_trait]
impl OrderRepository for DeadOrders {
    async fn get_active(&self, _filter: OrderFilter) -> CoreResult<Vec<Order>> {
        Err(CoreError::transient("orders", "connection refused"))
    }

    async fn get_by_id(&self, _id: &str) -> CoreResult<Option<Order>> {
        Err(CoreError::transient("orders", "connection refused"))
    }

    async fn insert(&self, _order: Order) -> CoreResult<()> {
        Err(CoreError::transient("orders", "connection refused"))
    }

    async fn update_status(
        &self,
        _id: &str,
        _new_status: OrderStatus,
        _patch: OrderPatch,
    ) -> CoreResult<Order> {
        Err(CoreError::transient("orders", "connection refused"))
    }

    async fn cas_assigned_driver(
        &self,
        _id: &str,
        _expected: Option<&str>,
        _next: Option<&str>,
    ) -> CoreResult<bool> {
        Err(CoreError::transient("orders", "connection refused"))
    }
}

/// The tick loop retries, then yields an empty snapshot — never an
/// error, never a panic.
#[tokio::test]
async fn tick_survives_dead_order_port() {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let config = Arc::new(CoreConfig::default());
    let notifier = Arc::new(RecordingNotifier::new());
    let policy = Arc::new(NotificationPolicy::new(
        notifier,
        config.channels,
        config.quiet_hours,
        clock.clone(),
    ));
    let monitor = SlaMonitor::new(
        Arc::new(DeadOrders),
        Arc::new(InMemoryActivities::new()),
        Arc::new(InMemoryAutonomousActions::new()),
        Arc::new(RecordingAutonomousPort::new()),
        policy,
        config,
        clock,
    );

    let snapshot = monitor.tick().await;
    assert!(snapshot.statuses.is_empty());
    assert!(snapshot.actions.is_empty());
    assert_eq!(snapshot.breached, 0);
}
