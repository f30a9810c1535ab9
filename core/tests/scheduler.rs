//! Scheduler tests — the periodic loops drive the SLA monitor and the
//! escalation checker, and shut down cleanly on cancellation.

use chrono::{Duration, TimeZone, Utc};
use dispatch_core::clock::ManualClock;
use dispatch_core::config::CoreConfig;
use dispatch_core::ports::OrderRepository;
use dispatch_core::scheduler::Scheduler;
use dispatch_core::system::DispatchCore;
use dispatch_core::types::{Location, Order, OrderStatus, ServiceType};
use std::sync::Arc;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn order(id: &str) -> Order {
    Order {
        id: id.into(),
        service_type: ServiceType::Express,
        status: OrderStatus::Pending,
        created_at: t0(),
        promised_at: t0() + Duration::minutes(60),
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

/// One second of scheduler time runs an SLA pass over a breached order:
/// the autonomous directive fires and the pass survives shutdown.
#[tokio::test]
async fn sla_loop_runs_and_shuts_down() {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let mut config = CoreConfig::default();
    config.scheduler.sla_tick_secs = 1;
    config.scheduler.fleet_tick_secs = 1;
    config.scheduler.escalation_tick_secs = 1;
    let system = DispatchCore::build_in_memory(config, clock.clone(), None, None);

    system.orders.insert(order("o-late")).await.unwrap();
    clock.advance_minutes(61); // already breached when the loop starts

    let handle = Scheduler::new(
        system.core.orchestrator.clone(),
        system.core.agents.clone(),
        system.core.policy.clone(),
    )
    .start();

    tokio::time::sleep(std::time::Duration::from_millis(1_600)).await;
    handle.shutdown();
    handle.join().await;

    let triggers = system.autonomous.triggers();
    assert!(!triggers.is_empty(), "sla pass should publish a directive");
    assert_eq!(triggers[0].source, "sla-monitor");
    assert_eq!(system.core.agents.sla.breach_history().len(), 1, "one pass, one breach record");
}
