//! dispatch-runner: headless runner for the dispatch decision core.
//!
//! Usage:
//!   dispatch-runner --scenario happy --seed 42 --orders 5
//!   dispatch-runner --scenario surge --orders 40
//!   dispatch-runner --scenario breach
//!
//! Wires the core to its in-memory adapters, replays a scripted
//! scenario of events, prints one JSON line per decision and an
//! end-of-run summary.

use anyhow::Result;
use chrono::{Duration, Utc};
use dispatch_core::clock::ManualClock;
use dispatch_core::config::CoreConfig;
use dispatch_core::event::EventEnvelope;
use dispatch_core::rng::{CoreRng, RngStream};
use dispatch_core::system::{DispatchCore, InMemoryCore};
use dispatch_core::types::{
    Driver, DriverStatus, Location, Order, OrderStatus, ServiceType, VehicleType,
};
use std::env;
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let scenario = arg_value(&args, "--scenario").unwrap_or_else(|| "happy".to_string());
    let seed: u64 = arg_value(&args, "--seed").and_then(|v| v.parse().ok()).unwrap_or(42);
    let orders: usize = arg_value(&args, "--orders").and_then(|v| v.parse().ok()).unwrap_or(5);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(&scenario, seed, orders))
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

async fn run(scenario: &str, seed: u64, order_count: usize) -> Result<()> {
    let clock = Arc::new(ManualClock::starting_at(Utc::now()));
    let mut config = CoreConfig::default();
    config.route.genetic.seed = seed;
    let system = DispatchCore::build_in_memory(config, clock.clone(), None, None);

    let mut rng = CoreRng::for_stream(seed, RngStream::Scenario);
    match scenario {
        "happy" => happy_path(&system, &mut rng, order_count).await?,
        "surge" => surge(&system, &mut rng, order_count).await?,
        "breach" => breach(&system, &clock, &mut rng).await?,
        other => anyhow::bail!("unknown scenario '{other}' (happy|surge|breach)"),
    }

    summary(&system).await?;
    Ok(())
}

/// Drivers spread around the city centre, orders flowing in, everything
/// assignable.
async fn happy_path(system: &InMemoryCore, rng: &mut CoreRng, orders: usize) -> Result<()> {
    seed_drivers(system, rng, orders.max(3)).await?;
    for i in 0..orders {
        let service =
            if i % 3 == 0 { ServiceType::Standard } else { ServiceType::Express };
        submit_order(system, rng, &format!("o-{i}"), service).await?;
    }
    Ok(())
}

/// Demand far beyond the fleet: most decisions queue.
async fn surge(system: &InMemoryCore, rng: &mut CoreRng, orders: usize) -> Result<()> {
    seed_drivers(system, rng, 2).await?;
    for i in 0..orders {
        submit_order(system, rng, &format!("o-{i}"), ServiceType::Express).await?;
    }
    Ok(())
}

/// One express order delivered 15 minutes past the window.
async fn breach(system: &InMemoryCore, clock: &Arc<ManualClock>, rng: &mut CoreRng) -> Result<()> {
    seed_drivers(system, rng, 1).await?;
    submit_order(system, rng, "o-late", ServiceType::Express).await?;
    clock.advance_minutes(75);
    let decision = system
        .core
        .orchestrator
        .handle(EventEnvelope {
            kind: "ORDER_COMPLETED".into(),
            order_id: Some("o-late".into()),
            driver_id: None,
            service_type: None,
            payload: serde_json::Value::Null,
            deadline_ms: None,
        })
        .await;
    println!("{}", serde_json::to_string(&decision)?);
    Ok(())
}

async fn seed_drivers(system: &InMemoryCore, rng: &mut CoreRng, count: usize) -> Result<()> {
    use dispatch_core::ports::DriverRepository;
    let now = system.core.clock.now();
    for i in 0..count {
        let vehicle = match i % 3 {
            0 => VehicleType::Bike,
            1 => VehicleType::Car,
            _ => VehicleType::Van,
        };
        system
            .drivers
            .insert(Driver {
                id: format!("d-{i}"),
                vehicle_type: vehicle,
                status: DriverStatus::Available,
                location: jitter_location(rng, Location::new(24.71, 46.67)),
                location_at: now,
                active_order_ids: Vec::new(),
                active_express: 0,
                active_standard: 0,
                continuous_minutes: rng.below(200) as f64,
                orders_today: rng.below(10) as u32,
                last_break_at: Some(now - Duration::minutes(rng.below(120) as i64)),
                battery: 60 + rng.below(40) as u8,
                rating: 4.0 + rng.next_f64(),
                express_success_rate: 0.9 + rng.next_f64() * 0.1,
                estimated_completion_at: None,
            })
            .await?;
    }
    Ok(())
}

async fn submit_order(
    system: &InMemoryCore,
    rng: &mut CoreRng,
    id: &str,
    service: ServiceType,
) -> Result<()> {
    use dispatch_core::ports::OrderRepository;
    let now = system.core.clock.now();
    let pickup = jitter_location(rng, Location::new(24.71, 46.67));
    let delivery = jitter_location(rng, Location::new(24.72, 46.68));
    system
        .orders
        .insert(Order {
            id: id.to_string(),
            service_type: service,
            status: OrderStatus::Pending,
            created_at: now,
            promised_at: now + Duration::minutes(service.sla_minutes()),
            pickup,
            delivery,
            priority: 1 + rng.below(10) as u8,
            assigned_driver_id: None,
            priority_boost: None,
            delivery_attempts: 0,
            leave_at_door: rng.chance(0.3),
            sla_notified: false,
            delay_notified: false,
            delivered_at: None,
        })
        .await?;

    let decision = system
        .core
        .orchestrator
        .handle(EventEnvelope {
            kind: "NEW_ORDER".into(),
            order_id: Some(id.to_string()),
            driver_id: None,
            service_type: Some(service),
            payload: serde_json::Value::Null,
            deadline_ms: None,
        })
        .await;
    println!("{}", serde_json::to_string(&decision)?);
    Ok(())
}

fn jitter_location(rng: &mut CoreRng, base: Location) -> Location {
    Location::new(
        base.lat + (rng.next_f64() - 0.5) * 0.04,
        base.lng + (rng.next_f64() - 0.5) * 0.04,
    )
}

async fn summary(system: &InMemoryCore) -> Result<()> {
    use dispatch_core::ports::ActivityRepository;
    let state = system.core.orchestrator.state();
    let breaches = system.core.agents.sla.breach_history();
    let recent = system.activities.recent(10).await?;

    println!("--- summary ---");
    println!("{}", serde_json::to_string(&state)?);
    println!("breaches: {}", breaches.len());
    for record in recent {
        println!(
            "{} {:?} order={} detail={}",
            record.at.to_rfc3339(),
            record.kind,
            record.order_id.as_deref().unwrap_or("-"),
            record.detail
        );
    }
    Ok(())
}
