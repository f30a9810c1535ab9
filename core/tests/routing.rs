//! Route engine tests.
//!
//! Covers: fallback totality when the router is down, route structural
//! invariants, cache behaviour, genetic-search determinism, mixed
//! express/standard sequencing, and oracle absence handling.

use chrono::{Duration, TimeZone, Utc};
use dispatch_core::clock::ManualClock;
use dispatch_core::config::CoreConfig;
use dispatch_core::context::TrafficLevel;
use dispatch_core::geo::haversine_km;
use dispatch_core::route::{RouteQuality, StopKind};
use dispatch_core::route_engine::OptimizeRequest;
use dispatch_core::store::{FailingRouter, FixedOracle};
use dispatch_core::system::{DispatchCore, InMemoryCore};
use dispatch_core::types::{Location, Order, OrderStatus, ServiceType};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn build() -> (Arc<ManualClock>, InMemoryCore) {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let system = DispatchCore::build_in_memory(CoreConfig::default(), clock.clone(), None, None);
    (clock, system)
}

fn order(id: &str, service: ServiceType, pickup: Location, delivery: Location) -> Order {
    Order {
        id: id.into(),
        service_type: service,
        status: OrderStatus::Pending,
        created_at: t0(),
        promised_at: t0() + Duration::minutes(service.sla_minutes()),
        pickup,
        delivery,
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

fn request(orders: Vec<Order>) -> OptimizeRequest {
    OptimizeRequest {
        driver_id: "d1".into(),
        start: Location::new(24.705, 46.665),
        orders,
        traffic: TrafficLevel::Light,
        cancel: CancellationToken::new(),
    }
}

/// Router down on every call: quality=fallback, totals are the
/// Haversine sums, duration = distance × 3.
#[tokio::test]
async fn fallback_when_router_is_down() {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let system = DispatchCore::build_in_memory(
        CoreConfig::default(),
        clock,
        Some(Arc::new(FailingRouter)),
        None,
    );

    let req = request(vec![order(
        "o1",
        ServiceType::Express,
        Location::new(24.71, 46.67),
        Location::new(24.72, 46.68),
    )]);
    let route = system.core.agents.routes.optimize(&req).await;

    assert_eq!(route.quality, RouteQuality::Fallback);
    assert_eq!(route.stops.len(), 3);

    let expected: f64 = haversine_km(req.start, Location::new(24.71, 46.67))
        + haversine_km(Location::new(24.71, 46.67), Location::new(24.72, 46.68));
    assert!((route.total_distance_km - expected).abs() < 1e-9);
    assert!((route.total_duration_min - route.total_distance_km * 3.0).abs() < 1e-9);
    assert!(route.check_invariants().is_none());
}

/// Segment sums and arrival monotonicity hold on the normal path too.
#[tokio::test]
async fn route_invariants_hold() {
    let (_clock, system) = build();
    let req = request(vec![
        order("a", ServiceType::Express, Location::new(24.71, 46.67), Location::new(24.72, 46.68)),
        order("b", ServiceType::Express, Location::new(24.70, 46.66), Location::new(24.69, 46.65)),
    ]);
    let route = system.core.agents.routes.optimize(&req).await;

    assert!(route.check_invariants().is_none(), "{:?}", route.check_invariants());
    assert_eq!(route.stops.len(), 5);
    assert_eq!(route.stops[0].kind, StopKind::Start);
    let segment_sum: f64 = route.segments.iter().map(|s| s.distance_km).sum();
    assert!((segment_sum - route.total_distance_km).abs() < 1e-6);
}

/// The second identical request answers from the cache.
#[tokio::test]
async fn cache_returns_cached_quality() {
    let (_clock, system) = build();
    let req = request(vec![order(
        "o1",
        ServiceType::Express,
        Location::new(24.71, 46.67),
        Location::new(24.72, 46.68),
    )]);

    let first = system.core.agents.routes.optimize(&req).await;
    assert_ne!(first.quality, RouteQuality::Cached);

    let second = system.core.agents.routes.optimize(&req).await;
    assert_eq!(second.quality, RouteQuality::Cached);
    assert_eq!(second.stops.len(), first.stops.len());
    assert!((second.total_distance_km - first.total_distance_km).abs() < 1e-9);
}

/// Same genetic seed, same input, same tour — across separately built
/// engines.
#[tokio::test]
async fn genetic_route_is_deterministic() {
    let standard_orders = || {
        vec![
            order("s1", ServiceType::Standard, Location::new(24.72, 46.68), Location::new(24.73, 46.69)),
            order("s2", ServiceType::Standard, Location::new(24.70, 46.66), Location::new(24.69, 46.65)),
            order("s3", ServiceType::Standard, Location::new(24.75, 46.70), Location::new(24.76, 46.71)),
            order("s4", ServiceType::Standard, Location::new(24.68, 46.64), Location::new(24.67, 46.63)),
            order("s5", ServiceType::Standard, Location::new(24.74, 46.66), Location::new(24.73, 46.65)),
        ]
    };

    let (_clock_a, system_a) = build();
    let (_clock_b, system_b) = build();
    let route_a = system_a.core.agents.routes.optimize(&request(standard_orders())).await;
    let route_b = system_b.core.agents.routes.optimize(&request(standard_orders())).await;

    let ids_a: Vec<_> = route_a.stops.iter().map(|s| s.id.clone()).collect();
    let ids_b: Vec<_> = route_b.stops.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids_a, ids_b);
    assert!((route_a.total_distance_km - route_b.total_distance_km).abs() < 1e-9);
}

/// Mixed load: express stops first-class, standard pairs inserted
/// adjacently, pickups always before their deliveries.
#[tokio::test]
async fn mixed_load_respects_precedence() {
    let (_clock, system) = build();
    let req = request(vec![
        order("e1", ServiceType::Express, Location::new(24.71, 46.67), Location::new(24.72, 46.68)),
        order("e2", ServiceType::Express, Location::new(24.70, 46.66), Location::new(24.69, 46.65)),
        order("s1", ServiceType::Standard, Location::new(24.73, 46.69), Location::new(24.74, 46.70)),
    ]);
    let route = system.core.agents.routes.optimize(&req).await;

    assert_eq!(route.stops.len(), 7);
    for id in ["e1", "e2", "s1"] {
        let pickup = route.stops.iter().position(|s| s.id == format!("p-{id}")).unwrap();
        let delivery = route.stops.iter().position(|s| s.id == format!("d-{id}")).unwrap();
        assert!(pickup < delivery, "{id}: pickup after delivery");
    }
    // The standard pair travels together.
    let sp = route.stops.iter().position(|s| s.id == "p-s1").unwrap();
    let sd = route.stops.iter().position(|s| s.id == "d-s1").unwrap();
    assert_eq!(sd, sp + 1);
    assert!(route.check_invariants().is_none());
}

/// Oracle failure is absence, never an error.
#[tokio::test]
async fn oracle_failure_is_nonfatal() {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let system = DispatchCore::build_in_memory(
        CoreConfig::default(),
        clock,
        None,
        Some(Arc::new(FixedOracle { ordering: None })),
    );
    let req = request(vec![order(
        "o1",
        ServiceType::Express,
        Location::new(24.71, 46.67),
        Location::new(24.72, 46.68),
    )]);
    let route = system.core.agents.routes.optimize(&req).await;
    assert_ne!(route.quality, RouteQuality::Fallback);
    assert_eq!(route.stops.len(), 3);
}

/// An oracle echoing the baseline ordering changes nothing.
#[tokio::test]
async fn identity_oracle_keeps_baseline() {
    let clock = Arc::new(ManualClock::starting_at(t0()));
    let with_oracle = DispatchCore::build_in_memory(
        CoreConfig::default(),
        clock.clone(),
        None,
        Some(Arc::new(FixedOracle { ordering: Some(vec![0, 1]) })),
    );
    let without_oracle =
        DispatchCore::build_in_memory(CoreConfig::default(), clock, None, None);

    let make = || {
        request(vec![order(
            "o1",
            ServiceType::Express,
            Location::new(24.71, 46.67),
            Location::new(24.72, 46.68),
        )])
    };
    let a = with_oracle.core.agents.routes.optimize(&make()).await;
    let b = without_oracle.core.agents.routes.optimize(&make()).await;
    let ids_a: Vec<_> = a.stops.iter().map(|s| s.id.clone()).collect();
    let ids_b: Vec<_> = b.stops.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids_a, ids_b);
}
