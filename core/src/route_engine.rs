//! Route optimization engine.
//!
//! Algorithm selection:
//!   - EXPRESS only  → nearest-neighbour under detour/time constraints
//!   - STANDARD only → genetic search over visit sequences
//!   - mixed         → nearest-neighbour over EXPRESS stops, then
//!                     cheapest-insertion of STANDARD stops
//!
//! Segments go through the Router port; a failed segment falls back to
//! Haversine distance at 3 min/km. The engine itself is total: any
//! internal error produces a `quality = fallback` route with the stops
//! in input order — it never throws.

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::context::TrafficLevel;
use crate::error::{CoreError, CoreResult};
use crate::genetic::{self, VisitPair};
use crate::geo::{fallback_minutes, haversine_km};
use crate::ports::{RouteOracle, Router};
use crate::route::{grade, Route, RouteQuality, Segment, Stop, StopKind};
use crate::route_cache::RouteCache;
use crate::types::{DriverId, Location, Order, OrderId, ServiceType};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handling time at pickup and delivery stops, minutes.
const STOP_SERVICE_MIN: f64 = 5.0;

#[derive(Debug, Clone)]
struct StopSpec {
    id:       String,
    kind:     StopKind,
    location: Location,
    order_id: OrderId,
    priority: u8,
}

pub struct OptimizeRequest {
    pub driver_id: DriverId,
    pub start:     Location,
    pub orders:    Vec<Order>,
    pub traffic:   TrafficLevel,
    pub cancel:    CancellationToken,
}

pub struct RouteEngine {
    router: Arc<dyn Router>,
    oracle: Option<Arc<dyn RouteOracle>>,
    cache:  RouteCache,
    config: Arc<CoreConfig>,
    clock:  Arc<dyn Clock>,
}

impl RouteEngine {
    pub fn new(
        router: Arc<dyn Router>,
        oracle: Option<Arc<dyn RouteOracle>>,
        config: Arc<CoreConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = RouteCache::new(
            clock.clone(),
            config.route.cache_ttl_ms,
            config.route.cache_max_entries,
        );
        Self { router, oracle, cache, config, clock }
    }

    /// Optimize a route for one driver over a set of orders. Total:
    /// always returns a Route with a quality set.
    pub async fn optimize(&self, request: &OptimizeRequest) -> Route {
        if request.orders.is_empty() {
            return self.fallback_route(request);
        }

        let stop_ids = stop_ids(&request.orders);
        let key = RouteCache::key(request.start, &stop_ids);
        if let Some(cached) = self.cache.get(&key) {
            log::debug!("route cache hit for driver {}", request.driver_id);
            return cached;
        }

        match self.try_optimize(request).await {
            Ok(route) => {
                self.cache.put(key, route.clone());
                route
            }
            Err(err) => {
                log::warn!(
                    "route optimization failed for driver {}, using fallback: {err}",
                    request.driver_id
                );
                self.fallback_route(request)
            }
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    async fn try_optimize(&self, request: &OptimizeRequest) -> CoreResult<Route> {
        let express: Vec<&Order> = request
            .orders
            .iter()
            .filter(|o| o.service_type == ServiceType::Express)
            .collect();
        let standard: Vec<&Order> = request
            .orders
            .iter()
            .filter(|o| o.service_type == ServiceType::Standard)
            .collect();

        let specs = if standard.is_empty() {
            let nn = nearest_neighbour(request.start, &express, self.config.route.max_detour_km);
            self.oracle_refine(request.start, nn).await
        } else if express.is_empty() {
            self.genetic_sequence(request.start, &standard, &request.cancel)
        } else {
            let mut seq =
                nearest_neighbour(request.start, &express, self.config.route.max_detour_km);
            for order in &standard {
                insert_cheapest(request.start, &mut seq, order);
            }
            seq
        };

        let route = self.build_route(request, specs).await?;
        if standard.is_empty() && route.total_duration_min > self.config.route.time_constraint_min
        {
            log::warn!(
                "express route for driver {} exceeds the {} min window ({:.1} min)",
                request.driver_id,
                self.config.route.time_constraint_min,
                route.total_duration_min
            );
        }
        Ok(route)
    }

    /// STANDARD-only path: evolve the visit order, then expand to stops.
    fn genetic_sequence(
        &self,
        start: Location,
        orders: &[&Order],
        cancel: &CancellationToken,
    ) -> Vec<StopSpec> {
        let pairs: Vec<VisitPair> = orders
            .iter()
            .map(|o| VisitPair { pickup: o.pickup, delivery: o.delivery })
            .collect();
        let sequence = genetic::evolve(start, &pairs, &self.config.route.genetic, cancel);
        sequence
            .into_iter()
            .flat_map(|i| pair_specs(orders[i]))
            .collect()
    }

    /// Ask the optional oracle for a better ordering of the
    /// nearest-neighbour baseline; keep it only when it is a valid
    /// precedence-respecting permutation that is strictly shorter.
    async fn oracle_refine(&self, start: Location, baseline: Vec<StopSpec>) -> Vec<StopSpec> {
        let Some(oracle) = &self.oracle else { return baseline };
        let locations: Vec<Location> = baseline.iter().map(|s| s.location).collect();
        let ranking = match oracle.rank(start, &locations).await {
            Ok(ranking) => ranking,
            Err(err) => {
                log::debug!("route oracle unavailable, keeping baseline: {err}");
                return baseline;
            }
        };

        let mut sorted = ranking.clone();
        sorted.sort_unstable();
        if sorted != (0..baseline.len()).collect::<Vec<_>>() {
            log::debug!("route oracle returned a non-permutation, keeping baseline");
            return baseline;
        }

        let candidate: Vec<StopSpec> = ranking.iter().map(|&i| baseline[i].clone()).collect();
        if !respects_precedence(&candidate) {
            log::debug!("route oracle ordering breaks pickup-before-delivery, keeping baseline");
            return baseline;
        }

        if sequence_distance(start, &candidate) < sequence_distance(start, &baseline) {
            log::debug!("route oracle improved the baseline ordering");
            candidate
        } else {
            baseline
        }
    }

    /// Turn a stop sequence into a full Route: segments through the
    /// Router (Haversine fallback per segment), traffic adjustment,
    /// cumulative arrival times, quality grade.
    async fn build_route(
        &self,
        request: &OptimizeRequest,
        specs: Vec<StopSpec>,
    ) -> CoreResult<Route> {
        let now = self.clock.now();
        let traffic_factor = request.traffic.factor();
        let traffic_label =
            (traffic_factor > 1.0).then(|| request.traffic.label().to_string());

        let mut stops = vec![Stop {
            id: "start".to_string(),
            kind: StopKind::Start,
            location: request.start,
            service_time_min: 0.0,
            estimated_arrival: now,
            priority: 0,
            order_id: None,
        }];
        let mut segments = Vec::with_capacity(specs.len());
        let mut total_distance = 0.0;
        let mut total_duration = 0.0;
        let mut cursor = now;
        let mut router_failures = 0usize;

        for spec in &specs {
            let prev = &stops[stops.len() - 1];
            let from = prev.location;
            let from_id = prev.id.clone();
            let service_before = prev.service_time_min;

            let (distance_km, base_duration) = match self.router.route(from, spec.location).await
            {
                Ok(leg) => (leg.distance_km, leg.duration_min),
                Err(err) => {
                    router_failures += 1;
                    log::debug!("router segment failed, using haversine: {err}");
                    let km = haversine_km(from, spec.location);
                    (km, fallback_minutes(km))
                }
            };
            let duration_min = base_duration * traffic_factor;

            cursor += chrono::Duration::seconds(((service_before + duration_min) * 60.0) as i64);
            total_distance += distance_km;
            total_duration += duration_min;
            segments.push(Segment {
                from_stop: from_id,
                to_stop: spec.id.clone(),
                distance_km,
                duration_min,
                traffic_condition: traffic_label.clone(),
            });
            stops.push(Stop {
                id: spec.id.clone(),
                kind: spec.kind,
                location: spec.location,
                service_time_min: STOP_SERVICE_MIN,
                estimated_arrival: cursor,
                priority: spec.priority,
                order_id: Some(spec.order_id.clone()),
            });
        }

        // A router that failed on every segment means the routing port is
        // down — surface it so the caller returns the fallback shape.
        if !segments.is_empty() && router_failures == segments.len() {
            return Err(CoreError::transient("router", "all segment lookups failed"));
        }

        Ok(Route {
            id: uuid::Uuid::new_v4().to_string(),
            driver_id: request.driver_id.clone(),
            stops,
            segments,
            total_distance_km: total_distance,
            total_duration_min: total_duration,
            quality: grade(specs.len() + 1, total_duration, total_distance),
        })
    }

    /// Total fallback: stops in input order, Haversine distances,
    /// 3 min/km durations, no traffic adjustment.
    fn fallback_route(&self, request: &OptimizeRequest) -> Route {
        let now = self.clock.now();
        let specs: Vec<StopSpec> = request.orders.iter().flat_map(pair_specs_owned).collect();

        let mut stops = vec![Stop {
            id: "start".to_string(),
            kind: StopKind::Start,
            location: request.start,
            service_time_min: 0.0,
            estimated_arrival: now,
            priority: 0,
            order_id: None,
        }];
        let mut segments = Vec::new();
        let mut total_distance = 0.0;
        let mut cursor = now;

        for spec in &specs {
            let prev = &stops[stops.len() - 1];
            let distance_km = haversine_km(prev.location, spec.location);
            let duration_min = fallback_minutes(distance_km);
            cursor += chrono::Duration::seconds(
                ((prev.service_time_min + duration_min) * 60.0) as i64,
            );
            segments.push(Segment {
                from_stop: prev.id.clone(),
                to_stop: spec.id.clone(),
                distance_km,
                duration_min,
                traffic_condition: None,
            });
            total_distance += distance_km;
            stops.push(Stop {
                id: spec.id.clone(),
                kind: spec.kind,
                location: spec.location,
                service_time_min: STOP_SERVICE_MIN,
                estimated_arrival: cursor,
                priority: spec.priority,
                order_id: Some(spec.order_id.clone()),
            });
        }

        Route {
            id: uuid::Uuid::new_v4().to_string(),
            driver_id: request.driver_id.clone(),
            stops,
            segments,
            total_distance_km: total_distance,
            total_duration_min: total_distance * crate::geo::FALLBACK_MIN_PER_KM,
            quality: RouteQuality::Fallback,
        }
    }
}

fn stop_ids(orders: &[Order]) -> Vec<String> {
    orders
        .iter()
        .flat_map(|o| [format!("p-{}", o.id), format!("d-{}", o.id)])
        .collect()
}

fn pair_specs(order: &Order) -> [StopSpec; 2] {
    [
        StopSpec {
            id: format!("p-{}", order.id),
            kind: StopKind::Pickup,
            location: order.pickup,
            order_id: order.id.clone(),
            priority: order.effective_priority(),
        },
        StopSpec {
            id: format!("d-{}", order.id),
            kind: StopKind::Delivery,
            location: order.delivery,
            order_id: order.id.clone(),
            priority: order.effective_priority(),
        },
    ]
}

fn pair_specs_owned(order: &Order) -> Vec<StopSpec> {
    pair_specs(order).to_vec()
}

/// Precedence-aware nearest-neighbour: at each step the candidates are
/// every unvisited pickup and every delivery whose pickup is done. The
/// nearest candidate wins, except that a pickup further than the
/// nearest ready delivery plus the detour bound loses to that delivery.
fn nearest_neighbour(start: Location, orders: &[&Order], max_detour_km: f64) -> Vec<StopSpec> {
    let mut remaining_pickups: Vec<&Order> = orders.to_vec();
    let mut ready_deliveries: Vec<&Order> = Vec::new();
    let mut sequence = Vec::with_capacity(orders.len() * 2);
    let mut at = start;

    while !remaining_pickups.is_empty() || !ready_deliveries.is_empty() {
        let nearest_pickup = remaining_pickups
            .iter()
            .enumerate()
            .map(|(i, o)| (i, haversine_km(at, o.pickup)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        let nearest_delivery = ready_deliveries
            .iter()
            .enumerate()
            .map(|(i, o)| (i, haversine_km(at, o.delivery)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let take_pickup = match (nearest_pickup, nearest_delivery) {
            (Some((_, pd)), Some((_, dd))) => pd <= dd + max_detour_km,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        if take_pickup {
            let (i, _) = nearest_pickup.unwrap_or((0, 0.0));
            let order = remaining_pickups.remove(i);
            let [pickup, _] = pair_specs(order);
            at = pickup.location;
            sequence.push(pickup);
            ready_deliveries.push(order);
        } else {
            let (i, _) = nearest_delivery.unwrap_or((0, 0.0));
            let order = ready_deliveries.remove(i);
            let [_, delivery] = pair_specs(order);
            at = delivery.location;
            sequence.push(delivery);
        }
    }
    sequence
}

/// Insert a STANDARD order's pickup+delivery as an adjacent pair at the
/// position with the smallest marginal distance.
fn insert_cheapest(start: Location, sequence: &mut Vec<StopSpec>, order: &Order) {
    let [pickup, delivery] = pair_specs(order);
    let mut best: Option<(usize, f64)> = None;

    for position in 0..=sequence.len() {
        let before = if position == 0 { start } else { sequence[position - 1].location };
        let after = sequence.get(position).map(|s| s.location);

        let removed = after.map(|a| haversine_km(before, a)).unwrap_or(0.0);
        let added = haversine_km(before, pickup.location)
            + haversine_km(pickup.location, delivery.location)
            + after.map(|a| haversine_km(delivery.location, a)).unwrap_or(0.0);
        let marginal = added - removed;

        if best.map(|(_, cost)| marginal < cost).unwrap_or(true) {
            best = Some((position, marginal));
        }
    }

    let position = best.map(|(p, _)| p).unwrap_or(sequence.len());
    sequence.insert(position, delivery);
    sequence.insert(position, pickup);
}

fn respects_precedence(sequence: &[StopSpec]) -> bool {
    sequence.iter().enumerate().all(|(i, spec)| {
        spec.kind != StopKind::Delivery
            || sequence[..i]
                .iter()
                .any(|s| s.kind == StopKind::Pickup && s.order_id == spec.order_id)
    })
}

fn sequence_distance(start: Location, sequence: &[StopSpec]) -> f64 {
    let mut at = start;
    let mut total = 0.0;
    for spec in sequence {
        total += haversine_km(at, spec.location);
        at = spec.location;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(id: &str, service: ServiceType, pickup: Location, delivery: Location) -> Order {
        Order {
            id: id.into(),
            service_type: service,
            status: crate::types::OrderStatus::Pending,
            created_at: Utc::now(),
            promised_at: Utc::now(),
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

    #[test]
    fn nearest_neighbour_respects_precedence() {
        let start = Location::new(24.71, 46.67);
        let orders = vec![
            order("a", ServiceType::Express, Location::new(24.72, 46.68), Location::new(24.73, 46.69)),
            order("b", ServiceType::Express, Location::new(24.70, 46.66), Location::new(24.69, 46.65)),
        ];
        let refs: Vec<&Order> = orders.iter().collect();
        let sequence = nearest_neighbour(start, &refs, 2.0);
        assert_eq!(sequence.len(), 4);
        assert!(respects_precedence(&sequence));
    }

    #[test]
    fn insertion_keeps_pair_adjacent_and_ordered() {
        let start = Location::new(24.71, 46.67);
        let express = order(
            "a",
            ServiceType::Express,
            Location::new(24.72, 46.68),
            Location::new(24.73, 46.69),
        );
        let refs = vec![&express];
        let mut sequence = nearest_neighbour(start, &refs, 2.0);
        let standard = order(
            "s",
            ServiceType::Standard,
            Location::new(24.74, 46.70),
            Location::new(24.75, 46.71),
        );
        insert_cheapest(start, &mut sequence, &standard);
        assert_eq!(sequence.len(), 4);
        assert!(respects_precedence(&sequence));
        let pickup_pos = sequence.iter().position(|s| s.id == "p-s").unwrap();
        let delivery_pos = sequence.iter().position(|s| s.id == "d-s").unwrap();
        assert_eq!(delivery_pos, pickup_pos + 1);
    }
}
