//! Route data model — the ephemeral plan a driver executes.
//!
//! A Route is produced by the route engine and attached to an
//! assignment; it is never stored canonically. Invariants:
//!   - the first stop is always `Start`
//!   - the last stop is a `Delivery` or `End`
//!   - `total_distance_km` equals the sum of segment distances

use crate::types::{DriverId, Location, OrderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Start,
    Pickup,
    Delivery,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub id:                String,
    pub kind:              StopKind,
    pub location:          Location,
    pub service_time_min:  f64,
    pub estimated_arrival: DateTime<Utc>,
    pub priority:          u8,
    pub order_id:          Option<OrderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub from_stop:         String,
    pub to_stop:           String,
    pub distance_km:       f64,
    pub duration_min:      f64,
    pub traffic_condition: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteQuality {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Fallback,
    Cached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id:                 String,
    pub driver_id:          DriverId,
    pub stops:              Vec<Stop>,
    pub segments:           Vec<Segment>,
    pub total_distance_km:  f64,
    pub total_duration_min: f64,
    pub quality:            RouteQuality,
}

impl Route {
    /// Structural check over the route invariants. Returns the name of
    /// the first violated invariant, if any.
    pub fn check_invariants(&self) -> Option<&'static str> {
        match self.stops.first() {
            Some(first) if first.kind == StopKind::Start => {}
            _ => return Some("route_starts_at_start"),
        }
        match self.stops.last() {
            Some(last) if matches!(last.kind, StopKind::Delivery | StopKind::End) => {}
            _ => return Some("route_ends_at_delivery_or_end"),
        }
        let segment_sum: f64 = self.segments.iter().map(|s| s.distance_km).sum();
        if (segment_sum - self.total_distance_km).abs() > 1e-6 {
            return Some("total_distance_equals_segment_sum");
        }
        let arrivals_sorted = self
            .stops
            .windows(2)
            .all(|w| w[0].estimated_arrival <= w[1].estimated_arrival);
        if !arrivals_sorted {
            return Some("arrivals_non_decreasing");
        }
        None
    }
}

/// Score a candidate route and map it to a quality band.
///
/// Starts at 1.0 and discounts for size, duration and distance; the
/// bands below are what ops dashboards alert on.
pub fn grade(stop_count: usize, total_duration_min: f64, total_distance_km: f64) -> RouteQuality {
    let mut score = 1.0;
    if stop_count > 10 {
        score *= 0.9;
    }
    if total_duration_min > 120.0 {
        score *= 0.8;
    }
    if total_distance_km > 50.0 {
        score *= 0.85;
    }
    if score >= 0.9 {
        RouteQuality::Excellent
    } else if score >= 0.7 {
        RouteQuality::Good
    } else if score >= 0.5 {
        RouteQuality::Acceptable
    } else {
        RouteQuality::Poor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_bands() {
        assert_eq!(grade(3, 30.0, 5.0), RouteQuality::Excellent);
        assert_eq!(grade(12, 30.0, 5.0), RouteQuality::Excellent); // 0.9 boundary
        assert_eq!(grade(12, 130.0, 5.0), RouteQuality::Good); // 0.72
        assert_eq!(grade(12, 130.0, 60.0), RouteQuality::Acceptable); // 0.612
        assert_eq!(grade(3, 130.0, 60.0), RouteQuality::Acceptable); // 0.68
    }
}
