//! Geometry helpers — Haversine distance, point-in-polygon, zone lookup.
//!
//! RULE: `haversine_km` is the only distance function in the core.
//! Every km figure anywhere (scoring radii, detour limits, route
//! totals) comes from here.

use crate::types::{Location, ZoneId};
use serde::{Deserialize, Serialize};

/// Mean Earth radius, km.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Minutes of travel per km when no router estimate is available
/// (≈20 km/h effective urban speed).
pub const FALLBACK_MIN_PER_KM: f64 = 3.0;

/// Great-circle distance between two points, km.
pub fn haversine_km(a: Location, b: Location) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Travel-time estimate for a distance when the Router port is absent.
pub fn fallback_minutes(distance_km: f64) -> f64 {
    distance_km * FALLBACK_MIN_PER_KM
}

/// Ray-casting point-in-polygon. The polygon is closed implicitly
/// (last vertex connects back to the first).
pub fn point_in_polygon(point: Location, polygon: &[Location]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        let crosses = (pi.lng > point.lng) != (pj.lng > point.lng)
            && point.lat
                < (pj.lat - pi.lat) * (point.lng - pi.lng) / (pj.lng - pi.lng) + pi.lat;
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// A named operating zone with a polygon boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id:      ZoneId,
    pub label:   String,
    pub polygon: Vec<Location>,
}

impl Zone {
    pub fn contains(&self, point: Location) -> bool {
        point_in_polygon(point, &self.polygon)
    }

    pub fn centroid(&self) -> Location {
        let n = self.polygon.len().max(1) as f64;
        let (lat, lng) = self
            .polygon
            .iter()
            .fold((0.0, 0.0), |(la, ln), p| (la + p.lat, ln + p.lng));
        Location::new(lat / n, lng / n)
    }
}

/// Classify a point into a zone. Points outside every polygon fall back
/// to the nearest centroid so classification is total.
pub fn zone_of(zones: &[Zone], point: Location) -> Option<ZoneId> {
    if let Some(zone) = zones.iter().find(|z| z.contains(point)) {
        return Some(zone.id.clone());
    }
    zones
        .iter()
        .map(|z| (z.id.clone(), haversine_km(point, z.centroid())))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}

fn rect(lat_min: f64, lng_min: f64, lat_max: f64, lng_max: f64) -> Vec<Location> {
    vec![
        Location::new(lat_min, lng_min),
        Location::new(lat_min, lng_max),
        Location::new(lat_max, lng_max),
        Location::new(lat_max, lng_min),
    ]
}

/// The five default operating zones (Riyadh launch grid). Deployments
/// override these through the config overlay.
pub fn default_zones() -> Vec<Zone> {
    vec![
        Zone { id: "central".into(), label: "Central Riyadh".into(), polygon: rect(24.60, 46.60, 24.75, 46.78) },
        Zone { id: "north".into(),   label: "North Riyadh".into(),   polygon: rect(24.75, 46.50, 24.95, 46.85) },
        Zone { id: "south".into(),   label: "South Riyadh".into(),   polygon: rect(24.40, 46.55, 24.60, 46.90) },
        Zone { id: "east".into(),    label: "East Riyadh".into(),    polygon: rect(24.60, 46.78, 24.80, 47.05) },
        Zone { id: "west".into(),    label: "West Riyadh".into(),    polygon: rect(24.55, 46.30, 24.75, 46.60) },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Riyadh city centre to a point ~1.5 km north-east.
        let a = Location::new(24.71, 46.67);
        let b = Location::new(24.72, 46.68);
        let d = haversine_km(a, b);
        assert!(d > 1.0 && d < 2.0, "expected ~1.5 km, got {d}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        let p = Location::new(24.71, 46.67);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn point_in_rect() {
        let poly = rect(24.60, 46.60, 24.75, 46.78);
        assert!(point_in_polygon(Location::new(24.70, 46.70), &poly));
        assert!(!point_in_polygon(Location::new(24.90, 46.70), &poly));
    }

    #[test]
    fn zone_lookup_is_total() {
        let zones = default_zones();
        // Inside the central rectangle.
        assert_eq!(zone_of(&zones, Location::new(24.70, 46.70)), Some("central".into()));
        // Far outside every polygon still classifies (nearest centroid).
        assert!(zone_of(&zones, Location::new(26.0, 50.0)).is_some());
    }
}
