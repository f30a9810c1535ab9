//! Context providers — demand, traffic, geo and batch hints consumed by
//! routing and assignment.
//!
//! Providers are deterministic functions of the clock and config; the
//! scheduler refreshes the cached demand/traffic state on its own
//! cadence (demand hourly, traffic every 5 minutes).

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::geo::{haversine_km, zone_of};
use crate::types::{Order, OrderId, ServiceType, ZoneId};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Orders per consolidation batch.
const BATCH_SIZE: usize = 4;

// ── Traffic ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLevel {
    Light,
    Moderate,
    Heavy,
}

impl TrafficLevel {
    /// Duration multiplier applied to route segments.
    pub fn factor(&self) -> f64 {
        match self {
            Self::Light => 1.0,
            Self::Moderate => 1.2,
            Self::Heavy => 1.4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Heavy => "heavy",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrafficConditions {
    pub level: TrafficLevel,
    pub factor: f64,
    pub as_of: DateTime<Utc>,
}

/// Hour-of-day traffic model for the launch city: morning and evening
/// rushes are heavy, lunch is moderate.
pub struct TrafficProvider {
    clock: Arc<dyn Clock>,
    state: Mutex<Option<TrafficConditions>>,
}

impl TrafficProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, state: Mutex::new(None) }
    }

    pub fn refresh(&self) -> TrafficConditions {
        let now = self.clock.now();
        let level = match now.hour() {
            7..=9 | 17..=20 => TrafficLevel::Heavy,
            12..=14 => TrafficLevel::Moderate,
            _ => TrafficLevel::Light,
        };
        let conditions = TrafficConditions { level, factor: level.factor(), as_of: now };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(conditions);
        conditions
    }

    /// Last refreshed conditions; refreshes inline when never polled.
    pub fn current(&self) -> TrafficConditions {
        let cached = *self.state.lock().unwrap_or_else(|e| e.into_inner());
        cached.unwrap_or_else(|| self.refresh())
    }
}

// ── Demand ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandForecast {
    pub per_zone: HashMap<ZoneId, f64>,
    pub overall:  f64,
    pub peak:     bool,
    pub as_of:    DateTime<Utc>,
}

pub struct DemandProvider {
    config: Arc<CoreConfig>,
    clock:  Arc<dyn Clock>,
    state:  Mutex<Option<DemandForecast>>,
}

impl DemandProvider {
    pub fn new(config: Arc<CoreConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, state: Mutex::new(None) }
    }

    pub fn refresh(&self) -> DemandForecast {
        let now = self.clock.now();
        let hour = now.hour();
        let multiplier = self
            .config
            .demand
            .peak_windows
            .iter()
            .find(|w| hour >= w.start_hour && hour < w.end_hour)
            .map(|w| w.multiplier)
            .unwrap_or(1.0);

        let per_zone: HashMap<ZoneId, f64> = self
            .config
            .zones
            .iter()
            .map(|z| (z.id.clone(), self.config.demand.base_per_zone * multiplier))
            .collect();
        let overall = per_zone.values().sum();
        let forecast = DemandForecast { per_zone, overall, peak: multiplier > 1.0, as_of: now };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(forecast.clone());
        forecast
    }

    pub fn current(&self) -> DemandForecast {
        let cached = self.state.lock().unwrap_or_else(|e| e.into_inner()).clone();
        cached.unwrap_or_else(|| self.refresh())
    }
}

// ── Batch consolidation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batches:        Vec<Vec<OrderId>>,
    pub est_saving_km:  f64,
}

pub struct BatchOptimizer {
    config: Arc<CoreConfig>,
}

impl BatchOptimizer {
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self { config }
    }

    /// Group unassigned STANDARD orders by pickup zone into batches.
    /// The saving estimate is the pickup-to-pickup hop distance a
    /// consolidated run avoids re-driving.
    pub fn plan(&self, orders: &[Order]) -> BatchPlan {
        let mut by_zone: HashMap<ZoneId, Vec<&Order>> = HashMap::new();
        for order in orders {
            if order.service_type != ServiceType::Standard || order.assigned_driver_id.is_some() {
                continue;
            }
            if let Some(zone) = zone_of(&self.config.zones, order.pickup) {
                by_zone.entry(zone).or_default().push(order);
            }
        }

        let mut plan = BatchPlan::default();
        let mut zones: Vec<_> = by_zone.into_iter().collect();
        zones.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, mut zone_orders) in zones {
            zone_orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            for chunk in zone_orders.chunks(BATCH_SIZE) {
                if chunk.len() < 2 {
                    continue;
                }
                for pair in chunk.windows(2) {
                    plan.est_saving_km += haversine_km(pair[0].pickup, pair[1].pickup) / 2.0;
                }
                plan.batches.push(chunk.iter().map(|o| o.id.clone()).collect());
            }
        }
        plan
    }
}

// ── Geo context ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoContext {
    pub pickup_zone:   Option<ZoneId>,
    pub delivery_zone: Option<ZoneId>,
    pub direct_km:     f64,
    pub cross_zone:    bool,
}

pub struct GeoProvider {
    config: Arc<CoreConfig>,
}

impl GeoProvider {
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self { config }
    }

    pub fn context_for(&self, order: &Order) -> GeoContext {
        let pickup_zone = zone_of(&self.config.zones, order.pickup);
        let delivery_zone = zone_of(&self.config.zones, order.delivery);
        let cross_zone = pickup_zone != delivery_zone;
        GeoContext {
            pickup_zone,
            delivery_zone,
            direct_km: haversine_km(order.pickup, order.delivery),
            cross_zone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock_at(hour: u32) -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, hour, 30, 0).unwrap(),
        ))
    }

    #[test]
    fn rush_hour_is_heavy() {
        let provider = TrafficProvider::new(clock_at(8));
        assert_eq!(provider.refresh().level, TrafficLevel::Heavy);
        let provider = TrafficProvider::new(clock_at(13));
        assert_eq!(provider.refresh().level, TrafficLevel::Moderate);
        let provider = TrafficProvider::new(clock_at(3));
        assert_eq!(provider.refresh().level, TrafficLevel::Light);
    }

    #[test]
    fn lunch_peak_raises_demand() {
        let config = Arc::new(CoreConfig::default());
        let off_peak = DemandProvider::new(config.clone(), clock_at(10)).refresh();
        let peak = DemandProvider::new(config, clock_at(12)).refresh();
        assert!(peak.peak);
        assert!(!off_peak.peak);
        assert!(peak.overall > off_peak.overall);
    }
}
