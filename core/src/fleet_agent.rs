//! Fleet status agent — the capacity/availability snapshot every
//! assignment decision reads.
//!
//! This agent:
//!   1. Buckets each driver into available/busy/break/offline/full
//!   2. Computes remaining capacity per service class
//!   3. Derives fatigue and a composite driver score
//!   4. Gates EXPRESS capability per driver
//!   5. Aggregates capacity totals, zone distribution and a 15/30-minute
//!      availability forecast
//!
//! Pure read on the DriverRepository; never mutates anything.

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::geo::zone_of;
use crate::ports::DriverRepository;
use crate::types::{Driver, DriverId, DriverStatus, Location, Order, ServiceType, VehicleType, ZoneId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Minutes without a location ping before a driver reads as offline.
const STALE_LOCATION_MIN: i64 = 5;

/// Continuous work minutes after which an idle driver is sent on break.
const FORCED_BREAK_MIN: f64 = 330.0;

/// EXPRESS capability gates.
const EXPRESS_MIN_SUCCESS_RATE: f64 = 0.9;
const EXPRESS_MAX_CONTINUOUS_MIN: f64 = 360.0;
const EXPRESS_MAX_LOAD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DriverBucket {
    Available,
    Busy,
    Break,
    Offline,
    Full,
}

/// Derived per-driver view the assignment scorer consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverState {
    pub driver_id:               DriverId,
    pub vehicle_type:            VehicleType,
    pub bucket:                  DriverBucket,
    pub location:                Location,
    pub zone:                    Option<ZoneId>,
    pub active_count:            u32,
    pub remaining_express:       u32,
    pub remaining_standard:      u32,
    /// 0 (fresh) .. 1 (exhausted).
    pub fatigue:                 f64,
    /// 0 .. 1 composite assignment score component.
    pub score:                   f64,
    pub express_capable:         bool,
    pub estimated_completion_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapacityTotals {
    pub express_slots:    u32,
    pub standard_slots:   u32,
    pub express_in_use:   u32,
    pub standard_in_use:  u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AvailabilityForecast {
    /// Drivers free now or expected free within 15 minutes.
    pub within_15_min: usize,
    /// Drivers free now or expected free within 30 minutes.
    pub within_30_min: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub taken_at:          DateTime<Utc>,
    pub drivers:           Vec<DriverState>,
    pub available:         usize,
    pub busy:              usize,
    pub on_break:          usize,
    pub offline:           usize,
    pub full:              usize,
    pub totals:            CapacityTotals,
    pub zone_distribution: HashMap<ZoneId, usize>,
    pub forecast:          AvailabilityForecast,
}

impl FleetSnapshot {
    /// Drivers that can take one more order of the given class.
    pub fn candidates_for(&self, service: ServiceType) -> Vec<&DriverState> {
        self.drivers
            .iter()
            .filter(|d| {
                let remaining = match service {
                    ServiceType::Express => d.remaining_express,
                    ServiceType::Standard => d.remaining_standard,
                };
                let open = matches!(d.bucket, DriverBucket::Available | DriverBucket::Busy);
                let capable = service != ServiceType::Express || d.express_capable;
                open && remaining > 0 && capable
            })
            .collect()
    }
}

/// Advisory zone-to-zone repositioning produced on driver status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceMove {
    pub from_zone: ZoneId,
    pub to_zone:   ZoneId,
    pub drivers:   usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub moves:           Vec<RebalanceMove>,
    pub recommendations: Vec<String>,
}

pub struct FleetAgent {
    drivers: Arc<dyn DriverRepository>,
    config:  Arc<CoreConfig>,
    clock:   Arc<dyn Clock>,
}

impl FleetAgent {
    pub fn new(
        drivers: Arc<dyn DriverRepository>,
        config: Arc<CoreConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { drivers, config, clock }
    }

    pub async fn snapshot(&self) -> CoreResult<FleetSnapshot> {
        let now = self.clock.now();
        let all = self.drivers.list().await?;

        let mut states = Vec::with_capacity(all.len());
        let mut totals = CapacityTotals::default();
        let mut zone_distribution: HashMap<ZoneId, usize> = HashMap::new();
        let (mut available, mut busy, mut on_break, mut offline, mut full) = (0, 0, 0, 0, 0);

        for driver in &all {
            let state = self.derive_state(driver, now);
            match state.bucket {
                DriverBucket::Available => available += 1,
                DriverBucket::Busy => busy += 1,
                DriverBucket::Break => on_break += 1,
                DriverBucket::Offline => offline += 1,
                DriverBucket::Full => full += 1,
            }

            if state.bucket != DriverBucket::Offline {
                let cap = self.config.capacity.for_vehicle(driver.vehicle_type);
                totals.express_slots += cap.express;
                totals.standard_slots += cap.standard;
                totals.express_in_use += driver.active_express;
                totals.standard_in_use += driver.active_standard;
                if let Some(zone) = &state.zone {
                    *zone_distribution.entry(zone.clone()).or_insert(0) += 1;
                }
            }
            states.push(state);
        }

        let forecast = forecast_availability(&states, now);
        log::debug!(
            "fleet snapshot: {available} available, {busy} busy, {on_break} break, \
             {offline} offline, {full} full; forecast 15m={} 30m={}",
            forecast.within_15_min,
            forecast.within_30_min
        );

        Ok(FleetSnapshot {
            taken_at: now,
            drivers: states,
            available,
            busy,
            on_break,
            offline,
            full,
            totals,
            zone_distribution,
            forecast,
        })
    }

    fn derive_state(&self, driver: &Driver, now: DateTime<Utc>) -> DriverState {
        let cap = self.config.capacity.for_vehicle(driver.vehicle_type);
        let bucket = classify(driver, cap.express.max(cap.standard), now);
        let fatigue = fatigue(driver, now);
        let score = driver_score(driver, bucket, fatigue, cap.total());
        DriverState {
            driver_id: driver.id.clone(),
            vehicle_type: driver.vehicle_type,
            bucket,
            location: driver.location,
            zone: zone_of(&self.config.zones, driver.location),
            active_count: driver.active_count(),
            remaining_express: cap.express.saturating_sub(driver.active_express),
            remaining_standard: cap.standard.saturating_sub(driver.active_standard),
            fatigue,
            score,
            express_capable: express_capable(driver),
            estimated_completion_at: driver.estimated_completion_at,
        }
    }

    /// Advisory repositioning: a zone whose share of drivers is under
    /// half its share of open orders is flagged for inbound moves from
    /// the most over-covered zone.
    pub fn rebalance_hints(&self, snapshot: &FleetSnapshot, open_orders: &[Order]) -> RebalancePlan {
        let mut plan = RebalancePlan::default();
        let total_drivers: usize = snapshot.zone_distribution.values().sum();
        if total_drivers == 0 || open_orders.is_empty() {
            return plan;
        }

        let mut orders_by_zone: HashMap<ZoneId, usize> = HashMap::new();
        for order in open_orders {
            if let Some(zone) = zone_of(&self.config.zones, order.pickup) {
                *orders_by_zone.entry(zone).or_insert(0) += 1;
            }
        }
        let total_orders: usize = orders_by_zone.values().sum();
        if total_orders == 0 {
            return plan;
        }

        let driver_share = |zone: &str| {
            *snapshot.zone_distribution.get(zone).unwrap_or(&0) as f64 / total_drivers as f64
        };
        let surplus_zone = self
            .config
            .zones
            .iter()
            .map(|z| (z.id.clone(), driver_share(&z.id)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id);

        for zone in &self.config.zones {
            let order_share =
                *orders_by_zone.get(&zone.id).unwrap_or(&0) as f64 / total_orders as f64;
            if order_share > 0.0 && driver_share(&zone.id) < order_share / 2.0 {
                if let Some(from) = &surplus_zone {
                    if *from != zone.id {
                        plan.moves.push(RebalanceMove {
                            from_zone: from.clone(),
                            to_zone: zone.id.clone(),
                            drivers: ((order_share * total_drivers as f64) / 2.0).ceil() as usize,
                        });
                        plan.recommendations
                            .push(format!("REBALANCE:{from}->{}", zone.id));
                    }
                }
            }
        }
        plan
    }
}

fn classify(driver: &Driver, class_cap_max: u32, now: DateTime<Utc>) -> DriverBucket {
    let stale = now - driver.location_at > Duration::minutes(STALE_LOCATION_MIN);
    if driver.status == DriverStatus::Offline || stale {
        return DriverBucket::Offline;
    }
    if driver.status == DriverStatus::Break
        || (driver.continuous_minutes > FORCED_BREAK_MIN && driver.active_count() == 0)
    {
        return DriverBucket::Break;
    }
    if driver.active_count() >= class_cap_max {
        return DriverBucket::Full;
    }
    if driver.active_count() == 0 {
        DriverBucket::Available
    } else {
        DriverBucket::Busy
    }
}

/// Fatigue ∈ [0,1]: hours worked, orders done, time since last break.
fn fatigue(driver: &Driver, now: DateTime<Utc>) -> f64 {
    let hours_worked = (driver.continuous_minutes / 60.0).max(0.0);
    let min_since_break = match driver.last_break_at {
        Some(at) => ((now - at).num_seconds() as f64 / 60.0).max(0.0),
        None => driver.continuous_minutes,
    };
    let raw = 0.4 * (hours_worked / 8.0).min(1.0)
        + 0.3 * (driver.orders_today as f64 / 50.0).min(1.0)
        + 0.3 * (min_since_break / 240.0).min(1.0);
    raw.clamp(0.0, 1.0)
}

/// Composite driver score ∈ [0,1].
fn driver_score(driver: &Driver, bucket: DriverBucket, fatigue: f64, total_cap: u32) -> f64 {
    let availability = match bucket {
        DriverBucket::Available => 1.0,
        DriverBucket::Busy if total_cap > 0 => {
            (total_cap.saturating_sub(driver.active_count())) as f64 / total_cap as f64
        }
        _ => 0.0,
    };
    let score = 0.3 * availability
        + 0.2 * (1.0 - fatigue)
        + 0.25 * (driver.rating / 5.0).clamp(0.0, 1.0)
        + 0.15 * (driver.battery as f64 / 100.0)
        + 0.1 * (driver.orders_today as f64 / 20.0).min(1.0);
    score.clamp(0.0, 1.0)
}

fn express_capable(driver: &Driver) -> bool {
    driver.express_success_rate >= EXPRESS_MIN_SUCCESS_RATE
        && driver.continuous_minutes < EXPRESS_MAX_CONTINUOUS_MIN
        && driver.active_express < EXPRESS_MAX_LOAD
}

fn forecast_availability(states: &[DriverState], now: DateTime<Utc>) -> AvailabilityForecast {
    let free_within = |minutes: i64| {
        states
            .iter()
            .filter(|s| match s.bucket {
                DriverBucket::Available => true,
                DriverBucket::Busy | DriverBucket::Full => s
                    .estimated_completion_at
                    .map(|at| at <= now + Duration::minutes(minutes))
                    .unwrap_or(false),
                _ => false,
            })
            .count()
    };
    AvailabilityForecast { within_15_min: free_within(15), within_30_min: free_within(30) }
}
