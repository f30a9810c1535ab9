//! Core configuration — every tunable the decision core recognises.
//!
//! `CoreConfig::default()` carries the production defaults; deployments
//! layer a partial JSON overlay on top via `CoreConfig::load`. Nothing
//! reads environment variables or files anywhere else in the core.

use crate::error::{CoreError, CoreResult};
use crate::geo::{self, Zone};
use crate::types::{Capacity, ServiceType, VehicleType};
use serde::{Deserialize, Serialize};

/// SLA category thresholds for one service class, minutes since order
/// creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlaThresholds {
    pub warning:  i64,
    pub critical: i64,
    pub breach:   i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub express:  SlaThresholds,
    pub standard: SlaThresholds,
    /// Corrective actions are idempotent per (order, action type) inside
    /// this window.
    pub suppression_ttl_secs: i64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            express:  SlaThresholds { warning: 40, critical: 50, breach: 60 },
            standard: SlaThresholds { warning: 150, critical: 210, breach: 240 },
            suppression_ttl_secs: 300,
        }
    }
}

impl SlaConfig {
    pub fn thresholds(&self, service: ServiceType) -> SlaThresholds {
        match service {
            ServiceType::Express => self.express,
            ServiceType::Standard => self.standard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub bike: Capacity,
    pub car:  Capacity,
    pub van:  Capacity,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            bike: Capacity { express: 5, standard: 8 },
            car:  Capacity { express: 8, standard: 15 },
            van:  Capacity { express: 10, standard: 25 },
        }
    }
}

impl CapacityConfig {
    pub fn for_vehicle(&self, vehicle: VehicleType) -> Capacity {
        match vehicle {
            VehicleType::Bike => self.bike,
            VehicleType::Car => self.car,
            VehicleType::Van => self.van,
        }
    }
}

/// Genetic-algorithm parameters for STANDARD route optimization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticParams {
    pub population:  usize,
    pub generations: usize,
    pub mutation:    f64,
    pub crossover:   f64,
    pub elitism:     usize,
    pub seed:        u64,
}

impl Default for GeneticParams {
    fn default() -> Self {
        Self {
            population: 50,
            generations: 100,
            mutation: 0.01,
            crossover: 0.7,
            elitism: 2,
            seed: 0x5EED_D15F,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub cache_ttl_ms:        i64,
    pub cache_max_entries:   usize,
    pub genetic:             GeneticParams,
    /// Nearest-neighbour detour bound for EXPRESS routes, km.
    pub max_detour_km:       f64,
    /// EXPRESS routes must fit inside this many minutes.
    pub time_constraint_min: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 300_000,
            cache_max_entries: 1_000,
            genetic: GeneticParams::default(),
            max_detour_km: 2.0,
            time_constraint_min: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Agent fan-out cap (semaphore permits).
    pub parallelism:          usize,
    /// Backpressure threshold: refuse new events past this many in flight.
    pub inflight_max:         usize,
    /// Per-agent-task deadline, ms.
    pub agent_deadline_ms:    u64,
    /// End-to-end deadline for an EXPRESS event, ms.
    pub express_deadline_ms:  u64,
    /// End-to-end deadline for a STANDARD (or untyped) event, ms.
    pub standard_deadline_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 32,
            inflight_max: 256,
            agent_deadline_ms: 5_000,
            express_deadline_ms: 3_000,
            standard_deadline_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub sms:      bool,
    pub whatsapp: bool,
    pub email:    bool,
    pub in_app:   bool,
    pub voice:    bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self { sms: true, whatsapp: false, email: true, in_app: true, voice: false }
    }
}

/// Local hours [start, end) during which non-critical notifications are
/// deferred. A window may wrap midnight (start > end).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHours {
    pub start: u32,
    pub end:   u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self { start: 22, end: 7 }
    }
}

impl QuietHours {
    pub fn covers(&self, hour: u32) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// Thresholds for the SLA monitor's autonomous directive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomousTriggerConfig {
    pub breached_min: usize,
    pub critical_min: usize,
    pub at_risk_pct:  f64,
}

impl Default for AutonomousTriggerConfig {
    fn default() -> Self {
        Self { breached_min: 1, critical_min: 3, at_risk_pct: 0.3 }
    }
}

/// A demand multiplier applied inside an [start, end) hour window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeakWindow {
    pub start_hour: u32,
    pub end_hour:   u32,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    /// Launch-city peak windows (lunch and evening rush).
    pub peak_windows:   Vec<PeakWindow>,
    /// Baseline orders/hour per zone used by the forecast.
    pub base_per_zone:  f64,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            peak_windows: vec![
                PeakWindow { start_hour: 12, end_hour: 14, multiplier: 1.8 },
                PeakWindow { start_hour: 18, end_hour: 21, multiplier: 1.6 },
            ],
            base_per_zone: 12.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub sla_tick_secs:        u64,
    pub fleet_tick_secs:      u64,
    pub demand_tick_secs:     u64,
    pub traffic_tick_secs:    u64,
    pub escalation_tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sla_tick_secs: 30,
            fleet_tick_secs: 10,
            demand_tick_secs: 3_600,
            traffic_tick_secs: 300,
            escalation_tick_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub sla:          SlaConfig,
    pub capacity:     CapacityConfig,
    pub route:        RouteConfig,
    pub orchestrator: OrchestratorConfig,
    pub channels:     ChannelsConfig,
    pub quiet_hours:  QuietHours,
    pub autonomous:   AutonomousTriggerConfig,
    pub demand:       DemandConfig,
    pub scheduler:    SchedulerConfig,
    pub zones:        Vec<Zone>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sla: SlaConfig::default(),
            capacity: CapacityConfig::default(),
            route: RouteConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            channels: ChannelsConfig::default(),
            quiet_hours: QuietHours::default(),
            autonomous: AutonomousTriggerConfig::default(),
            demand: DemandConfig::default(),
            scheduler: SchedulerConfig::default(),
            zones: geo::default_zones(),
        }
    }
}

impl CoreConfig {
    /// Load a partial JSON overlay from disk over the defaults.
    pub fn load(path: &str) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Invalid(format!("config file '{path}': {e}")))?;
        let config: CoreConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = CoreConfig::default();
        assert_eq!(config.sla.express.breach, 60);
        assert_eq!(config.sla.standard.breach, 240);
        assert_eq!(config.capacity.bike.express, 5);
        assert_eq!(config.capacity.van.standard, 25);
        assert_eq!(config.route.cache_max_entries, 1_000);
        assert_eq!(config.orchestrator.inflight_max, 256);
        assert_eq!(config.zones.len(), 5);
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let quiet = QuietHours { start: 22, end: 7 };
        assert!(quiet.covers(23));
        assert!(quiet.covers(3));
        assert!(!quiet.covers(12));
    }
}
