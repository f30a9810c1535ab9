//! Emergency escalation — the L1–L4 chain.
//!
//! Lifecycle: initiated → active → resolved | failed | fallback.
//! Timeline entries are append-only; the level only ever moves up.
//! A background pass (scheduler, every minute) resolves escalations
//! whose affected orders are all settled and bumps the level when the
//! current tier's response window lapses.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ports::{
    ActivityKind, ActivityRecord, ActivityRepository, EscalationGateway, OrderRepository,
};
use crate::types::{DriverId, EscalationLevel, OrderId, Severity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyType {
    SlaBreach,
    MassSlaBreach,
    DriverEmergency,
    SystemFailure,
    SecurityIncident,
    FleetShortage,
    WeatherEmergency,
    CustomerEscalation,
}

impl EmergencyType {
    /// Default entry level and severity for each emergency type.
    pub fn defaults(&self) -> (EscalationLevel, Severity) {
        match self {
            Self::SlaBreach => (EscalationLevel::L1, Severity::High),
            Self::MassSlaBreach => (EscalationLevel::L3, Severity::Critical),
            Self::DriverEmergency => (EscalationLevel::L2, Severity::Critical),
            Self::SystemFailure => (EscalationLevel::L3, Severity::Critical),
            Self::SecurityIncident => (EscalationLevel::L3, Severity::Critical),
            Self::FleetShortage => (EscalationLevel::L2, Severity::High),
            Self::WeatherEmergency => (EscalationLevel::L2, Severity::High),
            Self::CustomerEscalation => (EscalationLevel::L1, Severity::Medium),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Initiated,
    Active,
    Resolved,
    Failed,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at:    DateTime<Utc>,
    pub entry: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id:                   String,
    pub level:                EscalationLevel,
    pub emergency_type:       EmergencyType,
    pub severity:             Severity,
    pub affected_orders:      Vec<OrderId>,
    pub affected_drivers:     Vec<DriverId>,
    pub actions:              Vec<String>,
    pub timeline:             Vec<TimelineEntry>,
    pub status:               EscalationStatus,
    pub created_at:           DateTime<Utc>,
    pub last_level_change_at: DateTime<Utc>,
}

pub struct EscalationAgent {
    gateway:    Arc<dyn EscalationGateway>,
    orders:     Arc<dyn OrderRepository>,
    activities: Arc<dyn ActivityRepository>,
    clock:      Arc<dyn Clock>,
    active:     Mutex<HashMap<String, Escalation>>,
}

impl EscalationAgent {
    pub fn new(
        gateway: Arc<dyn EscalationGateway>,
        orders: Arc<dyn OrderRepository>,
        activities: Arc<dyn ActivityRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { gateway, orders, activities, clock, active: Mutex::new(HashMap::new()) }
    }

    /// Open an escalation. Must reference at least one order or driver.
    /// A critical severity override enters one level above the type's
    /// default.
    pub async fn initiate(
        &self,
        emergency_type: EmergencyType,
        severity_override: Option<Severity>,
        affected_orders: Vec<OrderId>,
        affected_drivers: Vec<DriverId>,
        note: &str,
    ) -> CoreResult<Escalation> {
        if affected_orders.is_empty() && affected_drivers.is_empty() {
            return Err(CoreError::Invalid(
                "escalation must reference at least one order or driver".into(),
            ));
        }

        let (default_level, default_severity) = emergency_type.defaults();
        let severity = severity_override.unwrap_or(default_severity);
        let level = if severity == Severity::Critical && default_severity != Severity::Critical {
            default_level.bumped()
        } else {
            default_level
        };

        let now = self.clock.now();
        let mut escalation = Escalation {
            id: uuid::Uuid::new_v4().to_string(),
            level,
            emergency_type,
            severity,
            affected_orders,
            affected_drivers,
            actions: Vec::new(),
            timeline: vec![TimelineEntry { at: now, entry: format!("initiated: {note}") }],
            status: EscalationStatus::Initiated,
            created_at: now,
            last_level_change_at: now,
        };

        let payload = json!({
            "escalation_id": escalation.id,
            "emergency_type": escalation.emergency_type,
            "severity": escalation.severity,
            "orders": escalation.affected_orders,
            "drivers": escalation.affected_drivers,
            "note": note,
        });
        match self.gateway.notify(level, payload).await {
            Ok(()) => {
                escalation.status = EscalationStatus::Active;
                escalation
                    .timeline
                    .push(TimelineEntry { at: now, entry: format!("{} notified", level.label()) });
            }
            Err(err) => {
                // No human was reached — hand straight to manual handling.
                escalation.status = EscalationStatus::Fallback;
                escalation.timeline.push(TimelineEntry {
                    at: now,
                    entry: format!("gateway unreachable, manual fallback: {err}"),
                });
                log::error!("escalation {} gateway notify failed: {err}", escalation.id);
            }
        }

        self.activities
            .append(ActivityRecord {
                id: uuid::Uuid::new_v4().to_string(),
                at: now,
                kind: ActivityKind::Escalation,
                order_id: escalation.affected_orders.first().cloned(),
                driver_id: escalation.affected_drivers.first().cloned(),
                detail: format!("{:?} escalation opened at {}", emergency_type, level.label()),
            })
            .await?;
        log::info!(
            "escalation {} opened: {:?} at {} ({:?})",
            escalation.id,
            emergency_type,
            level.label(),
            severity
        );

        if escalation.status == EscalationStatus::Active {
            self.active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(escalation.id.clone(), escalation.clone());
        }
        Ok(escalation)
    }

    /// Background pass: resolve settled escalations, bump lapsed ones.
    /// Returns the escalations that changed.
    pub async fn check_resolutions(&self) -> CoreResult<Vec<Escalation>> {
        let now = self.clock.now();
        let snapshot: Vec<Escalation> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut changed = Vec::new();
        for mut escalation in snapshot {
            if self.all_orders_settled(&escalation).await? {
                escalation.status = EscalationStatus::Resolved;
                escalation
                    .timeline
                    .push(TimelineEntry { at: now, entry: "all affected orders settled".into() });
                self.active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&escalation.id);
                log::info!("escalation {} resolved", escalation.id);
                changed.push(escalation);
                continue;
            }

            let window = Duration::minutes(escalation.level.response_minutes());
            if now - escalation.last_level_change_at >= window {
                if escalation.level == EscalationLevel::L4 {
                    escalation.status = EscalationStatus::Fallback;
                    escalation.timeline.push(TimelineEntry {
                        at: now,
                        entry: "executive window lapsed, manual fallback".into(),
                    });
                    self.active
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&escalation.id);
                    log::error!("escalation {} exhausted the chain", escalation.id);
                } else {
                    let next = escalation.level.bumped();
                    escalation.level = next;
                    escalation.last_level_change_at = now;
                    escalation.timeline.push(TimelineEntry {
                        at: now,
                        entry: format!("response window lapsed, escalated to {}", next.label()),
                    });
                    let payload = json!({
                        "escalation_id": escalation.id,
                        "emergency_type": escalation.emergency_type,
                        "escalated_to": next,
                    });
                    if let Err(err) = self.gateway.notify(next, payload).await {
                        log::warn!("escalation {} bump notify failed: {err}", escalation.id);
                    }
                    self.active
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(escalation.id.clone(), escalation.clone());
                    log::warn!("escalation {} bumped to {}", escalation.id, next.label());
                }
                changed.push(escalation);
            }
        }
        Ok(changed)
    }

    async fn all_orders_settled(&self, escalation: &Escalation) -> CoreResult<bool> {
        for order_id in &escalation.affected_orders {
            match self.orders.get_by_id(order_id).await? {
                Some(order) if !order.status.is_terminal() => return Ok(false),
                _ => {}
            }
        }
        Ok(true)
    }

    pub fn active(&self) -> Vec<Escalation> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_table() {
        assert_eq!(
            EmergencyType::SlaBreach.defaults(),
            (EscalationLevel::L1, Severity::High)
        );
        assert_eq!(
            EmergencyType::MassSlaBreach.defaults(),
            (EscalationLevel::L3, Severity::Critical)
        );
        assert_eq!(
            EmergencyType::CustomerEscalation.defaults(),
            (EscalationLevel::L1, Severity::Medium)
        );
    }

    #[test]
    fn level_bump_saturates_at_l4() {
        assert_eq!(EscalationLevel::L1.bumped(), EscalationLevel::L2);
        assert_eq!(EscalationLevel::L4.bumped(), EscalationLevel::L4);
    }
}
