//! Order assignment and the reassignment protocol.
//!
//! Assignment scores every candidate driver from the fleet snapshot and
//! claims the winner with a compare-and-set on the order's
//! `assigned_driver_id` (expected empty). A CAS miss is retried once
//! against a fresh read, then surfaced as a conflict.
//!
//! Reassignment swaps the holder atomically (expected = old driver),
//! excludes drivers that already failed for the order, and hands the
//! order to escalation after three failed attempts.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::fleet_agent::{DriverState, FleetSnapshot};
use crate::geo::{fallback_minutes, haversine_km};
use crate::notify::{NotificationPolicy, Outbound, Urgency};
use crate::ports::{
    ActivityKind, ActivityRecord, ActivityRepository, DriverRepository, OrderPatch,
    OrderRepository,
};
use crate::sla_monitor::SlaStatus;
use crate::types::{DriverId, Order, OrderId, OrderStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Reassignment attempts per order before escalation takes over.
const MAX_REASSIGN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub driver_id:  DriverId,
    /// The winning candidate's composite score, reported as confidence.
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReassignOutcome {
    Reassigned { from: Option<DriverId>, to: DriverId },
    Skipped { reason: String },
    NoCandidate,
    /// Three strikes — the caller raises INTERNAL_ESCALATE.
    EscalationRequired,
}

pub struct AssignmentAgent {
    orders:          Arc<dyn OrderRepository>,
    drivers:         Arc<dyn DriverRepository>,
    activities:      Arc<dyn ActivityRepository>,
    policy:          Arc<NotificationPolicy>,
    clock:           Arc<dyn Clock>,
    failed_attempts: Mutex<HashMap<OrderId, u32>>,
    excluded:        Mutex<HashMap<OrderId, HashSet<DriverId>>>,
    /// Orders currently mid-reassignment.
    locked:          Mutex<HashSet<OrderId>>,
}

impl AssignmentAgent {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        drivers: Arc<dyn DriverRepository>,
        activities: Arc<dyn ActivityRepository>,
        policy: Arc<NotificationPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            drivers,
            activities,
            policy,
            clock,
            failed_attempts: Mutex::new(HashMap::new()),
            excluded: Mutex::new(HashMap::new()),
            locked: Mutex::new(HashSet::new()),
        }
    }

    // ── Assignment ───────────────────────────────────────────────────────────

    /// Pick and claim the best driver for an unassigned order.
    /// `Ok(None)` means no candidate (the orchestrator queues the order).
    pub async fn assign(
        &self,
        order: &Order,
        snapshot: &FleetSnapshot,
    ) -> CoreResult<Option<AssignmentOutcome>> {
        let Some((driver_id, confidence)) = self.best_candidate(order, snapshot, None) else {
            return Ok(None);
        };

        let claimed = self
            .orders
            .cas_assigned_driver(&order.id, None, Some(driver_id.as_str()))
            .await?;
        if !claimed {
            // Someone else won the race; one retry against fresh state.
            let fresh = self
                .orders
                .get_by_id(&order.id)
                .await?
                .ok_or_else(|| CoreError::Invalid(format!("order '{}' vanished", order.id)))?;
            if let Some(holder) = &fresh.assigned_driver_id {
                log::debug!("order {} already claimed by {holder}", order.id);
                return Ok(Some(AssignmentOutcome { driver_id: holder.clone(), confidence: 0.0 }));
            }
            let retried = self
                .orders
                .cas_assigned_driver(&order.id, None, Some(driver_id.as_str()))
                .await?;
            if !retried {
                return Err(CoreError::conflict("order", order.id.clone()));
            }
        }

        self.complete_assignment(order, &driver_id, None).await?;
        log::info!(
            "order {} assigned to {driver_id} (confidence {confidence:.2})",
            order.id
        );
        Ok(Some(AssignmentOutcome { driver_id, confidence }))
    }

    /// Score = driver score × distance factor × eta factor, zero outside
    /// the service radius.
    fn best_candidate(
        &self,
        order: &Order,
        snapshot: &FleetSnapshot,
        exclude: Option<&HashSet<DriverId>>,
    ) -> Option<(DriverId, f64)> {
        let excluded_for_order = {
            let map = self.excluded.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&order.id).cloned().unwrap_or_default()
        };

        snapshot
            .candidates_for(order.service_type)
            .into_iter()
            .filter(|d| !excluded_for_order.contains(&d.driver_id))
            .filter(|d| exclude.map(|set| !set.contains(&d.driver_id)).unwrap_or(true))
            .filter_map(|d| {
                let score = candidate_score(d, order);
                (score > 0.0).then(|| (d.driver_id.clone(), score))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    async fn complete_assignment(
        &self,
        order: &Order,
        driver_id: &str,
        replaced: Option<&str>,
    ) -> CoreResult<()> {
        self.drivers
            .attach_order(driver_id, &order.id, order.service_type)
            .await?;
        self.orders
            .update_status(&order.id, OrderStatus::Assigned, OrderPatch::default())
            .await?;
        self.activities
            .append(ActivityRecord {
                id: uuid::Uuid::new_v4().to_string(),
                at: self.clock.now(),
                kind: if replaced.is_some() {
                    ActivityKind::Reassignment
                } else {
                    ActivityKind::Assignment
                },
                order_id: Some(order.id.clone()),
                driver_id: Some(driver_id.to_string()),
                detail: match replaced {
                    Some(old) => format!("reassigned from {old} to {driver_id}"),
                    None => format!("assigned to {driver_id}"),
                },
            })
            .await?;
        self.policy
            .send(
                Urgency::Routine,
                Outbound::InApp {
                    user_id: driver_id.to_string(),
                    payload: json!({ "kind": "order_assigned", "order_id": order.id }),
                },
            )
            .await?;
        Ok(())
    }

    // ── Reassignment protocol ────────────────────────────────────────────────

    /// Whether this order is eligible for reassignment right now.
    pub fn should_reassign(&self, order: &Order, status: Option<&SlaStatus>) -> bool {
        if order.status.is_terminal() {
            return false;
        }
        if self.locked.lock().unwrap_or_else(|e| e.into_inner()).contains(&order.id) {
            return false;
        }
        let attempts = *self
            .failed_attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&order.id)
            .unwrap_or(&0);
        if attempts >= MAX_REASSIGN_ATTEMPTS {
            return false;
        }
        // A healthy order with a reachable SLA is left alone.
        if let Some(status) = status {
            if status.can_meet_sla && status.category < crate::sla_monitor::SlaCategory::Critical {
                return false;
            }
        }
        true
    }

    pub async fn reassign(
        &self,
        order_id: &str,
        reason: &str,
        snapshot: &FleetSnapshot,
        status: Option<&SlaStatus>,
    ) -> CoreResult<ReassignOutcome> {
        let Some(order) = self.orders.get_by_id(order_id).await? else {
            return Err(CoreError::Invalid(format!("order '{order_id}' not found")));
        };
        if !self.should_reassign(&order, status) {
            return Ok(ReassignOutcome::Skipped {
                reason: "not eligible for reassignment".to_string(),
            });
        }

        {
            let mut locked = self.locked.lock().unwrap_or_else(|e| e.into_inner());
            if !locked.insert(order.id.clone()) {
                return Ok(ReassignOutcome::Skipped { reason: "reassignment in flight".into() });
            }
        }
        let result = self.reassign_locked(&order, reason, snapshot).await;
        self.locked.lock().unwrap_or_else(|e| e.into_inner()).remove(&order.id);
        result
    }

    async fn reassign_locked(
        &self,
        order: &Order,
        reason: &str,
        snapshot: &FleetSnapshot,
    ) -> CoreResult<ReassignOutcome> {
        let current = order.assigned_driver_id.clone();
        let mut exclude: HashSet<DriverId> = HashSet::new();
        if let Some(holder) = &current {
            exclude.insert(holder.clone());
        }

        let Some((next_driver, _score)) = self.best_candidate(order, snapshot, Some(&exclude))
        else {
            return Ok(ReassignOutcome::NoCandidate);
        };

        let swapped = self
            .orders
            .cas_assigned_driver(&order.id, current.as_deref(), Some(next_driver.as_str()))
            .await?;
        if !swapped {
            // Fresh read, one retry with the observed holder.
            let fresh = self
                .orders
                .get_by_id(&order.id)
                .await?
                .ok_or_else(|| CoreError::Invalid(format!("order '{}' vanished", order.id)))?;
            let retried = self
                .orders
                .cas_assigned_driver(
                    &order.id,
                    fresh.assigned_driver_id.as_deref(),
                    Some(next_driver.as_str()),
                )
                .await?;
            if !retried {
                return self.record_failure(order, &next_driver).await;
            }
        }

        if let Some(old_driver) = &current {
            self.drivers
                .detach_order(old_driver, &order.id, order.service_type)
                .await?;
            self.policy
                .send(
                    Urgency::Routine,
                    Outbound::InApp {
                        user_id: old_driver.clone(),
                        payload: json!({ "kind": "order_removed", "order_id": order.id, "reason": reason }),
                    },
                )
                .await?;
        }
        self.complete_assignment(order, &next_driver, current.as_deref()).await?;
        self.policy
            .send(
                Urgency::Routine,
                Outbound::Email {
                    to: "ops@dispatch".to_string(),
                    subject: format!("order {} reassigned", order.id),
                    body: format!(
                        "{} -> {next_driver} at {} ({reason})",
                        current.as_deref().unwrap_or("unassigned"),
                        self.clock.now().to_rfc3339()
                    ),
                },
            )
            .await?;
        log::info!(
            "order {} reassigned {} -> {next_driver} ({reason})",
            order.id,
            current.as_deref().unwrap_or("unassigned")
        );
        Ok(ReassignOutcome::Reassigned { from: current, to: next_driver })
    }

    async fn record_failure(
        &self,
        order: &Order,
        failed_driver: &str,
    ) -> CoreResult<ReassignOutcome> {
        self.excluded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(order.id.clone())
            .or_default()
            .insert(failed_driver.to_string());

        let attempts = {
            let mut map = self.failed_attempts.lock().unwrap_or_else(|e| e.into_inner());
            let entry = map.entry(order.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        log::warn!(
            "order {} reassignment attempt {attempts} failed (driver {failed_driver})",
            order.id
        );
        if attempts >= MAX_REASSIGN_ATTEMPTS {
            return Ok(ReassignOutcome::EscalationRequired);
        }
        Err(CoreError::conflict("order", order.id.clone()))
    }

    pub fn failed_attempts_for(&self, order_id: &str) -> u32 {
        *self
            .failed_attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(order_id)
            .unwrap_or(&0)
    }
}

/// Candidate score: composite driver score shaped by distance to the
/// pickup and the estimated time-to-pickup against the SLA window.
fn candidate_score(state: &DriverState, order: &Order) -> f64 {
    let distance_km = haversine_km(state.location, order.pickup);
    let max_radius = order.service_type.max_radius_km();
    let distance_factor = (1.0 - distance_km / max_radius).max(0.0);

    let eta_min = fallback_minutes(distance_km);
    let eta_factor = (1.0 - eta_min / order.service_type.sla_minutes() as f64).max(0.0);

    state.score * distance_factor * eta_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_agent::DriverBucket;
    use crate::types::{Location, ServiceType, VehicleType};
    use chrono::Utc;

    fn state(id: &str, location: Location, score: f64) -> DriverState {
        DriverState {
            driver_id: id.into(),
            vehicle_type: VehicleType::Bike,
            bucket: DriverBucket::Available,
            location,
            zone: None,
            active_count: 0,
            remaining_express: 5,
            remaining_standard: 8,
            fatigue: 0.1,
            score,
            express_capable: true,
            estimated_completion_at: None,
        }
    }

    fn order(id: &str, pickup: Location) -> Order {
        Order {
            id: id.into(),
            service_type: ServiceType::Express,
            status: crate::types::OrderStatus::Pending,
            created_at: Utc::now(),
            promised_at: Utc::now(),
            pickup,
            delivery: Location::new(24.73, 46.69),
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
    fn nearer_driver_wins_at_equal_score() {
        let pickup = Location::new(24.71, 46.67);
        let near = state("near", Location::new(24.711, 46.671), 0.8);
        let far = state("far", Location::new(24.74, 46.70), 0.8);
        let o = order("o1", pickup);
        assert!(candidate_score(&near, &o) > candidate_score(&far, &o));
    }

    #[test]
    fn outside_radius_scores_zero() {
        let pickup = Location::new(24.71, 46.67);
        // ~12 km away: outside the 5 km express radius.
        let distant = state("distant", Location::new(24.82, 46.67), 0.9);
        let o = order("o1", pickup);
        assert_eq!(candidate_score(&distant, &o), 0.0);
    }
}
