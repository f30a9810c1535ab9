//! Order recovery — strategy selection and execution for failed
//! deliveries.
//!
//! Each failure type maps to an ordered list of recovery steps. Repeat
//! failures (two or more prior attempts on the same order) override the
//! table with the escalate-and-compensate path. The success estimate
//! decays with attempts and improves with escalation/upgrade steps;
//! an estimate under 0.6 appends an escalate step.

use crate::clock::Clock;
use crate::error::CoreResult;
use crate::notify::{NotificationPolicy, Outbound, Urgency};
use crate::ports::{
    ActivityKind, ActivityRecord, ActivityRepository, OrderPatch, OrderRepository,
};
use crate::types::{Order, OrderId, ServiceType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Recovery compensation cap (separate from the SLA-breach path; the
/// two formulas are intentionally not unified).
const RECOVERY_COMPENSATION_CAP: f64 = 25.0;

/// Contact attempts per channel cycle before fallback handling.
const CONTACT_CYCLE: u32 = 3;

/// Success estimate below which an escalate step is appended.
const ESCALATE_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    DriverUnavailable,
    CustomerUnavailable,
    AddressIssue,
    VehicleBreakdown,
    TrafficDelay,
    SlaBreachRisk,
    PackageDamage,
    MultipleFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RecoveryStep {
    Reassign,
    NearbySearch,
    ServiceUpgrade,
    ContactCustomer { channel: String, attempts: u32 },
    LeaveAtDoor,
    Reschedule { slots: Vec<DateTime<Utc>> },
    GpsVerify,
    LandmarkConfirm,
    CustomerCall,
    EmergencyReassignment,
    Compensation { amount: f64 },
    RecomputeRoute,
    NotifyCustomer,
    PriorityRouting,
    Replacement,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub order_id:            OrderId,
    pub failure:             FailureType,
    pub steps:               Vec<RecoveryStep>,
    pub success_probability: f64,
    /// Prior recovery attempts for this order (before this one).
    pub attempts:            u32,
}

impl RecoveryPlan {
    pub fn wants_reassignment(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, RecoveryStep::Reassign | RecoveryStep::EmergencyReassignment))
    }

    pub fn wants_escalation(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, RecoveryStep::Escalate))
    }
}

pub struct RecoveryAgent {
    orders:     Arc<dyn OrderRepository>,
    activities: Arc<dyn ActivityRepository>,
    policy:     Arc<NotificationPolicy>,
    clock:      Arc<dyn Clock>,
    attempts:   Mutex<HashMap<OrderId, u32>>,
}

impl RecoveryAgent {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        activities: Arc<dyn ActivityRepository>,
        policy: Arc<NotificationPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { orders, activities, policy, clock, attempts: Mutex::new(HashMap::new()) }
    }

    /// Build and execute the recovery plan for one failed order.
    /// Reassignment/escalation steps are returned to the orchestrator;
    /// contact, upgrade and compensation side effects run here.
    pub async fn recover(
        &self,
        order: &Order,
        failure: FailureType,
        delay_min: f64,
    ) -> CoreResult<RecoveryPlan> {
        let prior_attempts = {
            let mut map = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let entry = map.entry(order.id.clone()).or_insert(0);
            let prior = *entry;
            *entry += 1;
            prior
        };

        // Two strikes on the same order override the per-failure table.
        let effective = if prior_attempts >= 2 { FailureType::MultipleFailures } else { failure };
        let mut steps = self.steps_for(order, effective, delay_min);

        let mut probability = 0.8 - 0.15 * prior_attempts as f64;
        for step in &steps {
            probability += match step {
                RecoveryStep::Escalate => 0.10,
                RecoveryStep::ServiceUpgrade => 0.15,
                _ => 0.0,
            };
        }
        let probability = probability.clamp(0.1, 1.0);
        if probability < ESCALATE_THRESHOLD
            && !steps.iter().any(|s| matches!(s, RecoveryStep::Escalate))
        {
            steps.push(RecoveryStep::Escalate);
        }

        let plan = RecoveryPlan {
            order_id: order.id.clone(),
            failure: effective,
            steps,
            success_probability: probability,
            attempts: prior_attempts,
        };
        self.execute_side_effects(order, &plan).await?;

        self.activities
            .append(ActivityRecord {
                id: uuid::Uuid::new_v4().to_string(),
                at: self.clock.now(),
                kind: ActivityKind::Recovery,
                order_id: Some(order.id.clone()),
                driver_id: order.assigned_driver_id.clone(),
                detail: format!(
                    "{effective:?} recovery, {} steps, p={:.2}",
                    plan.steps.len(),
                    plan.success_probability
                ),
            })
            .await?;
        log::info!(
            "order {} recovery for {effective:?}: {} steps, success estimate {:.2}",
            order.id,
            plan.steps.len(),
            plan.success_probability
        );
        Ok(plan)
    }

    fn steps_for(&self, order: &Order, failure: FailureType, delay_min: f64) -> Vec<RecoveryStep> {
        let now = self.clock.now();
        match failure {
            FailureType::DriverUnavailable => vec![
                RecoveryStep::Reassign,
                RecoveryStep::NearbySearch,
                RecoveryStep::ServiceUpgrade,
            ],
            FailureType::CustomerUnavailable => {
                // After three handoff attempts the contact cycle is over:
                // straight to leave-at-door or reschedule.
                if order.delivery_attempts >= CONTACT_CYCLE {
                    vec![self.unreachable_fallback(order, now)]
                } else {
                    vec![
                        RecoveryStep::ContactCustomer { channel: "call".into(), attempts: CONTACT_CYCLE },
                        RecoveryStep::ContactCustomer { channel: "sms".into(), attempts: CONTACT_CYCLE },
                        RecoveryStep::ContactCustomer { channel: "in_app".into(), attempts: CONTACT_CYCLE },
                        self.unreachable_fallback(order, now),
                    ]
                }
            }
            FailureType::AddressIssue => vec![
                RecoveryStep::GpsVerify,
                RecoveryStep::LandmarkConfirm,
                RecoveryStep::CustomerCall,
            ],
            FailureType::VehicleBreakdown => vec![
                RecoveryStep::EmergencyReassignment,
                RecoveryStep::Compensation { amount: compensation(order.service_type, delay_min) },
            ],
            FailureType::TrafficDelay => {
                vec![RecoveryStep::RecomputeRoute, RecoveryStep::NotifyCustomer]
            }
            FailureType::SlaBreachRisk => {
                vec![RecoveryStep::PriorityRouting, RecoveryStep::ServiceUpgrade]
            }
            FailureType::PackageDamage => vec![
                RecoveryStep::Replacement,
                RecoveryStep::Compensation { amount: compensation(order.service_type, delay_min) },
            ],
            FailureType::MultipleFailures => vec![
                RecoveryStep::Escalate,
                RecoveryStep::Compensation { amount: compensation(order.service_type, delay_min) },
            ],
        }
    }

    fn unreachable_fallback(&self, order: &Order, now: DateTime<Utc>) -> RecoveryStep {
        if order.leave_at_door {
            RecoveryStep::LeaveAtDoor
        } else {
            RecoveryStep::Reschedule {
                slots: (1..=3).map(|h| now + Duration::hours(h)).collect(),
            }
        }
    }

    async fn execute_side_effects(&self, order: &Order, plan: &RecoveryPlan) -> CoreResult<()> {
        for step in &plan.steps {
            match step {
                RecoveryStep::ContactCustomer { channel, .. } => {
                    let outbound = match channel.as_str() {
                        "call" => Outbound::Voice {
                            phone: format!("customer:{}", order.id),
                            message: "Your courier is at the door".into(),
                        },
                        "sms" => Outbound::Sms {
                            phone: format!("customer:{}", order.id),
                            message: format!("Courier waiting for order {}", order.id),
                        },
                        _ => Outbound::InApp {
                            user_id: format!("customer:{}", order.id),
                            payload: json!({ "kind": "courier_waiting", "order_id": order.id }),
                        },
                    };
                    self.policy.send(Urgency::Routine, outbound).await?;
                }
                RecoveryStep::ServiceUpgrade => {
                    if order.service_type == ServiceType::Standard {
                        self.orders
                            .update_status(
                                &order.id,
                                order.status,
                                OrderPatch {
                                    service_type: Some(ServiceType::Express),
                                    priority_boost: Some(2),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        log::info!("order {} upgraded to express for recovery", order.id);
                    }
                }
                RecoveryStep::Compensation { amount } => {
                    self.policy
                        .send(
                            Urgency::Critical,
                            Outbound::Sms {
                                phone: format!("customer:{}", order.id),
                                message: format!(
                                    "A {amount:.0} credit was added for the trouble with order {}",
                                    order.id
                                ),
                            },
                        )
                        .await?;
                }
                RecoveryStep::Reschedule { slots } => {
                    self.policy
                        .send(
                            Urgency::Routine,
                            Outbound::InApp {
                                user_id: format!("customer:{}", order.id),
                                payload: json!({ "kind": "reschedule_offer", "slots": slots }),
                            },
                        )
                        .await?;
                }
                RecoveryStep::NotifyCustomer => {
                    self.policy
                        .send(
                            Urgency::Routine,
                            Outbound::Sms {
                                phone: format!("customer:{}", order.id),
                                message: format!("Order {} is delayed by traffic", order.id),
                            },
                        )
                        .await?;
                    if !order.delay_notified {
                        self.orders
                            .update_status(
                                &order.id,
                                order.status,
                                OrderPatch { delay_notified: Some(true), ..Default::default() },
                            )
                            .await?;
                    }
                }
                _ => {}
            }
        }

        // A customer-unavailable pass consumes one delivery attempt.
        if plan.failure == FailureType::CustomerUnavailable {
            self.orders
                .update_status(
                    &order.id,
                    order.status,
                    OrderPatch {
                        delivery_attempts: Some(order.delivery_attempts + 1),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub fn attempts_for(&self, order_id: &str) -> u32 {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner()).get(order_id).unwrap_or(&0)
    }
}

/// Recovery compensation: base by service class plus 2 per 15 minutes of
/// delay, capped at 25.
fn compensation(service: ServiceType, delay_min: f64) -> f64 {
    let base = match service {
        ServiceType::Express => 10.0,
        ServiceType::Standard => 5.0,
    };
    (base + (delay_min / 15.0).floor() * 2.0).min(RECOVERY_COMPENSATION_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compensation_formula() {
        assert_eq!(compensation(ServiceType::Express, 0.0), 10.0);
        assert_eq!(compensation(ServiceType::Standard, 0.0), 5.0);
        assert_eq!(compensation(ServiceType::Express, 31.0), 14.0);
        // Far past the cap.
        assert_eq!(compensation(ServiceType::Express, 400.0), 25.0);
    }
}
