//! SLA monitor — continuously reclassifies every in-flight order and
//! fires corrective actions.
//!
//! State machine per order: healthy → warning → critical → breached,
//! monotonic. A breach is terminal until the order completes or is
//! cancelled. The category is the max of the elapsed-time category and
//! the predicted-completion category.
//!
//! Corrective actions are idempotent per (order, action type) inside a
//! 5-minute suppression window. The monitor is never fatal to the
//! system: a tick that cannot read orders yields an empty snapshot.

use crate::clock::Clock;
use crate::config::{CoreConfig, SlaThresholds};
use crate::error::{retrying, CoreResult};
use crate::event::{Action, ActionPriority, ActionType};
use crate::geo::{fallback_minutes, haversine_km};
use crate::notify::{NotificationPolicy, Outbound, Urgency};
use crate::ports::{
    ActivityKind, ActivityRecord, ActivityRepository, AutonomousActionRecord,
    AutonomousActionRepository, AutonomousPort, OrderFilter, OrderPatch, OrderRepository,
};
use crate::types::{Order, OrderId, OrderStatus, ServiceType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Orders are read in batches this size during a tick.
const TICK_BATCH: usize = 50;

/// Compensation is capped at this amount on the SLA-breach path.
const COMPENSATION_CAP: f64 = 200.0;

/// Fixed components of the predicted-delivery estimate, minutes.
const PREDICT_ASSIGNMENT_MIN: f64 = 2.0;
const PREDICT_TO_PICKUP_MIN: f64 = 10.0;
const PREDICT_HANDLING_MIN: f64 = 5.0;
const PREDICT_PICKUP_WRAP_MIN: f64 = 3.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlaCategory {
    Healthy,
    Warning,
    Critical,
    Breached,
}

/// Recomputed each tick; never stored canonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaStatus {
    pub order_id:              OrderId,
    pub elapsed_min:           f64,
    pub remaining_min:         f64,
    pub category:              SlaCategory,
    pub predicted_delivery_min: f64,
    pub can_meet_sla:          bool,
    pub alert_required:        bool,
    pub action_required:       bool,
}

/// One breach, as kept in the monitor's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreachRecord {
    pub order_id:       OrderId,
    pub at:             DateTime<Utc>,
    pub exceed_minutes: f64,
    pub compensation:   f64,
}

/// Result of one monitoring pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaTickSnapshot {
    pub statuses:               Vec<SlaStatus>,
    pub actions:                Vec<Action>,
    pub healthy:                usize,
    pub warning:                usize,
    pub critical:               usize,
    pub breached:               usize,
    /// In-flight orders predicted to breach inside 15 minutes.
    pub predicted_breaches_15m: usize,
}

/// Quick feasibility answer for a not-yet-assigned order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaFeasibility {
    pub feasible:      bool,
    pub predicted_min: f64,
    pub risk:          Option<String>,
}

pub struct SlaMonitor {
    orders:          Arc<dyn OrderRepository>,
    activities:      Arc<dyn ActivityRepository>,
    autonomous_log:  Arc<dyn AutonomousActionRepository>,
    autonomous:      Arc<dyn AutonomousPort>,
    policy:          Arc<NotificationPolicy>,
    config:          Arc<CoreConfig>,
    clock:           Arc<dyn Clock>,
    /// Monotonic category floor per in-flight order.
    floors:          Mutex<HashMap<OrderId, SlaCategory>>,
    /// (order, action type) → when last emitted.
    suppression:     Mutex<HashMap<(OrderId, ActionType), DateTime<Utc>>>,
    breach_history:  Mutex<Vec<BreachRecord>>,
}

impl SlaMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        activities: Arc<dyn ActivityRepository>,
        autonomous_log: Arc<dyn AutonomousActionRepository>,
        autonomous: Arc<dyn AutonomousPort>,
        policy: Arc<NotificationPolicy>,
        config: Arc<CoreConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            activities,
            autonomous_log,
            autonomous,
            policy,
            config,
            clock,
            floors: Mutex::new(HashMap::new()),
            suppression: Mutex::new(HashMap::new()),
            breach_history: Mutex::new(Vec::new()),
        }
    }

    // ── Status computation ───────────────────────────────────────────────────

    /// Compute the current status of one order, applying the monotonic
    /// category floor.
    pub fn status_for(&self, order: &Order) -> SlaStatus {
        let now = self.clock.now();
        let thresholds = self.config.sla.thresholds(order.service_type);
        let elapsed = order.elapsed_minutes(now);
        let predicted = predicted_remaining_min(order);

        // Elapsed time against the thresholds, and the forecast remaining
        // time graded against the same scale (a forecast that alone fills
        // the window bumps the category early).
        let elapsed_category = category_of(&thresholds, elapsed);
        let predicted_category = category_of(&thresholds, predicted);
        let mut category = elapsed_category.max(predicted_category);

        // Monotonic: the category never regresses while in flight.
        {
            let mut floors = self.floors.lock().unwrap_or_else(|e| e.into_inner());
            let floor = floors.entry(order.id.clone()).or_insert(SlaCategory::Healthy);
            category = category.max(*floor);
            *floor = category;
        }

        let remaining = thresholds.breach as f64 - elapsed;
        let can_meet = elapsed + predicted <= thresholds.breach as f64;
        SlaStatus {
            order_id: order.id.clone(),
            elapsed_min: elapsed,
            remaining_min: remaining,
            category,
            predicted_delivery_min: predicted,
            can_meet_sla: can_meet,
            alert_required: category >= SlaCategory::Warning,
            action_required: category >= SlaCategory::Critical || !can_meet,
        }
    }

    /// Feasibility check for a pending order (NEW_ORDER planning).
    pub fn feasibility(&self, order: &Order) -> SlaFeasibility {
        let thresholds = self.config.sla.thresholds(order.service_type);
        let elapsed = order.elapsed_minutes(self.clock.now());
        let predicted = predicted_remaining_min(order);
        let feasible = elapsed + predicted <= thresholds.breach as f64;
        SlaFeasibility {
            feasible,
            predicted_min: predicted,
            risk: (!feasible).then(|| "SLA_AT_RISK_FROM_CREATION".to_string()),
        }
    }

    // ── Corrective actions ───────────────────────────────────────────────────

    /// Assess one order and produce its corrective actions (suppressed
    /// idempotently). Breach-path side effects (customer notification,
    /// compensation record) run here — they must happen independently of
    /// upstream failures.
    pub async fn assess(&self, order: &Order) -> CoreResult<(SlaStatus, Vec<Action>)> {
        let status = self.status_for(order);
        let actions = self.actions_for(order, &status).await?;
        Ok((status, actions))
    }

    async fn actions_for(&self, order: &Order, status: &SlaStatus) -> CoreResult<Vec<Action>> {
        let mut actions = Vec::new();
        let thresholds = self.config.sla.thresholds(order.service_type);

        match status.category {
            SlaCategory::Breached => {
                let delay = (status.elapsed_min - thresholds.breach as f64).max(0.0);
                self.breach_actions(order, delay, &mut actions).await?;
            }
            SlaCategory::Critical => {
                if !status.can_meet_sla {
                    if self.admit(order, ActionType::EmergencyReassignment) {
                        actions.push(Action {
                            action_type: ActionType::EmergencyReassignment,
                            priority: ActionPriority::Critical,
                            immediate: true,
                            order_id: order.id.clone(),
                            payload: json!({ "reason": "cannot_meet_sla" }),
                        });
                    }
                } else if self.admit(order, ActionType::ExpediteDelivery) {
                    actions.push(Action {
                        action_type: ActionType::ExpediteDelivery,
                        priority: ActionPriority::High,
                        immediate: false,
                        order_id: order.id.clone(),
                        payload: json!({ "remaining_min": status.remaining_min }),
                    });
                }
                if self.admit(order, ActionType::SupervisorAlert) {
                    actions.push(Action {
                        action_type: ActionType::SupervisorAlert,
                        priority: ActionPriority::High,
                        immediate: false,
                        order_id: order.id.clone(),
                        payload: json!({ "category": "critical" }),
                    });
                }
            }
            SlaCategory::Warning => {
                if self.admit(order, ActionType::OptimizeRoute) {
                    actions.push(Action {
                        action_type: ActionType::OptimizeRoute,
                        priority: ActionPriority::Medium,
                        immediate: false,
                        order_id: order.id.clone(),
                        payload: json!({ "remaining_min": status.remaining_min }),
                    });
                }
                if order.service_type == ServiceType::Express
                    && self.admit(order, ActionType::ProactiveCommunication)
                {
                    actions.push(Action {
                        action_type: ActionType::ProactiveCommunication,
                        priority: ActionPriority::Low,
                        immediate: false,
                        order_id: order.id.clone(),
                        payload: json!({}),
                    });
                }
            }
            SlaCategory::Healthy => {}
        }
        Ok(actions)
    }

    async fn breach_actions(
        &self,
        order: &Order,
        delay_min: f64,
        actions: &mut Vec<Action>,
    ) -> CoreResult<()> {
        if self.admit(order, ActionType::CustomerCompensation) {
            let amount =
                (delay_min * order.service_type.compensation_rate()).min(COMPENSATION_CAP);
            actions.push(Action {
                action_type: ActionType::CustomerCompensation,
                priority: ActionPriority::Critical,
                immediate: true,
                order_id: order.id.clone(),
                payload: json!({ "amount": amount, "delay_min": delay_min }),
            });
            self.breach_history.lock().unwrap_or_else(|e| e.into_inner()).push(BreachRecord {
                order_id: order.id.clone(),
                at: self.clock.now(),
                exceed_minutes: delay_min,
                compensation: amount,
            });
            self.activities
                .append(ActivityRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    at: self.clock.now(),
                    kind: ActivityKind::Breach,
                    order_id: Some(order.id.clone()),
                    driver_id: order.assigned_driver_id.clone(),
                    detail: format!("breach exceeded by {delay_min:.1} min, compensation {amount:.0}"),
                })
                .await?;
            log::warn!(
                "order {} SLA BREACH: exceeded by {delay_min:.1} min, compensation {amount:.0}",
                order.id
            );
        }

        if self.admit(order, ActionType::CustomerNotification) {
            actions.push(Action {
                action_type: ActionType::CustomerNotification,
                priority: ActionPriority::Critical,
                immediate: true,
                order_id: order.id.clone(),
                payload: json!({ "template": "sla_breach_apology" }),
            });
            // Breach notifications are critical: they bypass quiet hours.
            self.policy
                .send(
                    Urgency::Critical,
                    Outbound::Sms {
                        phone: format!("customer:{}", order.id),
                        message: format!(
                            "We're sorry — order {} is running {delay_min:.0} minutes late. \
                             Compensation has been applied.",
                            order.id
                        ),
                    },
                )
                .await?;
            if !order.sla_notified {
                self.orders
                    .update_status(
                        &order.id,
                        order.status,
                        OrderPatch { sla_notified: Some(true), ..Default::default() },
                    )
                    .await?;
            }
        }

        if self.admit(order, ActionType::IncidentReport) {
            actions.push(Action {
                action_type: ActionType::IncidentReport,
                priority: ActionPriority::High,
                immediate: false,
                order_id: order.id.clone(),
                payload: json!({ "delay_min": delay_min }),
            });
        }
        Ok(())
    }

    /// True when the (order, action) pair is outside the suppression
    /// window; records the emission time on admit.
    fn admit(&self, order: &Order, action_type: ActionType) -> bool {
        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.sla.suppression_ttl_secs);
        let mut suppression = self.suppression.lock().unwrap_or_else(|e| e.into_inner());
        suppression.retain(|_, at| now - *at < ttl);
        match suppression.get(&(order.id.clone(), action_type)) {
            Some(_) => false,
            None => {
                suppression.insert((order.id.clone(), action_type), now);
                true
            }
        }
    }

    // ── Tick loop ────────────────────────────────────────────────────────────

    /// One monitoring pass over all active orders. Reads in batches with
    /// up to three retries; a total read failure yields an empty
    /// snapshot rather than an error.
    pub async fn tick(&self) -> SlaTickSnapshot {
        let orders = match retrying("sla_monitor.read_active", || {
            self.orders.get_active(OrderFilter::default())
        })
        .await
        {
            Ok(orders) => orders,
            Err(err) => {
                log::error!("sla tick: could not read active orders, skipping pass: {err}");
                return SlaTickSnapshot::default();
            }
        };

        let mut snapshot = SlaTickSnapshot::default();
        for batch in orders.chunks(TICK_BATCH) {
            for order in batch {
                match self.assess(order).await {
                    Ok((status, actions)) => {
                        match status.category {
                            SlaCategory::Healthy => snapshot.healthy += 1,
                            SlaCategory::Warning => snapshot.warning += 1,
                            SlaCategory::Critical => snapshot.critical += 1,
                            SlaCategory::Breached => snapshot.breached += 1,
                        }
                        if status.category != SlaCategory::Breached
                            && status.remaining_min <= 15.0
                        {
                            snapshot.predicted_breaches_15m += 1;
                        }
                        snapshot.statuses.push(status);
                        snapshot.actions.extend(actions);
                    }
                    Err(err) => {
                        log::warn!("sla tick: assessment of order {} failed: {err}", order.id);
                    }
                }
            }
        }

        log::debug!(
            "sla tick: {} orders — {} healthy, {} warning, {} critical, {} breached",
            snapshot.statuses.len(),
            snapshot.healthy,
            snapshot.warning,
            snapshot.critical,
            snapshot.breached
        );

        if let Err(err) = self.autonomous_trigger(&snapshot).await {
            log::warn!("sla tick: autonomous trigger failed: {err}");
        }
        snapshot
    }

    /// Publish an autonomous directive when the pass crosses any
    /// configured threshold.
    async fn autonomous_trigger(&self, snapshot: &SlaTickSnapshot) -> CoreResult<()> {
        let thresholds = self.config.autonomous;
        let total = snapshot.statuses.len();
        let at_risk = snapshot.warning + snapshot.critical;
        let at_risk_pct = if total > 0 { at_risk as f64 / total as f64 } else { 0.0 };

        let directive = if snapshot.breached >= thresholds.breached_min && snapshot.breached > 0 {
            Some(("sla_breaches_detected", ActionPriority::Critical))
        } else if snapshot.critical >= thresholds.critical_min {
            Some(("critical_orders_accumulating", ActionPriority::High))
        } else if total > 0 && at_risk_pct > thresholds.at_risk_pct {
            Some(("at_risk_share_exceeded", ActionPriority::High))
        } else if snapshot.predicted_breaches_15m > 0 {
            Some(("breaches_predicted_within_15m", ActionPriority::High))
        } else {
            None
        };

        let Some((reason, priority)) = directive else { return Ok(()) };
        let context = json!({
            "breached": snapshot.breached,
            "critical": snapshot.critical,
            "warning": snapshot.warning,
            "at_risk_pct": at_risk_pct,
            "predicted_breaches_15m": snapshot.predicted_breaches_15m,
        });
        self.autonomous_log
            .append(AutonomousActionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                at: self.clock.now(),
                source: "sla-monitor".into(),
                reason: reason.into(),
                priority,
                context: context.clone(),
            })
            .await?;
        self.autonomous.trigger("sla-monitor", reason, context, priority).await
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Settle an order at completion: a late delivery produces the
    /// breach actions exactly once, then the order leaves the monitor.
    pub async fn on_completed(&self, order: &Order) -> CoreResult<Vec<Action>> {
        let delivered_at = order.delivered_at.unwrap_or_else(|| self.clock.now());
        let thresholds = self.config.sla.thresholds(order.service_type);
        let total_min = (delivered_at - order.created_at).num_seconds() as f64 / 60.0;
        let delay = total_min - thresholds.breach as f64;

        let mut actions = Vec::new();
        if delay > 0.0 {
            self.breach_actions(order, delay, &mut actions).await?;
        }
        self.floors.lock().unwrap_or_else(|e| e.into_inner()).remove(&order.id);
        Ok(actions)
    }

    pub fn breach_history(&self) -> Vec<BreachRecord> {
        self.breach_history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn category_of(thresholds: &SlaThresholds, elapsed_min: f64) -> SlaCategory {
    if elapsed_min >= thresholds.breach as f64 {
        SlaCategory::Breached
    } else if elapsed_min >= thresholds.critical as f64 {
        SlaCategory::Critical
    } else if elapsed_min >= thresholds.warning as f64 {
        SlaCategory::Warning
    } else {
        SlaCategory::Healthy
    }
}

/// Estimated minutes to completion from the order's current status.
fn predicted_remaining_min(order: &Order) -> f64 {
    let delivery_leg = fallback_minutes(haversine_km(order.pickup, order.delivery));
    match order.status {
        OrderStatus::Pending => {
            let travel = match order.service_type {
                ServiceType::Express => 15.0,
                ServiceType::Standard => 25.0,
            };
            PREDICT_ASSIGNMENT_MIN + PREDICT_TO_PICKUP_MIN + PREDICT_HANDLING_MIN + travel
        }
        OrderStatus::Assigned => PREDICT_TO_PICKUP_MIN + PREDICT_HANDLING_MIN + delivery_leg,
        OrderStatus::PickupInProgress => PREDICT_PICKUP_WRAP_MIN + delivery_leg,
        OrderStatus::DeliveryInProgress => delivery_leg / 2.0,
        OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed => 0.0,
    }
}
