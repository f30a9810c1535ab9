//! Event intake and decision output — the core's contract with transport.
//!
//! RULE: Agents communicate results upward through `AgentResult` values;
//! external collaborators see only `EventEnvelope` in and `Decision` out.
//! Variants are added over time — never removed or reordered.

use crate::route::Route;
use crate::types::{DriverId, DriverStatus, OrderId, ServiceType};
use serde::{Deserialize, Serialize};

/// An external or internal event, after validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreEvent {
    NewOrder { order_id: OrderId },
    SlaWarning { order_id: OrderId },
    DriverStatusChange { driver_id: DriverId, new_status: DriverStatus },
    BatchOptimization,
    OrderCompleted { order_id: OrderId },
    InternalReassign { order_id: OrderId, reason: String },
    InternalEscalate { order_id: OrderId, reason: String },
}

impl CoreEvent {
    /// Stable name used in logs and activity records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewOrder { .. } => "NEW_ORDER",
            Self::SlaWarning { .. } => "SLA_WARNING",
            Self::DriverStatusChange { .. } => "DRIVER_STATUS_CHANGE",
            Self::BatchOptimization => "BATCH_OPTIMIZATION",
            Self::OrderCompleted { .. } => "ORDER_COMPLETED",
            Self::InternalReassign { .. } => "INTERNAL_REASSIGN",
            Self::InternalEscalate { .. } => "INTERNAL_ESCALATE",
        }
    }

    pub fn order_id(&self) -> Option<&OrderId> {
        match self {
            Self::NewOrder { order_id }
            | Self::SlaWarning { order_id }
            | Self::OrderCompleted { order_id }
            | Self::InternalReassign { order_id, .. }
            | Self::InternalEscalate { order_id, .. } => Some(order_id),
            _ => None,
        }
    }
}

/// The JSON-shaped record delivered by transport. Unknown `kind` values
/// never error — the orchestrator answers QUEUED / UNKNOWN_EVENT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind:         String,
    #[serde(default)]
    pub order_id:     Option<OrderId>,
    #[serde(default)]
    pub driver_id:    Option<DriverId>,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub payload:      serde_json::Value,
    #[serde(default)]
    pub deadline_ms:  Option<u64>,
}

/// Outcome of envelope validation.
pub enum ParsedEvent {
    Known(CoreEvent),
    /// Recognised shape but a required field is missing.
    Invalid(String),
    Unknown,
}

impl EventEnvelope {
    pub fn parse(&self) -> ParsedEvent {
        fn need_order(id: &Option<OrderId>, kind: &str) -> Result<OrderId, String> {
            id.clone().ok_or_else(|| format!("{kind} requires order_id"))
        }
        let event = match self.kind.as_str() {
            "NEW_ORDER" => match need_order(&self.order_id, "NEW_ORDER") {
                Ok(order_id) => CoreEvent::NewOrder { order_id },
                Err(e) => return ParsedEvent::Invalid(e),
            },
            "SLA_WARNING" => match need_order(&self.order_id, "SLA_WARNING") {
                Ok(order_id) => CoreEvent::SlaWarning { order_id },
                Err(e) => return ParsedEvent::Invalid(e),
            },
            "DRIVER_STATUS_CHANGE" => {
                let Some(driver_id) = self.driver_id.clone() else {
                    return ParsedEvent::Invalid("DRIVER_STATUS_CHANGE requires driver_id".into());
                };
                let new_status = serde_json::from_value::<DriverStatus>(
                    self.payload.get("new_status").cloned().unwrap_or_default(),
                )
                .unwrap_or(DriverStatus::Offline);
                CoreEvent::DriverStatusChange { driver_id, new_status }
            }
            "BATCH_OPTIMIZATION" => CoreEvent::BatchOptimization,
            "ORDER_COMPLETED" => match need_order(&self.order_id, "ORDER_COMPLETED") {
                Ok(order_id) => CoreEvent::OrderCompleted { order_id },
                Err(e) => return ParsedEvent::Invalid(e),
            },
            "INTERNAL_REASSIGN" => match need_order(&self.order_id, "INTERNAL_REASSIGN") {
                Ok(order_id) => CoreEvent::InternalReassign {
                    order_id,
                    reason: self.payload_reason(),
                },
                Err(e) => return ParsedEvent::Invalid(e),
            },
            "INTERNAL_ESCALATE" => match need_order(&self.order_id, "INTERNAL_ESCALATE") {
                Ok(order_id) => CoreEvent::InternalEscalate {
                    order_id,
                    reason: self.payload_reason(),
                },
                Err(e) => return ParsedEvent::Invalid(e),
            },
            _ => return ParsedEvent::Unknown,
        };
        ParsedEvent::Known(event)
    }

    fn payload_reason(&self) -> String {
        self.payload
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified")
            .to_string()
    }
}

// ── Corrective actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CustomerCompensation,
    CustomerNotification,
    IncidentReport,
    EmergencyReassignment,
    ExpediteDelivery,
    SupervisorAlert,
    OptimizeRoute,
    ProactiveCommunication,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// A corrective action produced by the SLA monitor or recovery agent and
/// executed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub priority:    ActionPriority,
    pub immediate:   bool,
    pub order_id:    OrderId,
    pub payload:     serde_json::Value,
}

// ── Decision ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Assigned,
    AssignedPendingRoute,
    Queued,
    Failed,
    EmergencyQueue,
}

/// The single value the orchestrator returns for an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action:                       DecisionAction,
    pub driver_id:                    Option<DriverId>,
    pub route:                        Option<Route>,
    /// 0.0 .. 1.0.
    pub confidence:                   f64,
    pub risks:                        Vec<String>,
    pub recommendations:              Vec<String>,
    pub requires_manual_intervention: bool,
}

impl Decision {
    pub fn queued(reason: &str) -> Self {
        Self {
            action: DecisionAction::Queued,
            driver_id: None,
            route: None,
            confidence: 0.0,
            risks: vec![reason.to_string()],
            recommendations: Vec::new(),
            requires_manual_intervention: false,
        }
    }

    pub fn failed(risks: Vec<String>) -> Self {
        Self {
            action: DecisionAction::Failed,
            driver_id: None,
            route: None,
            confidence: 0.0,
            risks,
            recommendations: Vec::new(),
            requires_manual_intervention: true,
        }
    }

    pub fn emergency_queue() -> Self {
        Self {
            action: DecisionAction::EmergencyQueue,
            driver_id: None,
            route: None,
            confidence: 0.0,
            risks: vec!["ORCHESTRATION_ERROR".to_string()],
            recommendations: Vec::new(),
            requires_manual_intervention: true,
        }
    }

    pub fn with_recommendation(mut self, recommendation: &str) -> Self {
        self.recommendations.push(recommendation.to_string());
        self
    }
}
