//! Agent dispatch — the tagged task set the orchestrator fans out.
//!
//! RULE: Agents never throw to the orchestrator. `run` returns either a
//! typed `AgentResult` or an `AgentFailure { kind, message }`; panics
//! and raw errors stop here. One dispatch function replaces per-agent
//! dynamic dispatch so the execution plan is plain data.

use crate::assignment::{AssignmentAgent, AssignmentOutcome};
use crate::context::{
    BatchOptimizer, BatchPlan, DemandForecast, DemandProvider, GeoContext, GeoProvider,
    TrafficConditions, TrafficProvider,
};
use crate::error::{CoreError, ErrorKind};
use crate::escalation::{EmergencyType, Escalation, EscalationAgent};
use crate::event::{ActionType, CoreEvent};
use crate::fleet_agent::{FleetAgent, FleetSnapshot, RebalancePlan};
use crate::ports::{DriverRepository, OrderFilter, OrderRepository};
use crate::recovery::{FailureType, RecoveryAgent, RecoveryPlan};
use crate::route::Route;
use crate::route_engine::{OptimizeRequest, RouteEngine};
use crate::sla_monitor::{SlaCategory, SlaFeasibility, SlaMonitor, SlaStatus};
use crate::types::{DriverStatus, Order};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentTask {
    FleetStatus,
    SlaFeasibility,
    SlaMonitor,
    OrderAssignment,
    RouteOptimization,
    BatchOptimization,
    DemandForecast,
    TrafficStatus,
    GeoContext,
    EmergencyEscalation,
    OrderRecovery,
    FleetRebalancer,
}

impl AgentTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FleetStatus => "fleet-status",
            Self::SlaFeasibility => "sla-feasibility",
            Self::SlaMonitor => "sla-monitor",
            Self::OrderAssignment => "order-assignment",
            Self::RouteOptimization => "route-optimization",
            Self::BatchOptimization => "batch-optimization",
            Self::DemandForecast => "demand-forecast",
            Self::TrafficStatus => "traffic-status",
            Self::GeoContext => "geo-context",
            Self::EmergencyEscalation => "emergency-escalation",
            Self::OrderRecovery => "order-recovery",
            Self::FleetRebalancer => "fleet-rebalancer",
        }
    }

}

/// Typed result of one agent activation.
#[derive(Debug, Clone)]
pub enum AgentResult {
    Fleet(FleetSnapshot),
    Feasibility(SlaFeasibility),
    SlaAssessment { status: SlaStatus, actions: Vec<crate::event::Action> },
    Assignment(Option<AssignmentOutcome>),
    Route(Box<Route>),
    Batch(BatchPlan),
    Demand(DemandForecast),
    Traffic(TrafficConditions),
    Geo(GeoContext),
    Escalation(Box<Escalation>),
    Recovery(Box<RecoveryPlan>),
    Rebalance(RebalancePlan),
    /// The task had nothing to do for this event.
    Skipped(&'static str),
}

#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub kind:    ErrorKind,
    pub message: String,
}

impl From<CoreError> for AgentFailure {
    fn from(err: CoreError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

/// Everything one agent activation can see.
pub struct TaskContext {
    pub event:  CoreEvent,
    /// Results of every predecessor (parallel phase + earlier
    /// sequential steps), keyed by agent name.
    pub deps:   HashMap<&'static str, AgentResult>,
    pub cancel: CancellationToken,
}

/// The wired agent set. Cheap to clone; every member is shared.
#[derive(Clone)]
pub struct Agents {
    pub fleet:      Arc<FleetAgent>,
    pub sla:        Arc<SlaMonitor>,
    pub assignment: Arc<AssignmentAgent>,
    pub routes:     Arc<RouteEngine>,
    pub batch:      Arc<BatchOptimizer>,
    pub demand:     Arc<DemandProvider>,
    pub traffic:    Arc<TrafficProvider>,
    pub geo:        Arc<GeoProvider>,
    pub escalation: Arc<EscalationAgent>,
    pub recovery:   Arc<RecoveryAgent>,
    pub orders:     Arc<dyn OrderRepository>,
    pub drivers:    Arc<dyn DriverRepository>,
}

/// Run one agent task. Never panics, never returns a raw error.
pub async fn run(
    agents: &Agents,
    task: AgentTask,
    ctx: &TaskContext,
) -> Result<AgentResult, AgentFailure> {
    match task {
        AgentTask::FleetStatus => Ok(AgentResult::Fleet(agents.fleet.snapshot().await?)),

        AgentTask::SlaFeasibility => {
            let order = event_order(agents, ctx).await?;
            Ok(AgentResult::Feasibility(agents.sla.feasibility(&order)))
        }

        AgentTask::SlaMonitor => {
            let order = event_order(agents, ctx).await?;
            let (status, actions) = agents.sla.assess(&order).await?;
            Ok(AgentResult::SlaAssessment { status, actions })
        }

        AgentTask::OrderAssignment => {
            let order = event_order(agents, ctx).await?;
            let snapshot = match ctx.deps.get(AgentTask::FleetStatus.name()) {
                Some(AgentResult::Fleet(snapshot)) => snapshot.clone(),
                _ => agents.fleet.snapshot().await?,
            };
            let outcome = agents.assignment.assign(&order, &snapshot).await?;
            Ok(AgentResult::Assignment(outcome))
        }

        AgentTask::RouteOptimization => route_optimization(agents, ctx).await,

        AgentTask::BatchOptimization => {
            let open = agents
                .orders
                .get_active(OrderFilter {
                    service_type: Some(crate::types::ServiceType::Standard),
                    ..Default::default()
                })
                .await?;
            Ok(AgentResult::Batch(agents.batch.plan(&open)))
        }

        AgentTask::DemandForecast => Ok(AgentResult::Demand(agents.demand.current())),

        AgentTask::TrafficStatus => Ok(AgentResult::Traffic(agents.traffic.current())),

        AgentTask::GeoContext => {
            let order = event_order(agents, ctx).await?;
            Ok(AgentResult::Geo(agents.geo.context_for(&order)))
        }

        AgentTask::EmergencyEscalation => emergency_escalation(agents, ctx).await,

        AgentTask::OrderRecovery => order_recovery(agents, ctx).await,

        AgentTask::FleetRebalancer => {
            let snapshot = match ctx.deps.get(AgentTask::FleetStatus.name()) {
                Some(AgentResult::Fleet(snapshot)) => snapshot.clone(),
                _ => agents.fleet.snapshot().await?,
            };
            let open = agents.orders.get_active(OrderFilter::default()).await?;
            Ok(AgentResult::Rebalance(agents.fleet.rebalance_hints(&snapshot, &open)))
        }
    }
}

/// Fetch the order the event refers to.
async fn event_order(agents: &Agents, ctx: &TaskContext) -> Result<Order, AgentFailure> {
    let Some(order_id) = ctx.event.order_id() else {
        return Err(AgentFailure {
            kind: ErrorKind::Invalid,
            message: format!("{} carries no order id", ctx.event.name()),
        });
    };
    agents
        .orders
        .get_by_id(order_id)
        .await?
        .ok_or_else(|| AgentFailure {
            kind: ErrorKind::Invalid,
            message: format!("order '{order_id}' not found"),
        })
}

async fn route_optimization(
    agents: &Agents,
    ctx: &TaskContext,
) -> Result<AgentResult, AgentFailure> {
    let traffic = agents.traffic.current().level;

    // Assigned-order path: route for the winning driver.
    if let Some(AgentResult::Assignment(Some(outcome))) =
        ctx.deps.get(AgentTask::OrderAssignment.name())
    {
        let order = event_order(agents, ctx).await?;
        let driver = agents
            .drivers
            .get_by_id(&outcome.driver_id)
            .await?
            .ok_or_else(|| AgentFailure {
                kind: ErrorKind::Invalid,
                message: format!("driver '{}' not found", outcome.driver_id),
            })?;
        let request = OptimizeRequest {
            driver_id: driver.id.clone(),
            start: driver.location,
            orders: vec![order],
            traffic,
            cancel: ctx.cancel.child_token(),
        };
        return Ok(AgentResult::Route(Box::new(agents.routes.optimize(&request).await)));
    }

    // Batch path: preview route over the largest consolidation batch.
    if let Some(AgentResult::Batch(plan)) = ctx.deps.get(AgentTask::BatchOptimization.name()) {
        let Some(batch) = plan.batches.iter().max_by_key(|b| b.len()) else {
            return Ok(AgentResult::Skipped("no batches to route"));
        };
        let mut orders = Vec::with_capacity(batch.len());
        for id in batch {
            if let Some(order) = agents.orders.get_by_id(id).await? {
                orders.push(order);
            }
        }
        let Some(first) = orders.first() else {
            return Ok(AgentResult::Skipped("batch orders vanished"));
        };
        let request = OptimizeRequest {
            driver_id: "batch-preview".to_string(),
            start: first.pickup,
            orders,
            traffic,
            cancel: ctx.cancel.child_token(),
        };
        return Ok(AgentResult::Route(Box::new(agents.routes.optimize(&request).await)));
    }

    Ok(AgentResult::Skipped("no driver or batch to route"))
}

async fn emergency_escalation(
    agents: &Agents,
    ctx: &TaskContext,
) -> Result<AgentResult, AgentFailure> {
    let Some(AgentResult::SlaAssessment { status, actions }) =
        ctx.deps.get(AgentTask::SlaMonitor.name())
    else {
        return Ok(AgentResult::Skipped("no sla assessment to escalate"));
    };

    let needs_chain = status.category >= SlaCategory::Critical
        || actions.iter().any(|a| {
            matches!(a.action_type, ActionType::SupervisorAlert | ActionType::EmergencyReassignment)
        });
    if !needs_chain {
        return Ok(AgentResult::Skipped("sla status below escalation bar"));
    }

    let severity = (status.category == SlaCategory::Breached)
        .then_some(crate::types::Severity::Critical);
    let escalation = agents
        .escalation
        .initiate(
            EmergencyType::SlaBreach,
            severity,
            vec![status.order_id.clone()],
            Vec::new(),
            &format!("sla {:?}, {:.0} min remaining", status.category, status.remaining_min),
        )
        .await?;
    Ok(AgentResult::Escalation(Box::new(escalation)))
}

async fn order_recovery(agents: &Agents, ctx: &TaskContext) -> Result<AgentResult, AgentFailure> {
    match &ctx.event {
        CoreEvent::SlaWarning { order_id } => {
            // Recovery rides on the escalation step's judgement: a
            // skipped escalation means the order is still healthy.
            if matches!(
                ctx.deps.get(AgentTask::EmergencyEscalation.name()),
                Some(AgentResult::Skipped(_))
            ) {
                return Ok(AgentResult::Skipped("no emergency to recover from"));
            }
            let order = agents.orders.get_by_id(order_id).await?.ok_or_else(|| {
                AgentFailure {
                    kind: ErrorKind::Invalid,
                    message: format!("order '{order_id}' not found"),
                }
            })?;
            let delay = ctx
                .deps
                .get(AgentTask::SlaMonitor.name())
                .and_then(|r| match r {
                    AgentResult::SlaAssessment { status, .. } => {
                        Some((-status.remaining_min).max(0.0))
                    }
                    _ => None,
                })
                .unwrap_or(0.0);
            let plan = agents.recovery.recover(&order, FailureType::SlaBreachRisk, delay).await?;
            Ok(AgentResult::Recovery(Box::new(plan)))
        }

        CoreEvent::DriverStatusChange { driver_id, new_status } => {
            if *new_status != DriverStatus::Offline {
                return Ok(AgentResult::Skipped("driver change needs no recovery"));
            }
            let stranded = agents
                .orders
                .get_active(OrderFilter {
                    assigned_to: Some(driver_id.clone()),
                    ..Default::default()
                })
                .await?;
            let mut last_plan = None;
            for order in &stranded {
                let plan =
                    agents.recovery.recover(order, FailureType::DriverUnavailable, 0.0).await?;
                last_plan = Some(plan);
            }
            match last_plan {
                Some(plan) => Ok(AgentResult::Recovery(Box::new(plan))),
                None => Ok(AgentResult::Skipped("offline driver had no active orders")),
            }
        }

        _ => Ok(AgentResult::Skipped("event carries nothing to recover")),
    }
}
