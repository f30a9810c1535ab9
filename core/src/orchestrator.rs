//! Master orchestrator — event intake, the per-event agent plan, and
//! decision aggregation.
//!
//! EXECUTION MODEL (fixed, documented, never reordered):
//!   1. Backpressure gate (inflight cap)
//!   2. Envelope validation (unknown kind → QUEUED/UNKNOWN_EVENT)
//!   3. NEW_ORDER idempotency (same order id → same decision)
//!   4. End-to-end deadline (EXPRESS 3 s, STANDARD 10 s)
//!   5. Plan execution: bounded parallel fan-out, then sequential steps
//!      in dependency order; agent failures are isolated
//!   6. Aggregation into a single Decision
//!
//! A failed critical agent (fleet-status, sla-monitor, order-assignment)
//! forces FAILED; any unhandled error becomes EMERGENCY_QUEUE. The
//! orchestrator never crashes on a single event.

use crate::agent::{self, AgentFailure, AgentResult, AgentTask, Agents, TaskContext};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::ErrorKind;
use crate::escalation::EmergencyType;
use crate::event::{
    ActionType, CoreEvent, Decision, DecisionAction, EventEnvelope, ParsedEvent,
};
use crate::assignment::ReassignOutcome;
use crate::ports::OrderPatch;
use crate::types::{OrderId, OrderStatus, ServiceType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Remembered NEW_ORDER decisions (idempotency window).
const DECISION_LEDGER_CAP: usize = 10_000;

/// Mode thresholds over active order counters.
const PEAK_EXPRESS: usize = 30;
const PEAK_TOTAL: usize = 100;
const NORMAL_TOTAL: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Normal,
    Peak,
    Emergency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlaRisk {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemState {
    pub mode:            SystemMode,
    pub active_express:  usize,
    pub active_standard: usize,
    pub sla_risk:        SlaRisk,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            mode: SystemMode::Normal,
            active_express: 0,
            active_standard: 0,
            sla_risk: SlaRisk::Normal,
        }
    }
}

struct PlanStep {
    task: AgentTask,
    deps: &'static [AgentTask],
}

struct ExecutionPlan {
    parallel:   Vec<AgentTask>,
    sequential: Vec<PlanStep>,
}

pub struct Orchestrator {
    agents:    Agents,
    config:    Arc<CoreConfig>,
    clock:     Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    cancel:    CancellationToken,
    inflight:  AtomicUsize,
    state:     Mutex<(SystemState, bool)>, // (state, warning seen since last decay tick)
    ledger:    Mutex<(HashMap<OrderId, Decision>, VecDeque<OrderId>)>,
}

impl Orchestrator {
    pub fn new(agents: Agents, config: Arc<CoreConfig>, clock: Arc<dyn Clock>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.orchestrator.parallelism.max(1)));
        Self {
            agents,
            config,
            clock,
            semaphore,
            cancel: CancellationToken::new(),
            inflight: AtomicUsize::new(0),
            state: Mutex::new((SystemState::default(), false)),
            ledger: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Cancellation root: cancelling this token drains the orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn scheduler_config(&self) -> crate::config::SchedulerConfig {
        self.config.scheduler
    }

    pub fn state(&self) -> SystemState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    /// Scheduler hook: SLA risk decays when a full tick passed with no
    /// warning.
    pub fn decay_sla_risk(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, warned) = &mut *guard;
        if !*warned {
            state.sla_risk = SlaRisk::Normal;
        }
        *warned = false;
    }

    // ── Event intake ─────────────────────────────────────────────────────────

    pub async fn handle(&self, envelope: EventEnvelope) -> Decision {
        // Backpressure: refuse when too many events are in flight.
        let previous = self.inflight.fetch_add(1, Ordering::SeqCst);
        let _guard = InflightGuard(&self.inflight);
        if previous >= self.config.orchestrator.inflight_max {
            log::warn!("event refused: {previous} events in flight");
            return Decision::queued("OVERLOAD");
        }

        let event = match envelope.parse() {
            ParsedEvent::Known(event) => event,
            ParsedEvent::Unknown => {
                log::warn!("unknown event kind '{}'", envelope.kind);
                return Decision::queued("UNKNOWN_EVENT");
            }
            ParsedEvent::Invalid(message) => {
                log::warn!("invalid event: {message}");
                return Decision::failed(vec![format!("INVALID_EVENT: {message}")]);
            }
        };

        // Idempotency: a NEW_ORDER replay answers with the recorded
        // decision.
        if let CoreEvent::NewOrder { order_id } = &event {
            let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(decision) = ledger.0.get(order_id) {
                log::debug!("NEW_ORDER replay for {order_id}, answering from ledger");
                return decision.clone();
            }
        }

        let event_id = uuid::Uuid::new_v4().to_string();
        let deadline = self.event_deadline(&envelope, &event).await;
        let started = std::time::Instant::now();

        let decision =
            match tokio::time::timeout(deadline, self.orchestrate(&event_id, &event)).await {
                Ok(decision) => decision,
                Err(_) => {
                    log::warn!(
                        "event {event_id} ({}) exceeded its {} ms deadline",
                        event.name(),
                        deadline.as_millis()
                    );
                    Decision::queued("timeout")
                }
            };

        log::info!(
            "event {event_id} ({}) -> {:?} in {} ms",
            event.name(),
            decision.action,
            started.elapsed().as_millis()
        );

        // Only assignments are remembered: a queued order may retry once
        // conditions change, but the same order never assigns twice.
        if let CoreEvent::NewOrder { order_id } = &event {
            let assigned = matches!(
                decision.action,
                DecisionAction::Assigned | DecisionAction::AssignedPendingRoute
            );
            let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            let (map, queue) = &mut *ledger;
            if assigned && !map.contains_key(order_id) {
                map.insert(order_id.clone(), decision.clone());
                queue.push_back(order_id.clone());
                while queue.len() > DECISION_LEDGER_CAP {
                    if let Some(evicted) = queue.pop_front() {
                        map.remove(&evicted);
                    }
                }
            }
        }
        decision
    }

    async fn event_deadline(&self, envelope: &EventEnvelope, event: &CoreEvent) -> Duration {
        if let Some(ms) = envelope.deadline_ms {
            return Duration::from_millis(ms);
        }
        let service = match envelope.service_type {
            Some(service) => Some(service),
            None => match event.order_id() {
                Some(order_id) => self
                    .agents
                    .orders
                    .get_by_id(order_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|o| o.service_type),
                None => None,
            },
        };
        match service {
            Some(ServiceType::Express) => {
                Duration::from_millis(self.config.orchestrator.express_deadline_ms)
            }
            _ => Duration::from_millis(self.config.orchestrator.standard_deadline_ms),
        }
    }

    // ── Orchestration ────────────────────────────────────────────────────────

    async fn orchestrate(&self, event_id: &str, event: &CoreEvent) -> Decision {
        match self.orchestrate_inner(event_id, event).await {
            Ok(decision) => decision,
            Err(err) => {
                log::error!(
                    "event {event_id} ({}) fell through orchestration: {err}",
                    event.name()
                );
                let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
                guard.0.mode = SystemMode::Emergency;
                Decision::emergency_queue()
            }
        }
    }

    async fn orchestrate_inner(
        &self,
        event_id: &str,
        event: &CoreEvent,
    ) -> crate::error::CoreResult<Decision> {
        self.track_event(event).await;

        match event {
            CoreEvent::OrderCompleted { order_id } => self.handle_completed(order_id).await,
            CoreEvent::InternalReassign { order_id, reason } => {
                self.handle_reassign(order_id, reason).await
            }
            CoreEvent::InternalEscalate { order_id, reason } => {
                self.handle_escalate(order_id, reason).await
            }
            _ => {
                let plan = self.plan_for(event).await;
                let results = self.execute_plan(event_id, event, plan).await;
                let mut decision = self.aggregate(event, &results);
                self.follow_up(event, &results, &mut decision).await;
                Ok(decision)
            }
        }
    }

    /// Counter and mode bookkeeping per event.
    async fn track_event(&self, event: &CoreEvent) {
        let service = match event {
            CoreEvent::NewOrder { order_id } | CoreEvent::OrderCompleted { order_id } => self
                .agents
                .orders
                .get_by_id(order_id)
                .await
                .ok()
                .flatten()
                .map(|o| o.service_type),
            _ => None,
        };

        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, warned) = &mut *guard;
        match event {
            CoreEvent::NewOrder { .. } => match service {
                Some(ServiceType::Express) => state.active_express += 1,
                Some(ServiceType::Standard) => state.active_standard += 1,
                None => {}
            },
            CoreEvent::OrderCompleted { .. } => match service {
                Some(ServiceType::Express) => {
                    state.active_express = state.active_express.saturating_sub(1)
                }
                Some(ServiceType::Standard) => {
                    state.active_standard = state.active_standard.saturating_sub(1)
                }
                None => {}
            },
            CoreEvent::SlaWarning { .. } => {
                state.sla_risk = SlaRisk::High;
                *warned = true;
            }
            _ => {}
        }

        let total = state.active_express + state.active_standard;
        if state.active_express > PEAK_EXPRESS || total > PEAK_TOTAL {
            state.mode = SystemMode::Peak;
        } else if total < NORMAL_TOTAL {
            state.mode = SystemMode::Normal;
        }
    }

    /// The per-event execution plan (exact table).
    async fn plan_for(&self, event: &CoreEvent) -> ExecutionPlan {
        use AgentTask::*;
        match event {
            CoreEvent::NewOrder { order_id } => {
                let service = self
                    .agents
                    .orders
                    .get_by_id(order_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|o| o.service_type)
                    .unwrap_or(ServiceType::Standard);
                match service {
                    ServiceType::Express => ExecutionPlan {
                        parallel: vec![FleetStatus, SlaFeasibility, GeoContext],
                        sequential: vec![
                            PlanStep {
                                task: OrderAssignment,
                                deps: &[FleetStatus, SlaFeasibility],
                            },
                            PlanStep { task: RouteOptimization, deps: &[OrderAssignment] },
                        ],
                    },
                    ServiceType::Standard => ExecutionPlan {
                        parallel: vec![FleetStatus, BatchOptimization, DemandForecast],
                        sequential: vec![
                            PlanStep { task: OrderAssignment, deps: &[BatchOptimization] },
                            PlanStep { task: RouteOptimization, deps: &[OrderAssignment] },
                        ],
                    },
                }
            }
            CoreEvent::SlaWarning { .. } => ExecutionPlan {
                parallel: vec![SlaMonitor, FleetStatus],
                sequential: vec![
                    PlanStep { task: EmergencyEscalation, deps: &[SlaMonitor] },
                    PlanStep { task: OrderRecovery, deps: &[EmergencyEscalation] },
                ],
            },
            CoreEvent::DriverStatusChange { driver_id, new_status } => {
                let has_active = self
                    .agents
                    .drivers
                    .get_by_id(driver_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|d| !d.active_order_ids.is_empty())
                    .unwrap_or(false);
                let mut sequential = Vec::new();
                if *new_status == crate::types::DriverStatus::Offline && has_active {
                    sequential.push(PlanStep { task: OrderRecovery, deps: &[FleetStatus] });
                }
                ExecutionPlan { parallel: vec![FleetStatus, FleetRebalancer], sequential }
            }
            CoreEvent::BatchOptimization => ExecutionPlan {
                parallel: vec![BatchOptimization, FleetStatus],
                sequential: vec![PlanStep {
                    task: RouteOptimization,
                    deps: &[BatchOptimization],
                }],
            },
            // Handled directly; an empty plan keeps the type total.
            _ => ExecutionPlan { parallel: Vec::new(), sequential: Vec::new() },
        }
    }

    async fn execute_plan(
        &self,
        event_id: &str,
        event: &CoreEvent,
        plan: ExecutionPlan,
    ) -> HashMap<&'static str, Result<AgentResult, AgentFailure>> {
        let deadline = Duration::from_millis(self.config.orchestrator.agent_deadline_ms);
        let mut results: HashMap<&'static str, Result<AgentResult, AgentFailure>> =
            HashMap::new();

        // Phase 1: independent tasks, bounded fan-out, isolated failures.
        let mut handles = Vec::with_capacity(plan.parallel.len());
        for task in plan.parallel {
            let agents = self.agents.clone();
            let event = event.clone();
            let semaphore = self.semaphore.clone();
            let cancel = self.cancel.child_token();
            handles.push((
                task,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let started = std::time::Instant::now();
                    let ctx = TaskContext { event, deps: HashMap::new(), cancel: cancel.clone() };
                    let outcome = match tokio::time::timeout(
                        deadline,
                        agent::run(&agents, task, &ctx),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            cancel.cancel();
                            Err(AgentFailure {
                                kind: ErrorKind::Transient,
                                message: format!("{} deadline exceeded", task.name()),
                            })
                        }
                    };
                    (outcome, started.elapsed())
                }),
            ));
        }
        for (task, handle) in handles {
            let (outcome, elapsed) = match handle.await {
                Ok(pair) => pair,
                Err(join_err) => (
                    Err(AgentFailure {
                        kind: ErrorKind::Fatal,
                        message: format!("agent task aborted: {join_err}"),
                    }),
                    Duration::ZERO,
                ),
            };
            if let Err(failure) = &outcome {
                log::warn!(
                    "event {event_id}: agent {} failed after {} ms: {}",
                    task.name(),
                    elapsed.as_millis(),
                    failure.message
                );
            }
            results.insert(task.name(), outcome);
        }

        // Phase 2: dependency-ordered tasks, each seeing every
        // predecessor result.
        for step in plan.sequential {
            let unmet: Vec<&'static str> = step
                .deps
                .iter()
                .filter(|dep| !matches!(results.get(dep.name()), Some(Ok(_))))
                .map(|dep| dep.name())
                .collect();
            if !unmet.is_empty() {
                results.insert(
                    step.task.name(),
                    Err(AgentFailure {
                        kind: ErrorKind::Unavailable,
                        message: format!("dependencies failed: {}", unmet.join(", ")),
                    }),
                );
                continue;
            }

            let deps: HashMap<&'static str, AgentResult> = results
                .iter()
                .filter_map(|(name, outcome)| {
                    outcome.as_ref().ok().map(|result| (*name, result.clone()))
                })
                .collect();
            let ctx = TaskContext {
                event: event.clone(),
                deps,
                cancel: self.cancel.child_token(),
            };
            let started = std::time::Instant::now();
            let outcome =
                match tokio::time::timeout(deadline, agent::run(&self.agents, step.task, &ctx))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AgentFailure {
                        kind: ErrorKind::Transient,
                        message: format!("{} deadline exceeded", step.task.name()),
                    }),
                };
            if let Err(failure) = &outcome {
                log::warn!(
                    "event {event_id}: agent {} failed after {} ms: {}",
                    step.task.name(),
                    started.elapsed().as_millis(),
                    failure.message
                );
            }
            results.insert(step.task.name(), outcome);
        }
        results
    }

    // ── Aggregation ──────────────────────────────────────────────────────────

    fn aggregate(
        &self,
        event: &CoreEvent,
        results: &HashMap<&'static str, Result<AgentResult, AgentFailure>>,
    ) -> Decision {
        let mut risks = Vec::new();
        let mut recommendations = Vec::new();
        let mut critical_failures = Vec::new();

        for (name, outcome) in results {
            match outcome {
                Err(failure) => {
                    let line = format!("{name}: {}", failure.message);
                    let critical = matches!(
                        *name,
                        "fleet-status" | "sla-monitor" | "order-assignment"
                    );
                    if critical {
                        critical_failures.push(line);
                    } else {
                        risks.push(line);
                    }
                }
                Ok(AgentResult::Feasibility(feasibility)) => {
                    if let Some(risk) = &feasibility.risk {
                        risks.push(risk.clone());
                    }
                }
                Ok(AgentResult::Fleet(snapshot)) => {
                    if snapshot.available == 0 {
                        recommendations.push("ACTIVATE_STANDBY_DRIVERS".to_string());
                    }
                }
                Ok(AgentResult::Rebalance(plan)) => {
                    recommendations.extend(plan.recommendations.iter().cloned());
                }
                Ok(AgentResult::Batch(plan)) if !plan.batches.is_empty() => {
                    recommendations.push(format!(
                        "CONSOLIDATE_BATCHES:{} (~{:.1} km saved)",
                        plan.batches.len(),
                        plan.est_saving_km
                    ));
                }
                Ok(AgentResult::Escalation(escalation)) => {
                    recommendations.push(format!(
                        "ESCALATED:{}:{}",
                        escalation.level.label(),
                        escalation.id
                    ));
                }
                Ok(AgentResult::SlaAssessment { status, .. }) => {
                    if !status.can_meet_sla {
                        risks.push(format!("SLA_UNREACHABLE:{}", status.order_id));
                    }
                }
                Ok(_) => {}
            }
        }

        if !critical_failures.is_empty() {
            critical_failures.extend(risks);
            return Decision::failed(critical_failures);
        }

        let assignment = results.get(AgentTask::OrderAssignment.name()).and_then(|r| match r {
            Ok(AgentResult::Assignment(outcome)) => outcome.clone(),
            _ => None,
        });
        let route = results.get(AgentTask::RouteOptimization.name()).and_then(|r| match r {
            Ok(AgentResult::Route(route)) => Some((**route).clone()),
            _ => None,
        });

        match assignment {
            Some(outcome) => {
                let action = if route.is_some() {
                    DecisionAction::Assigned
                } else {
                    DecisionAction::AssignedPendingRoute
                };
                Decision {
                    action,
                    driver_id: Some(outcome.driver_id),
                    route,
                    confidence: outcome.confidence,
                    risks,
                    recommendations,
                    requires_manual_intervention: false,
                }
            }
            None => {
                if matches!(event, CoreEvent::NewOrder { .. }) {
                    risks.push("NO_DRIVER_AVAILABLE".to_string());
                    if !recommendations.iter().any(|r| r == "ACTIVATE_STANDBY_DRIVERS") {
                        recommendations.push("ACTIVATE_STANDBY_DRIVERS".to_string());
                    }
                }
                Decision {
                    action: DecisionAction::Queued,
                    driver_id: None,
                    route,
                    confidence: 0.0,
                    risks,
                    recommendations,
                    requires_manual_intervention: false,
                }
            }
        }
    }

    /// Post-aggregation effects: execute the immediate reassignments the
    /// SLA assessment or recovery plans demanded.
    async fn follow_up(
        &self,
        event: &CoreEvent,
        results: &HashMap<&'static str, Result<AgentResult, AgentFailure>>,
        decision: &mut Decision,
    ) {
        let mut targets: Vec<(OrderId, bool)> = Vec::new();
        for outcome in results.values() {
            match outcome {
                Ok(AgentResult::SlaAssessment { actions, .. }) => {
                    if actions
                        .iter()
                        .any(|a| a.action_type == ActionType::EmergencyReassignment)
                    {
                        targets.extend(event.order_id().cloned().map(|id| (id, true)));
                    }
                }
                Ok(AgentResult::Recovery(plan)) if plan.wants_reassignment() => {
                    // An offline driver strands every order it held;
                    // stranded orders move regardless of SLA health.
                    if let CoreEvent::DriverStatusChange { driver_id, .. } = event {
                        match self
                            .agents
                            .orders
                            .get_active(crate::ports::OrderFilter {
                                assigned_to: Some(driver_id.clone()),
                                ..Default::default()
                            })
                            .await
                        {
                            Ok(stranded) => {
                                targets.extend(stranded.into_iter().map(|o| (o.id, false)))
                            }
                            Err(err) => {
                                log::warn!("could not list stranded orders of {driver_id}: {err}")
                            }
                        }
                    } else {
                        targets.push((plan.order_id.clone(), true));
                    }
                }
                _ => {}
            }
        }
        targets.sort_unstable();
        targets.dedup_by(|a, b| a.0 == b.0);

        for (order_id, gate_on_sla) in &targets {
            self.follow_up_reassign(order_id, *gate_on_sla, decision).await;
        }
    }

    async fn follow_up_reassign(
        &self,
        order_id: &str,
        gate_on_sla: bool,
        decision: &mut Decision,
    ) {
        match self.reassign_now(order_id, "sla_recovery", gate_on_sla).await {
            Ok(ReassignOutcome::Reassigned { from, to }) => {
                decision.driver_id = Some(to.clone());
                if decision.action == DecisionAction::Queued {
                    decision.action = DecisionAction::AssignedPendingRoute;
                }
                decision.recommendations.push(format!(
                    "REASSIGNED:{}->{to}",
                    from.as_deref().unwrap_or("unassigned")
                ));
            }
            Ok(ReassignOutcome::EscalationRequired) => {
                decision.risks.push("REASSIGNMENT_EXHAUSTED".to_string());
                if let Err(err) = self
                    .agents
                    .escalation
                    .initiate(
                        EmergencyType::SlaBreach,
                        Some(Severity::Critical),
                        vec![order_id.to_string()],
                        Vec::new(),
                        "reassignment attempts exhausted",
                    )
                    .await
                {
                    log::error!("escalation after exhausted reassignment failed: {err}");
                }
            }
            Ok(ReassignOutcome::NoCandidate) => {
                decision.risks.push("NO_REASSIGNMENT_CANDIDATE".to_string());
            }
            Ok(ReassignOutcome::Skipped { reason }) => {
                log::debug!("reassignment skipped for {order_id}: {reason}");
            }
            Err(err) => {
                decision.risks.push(format!("REASSIGNMENT_FAILED: {err}"));
            }
        }
    }

    async fn reassign_now(
        &self,
        order_id: &str,
        reason: &str,
        gate_on_sla: bool,
    ) -> crate::error::CoreResult<ReassignOutcome> {
        let snapshot = self.agents.fleet.snapshot().await?;
        let status = if gate_on_sla {
            match self.agents.orders.get_by_id(order_id).await? {
                Some(order) => Some(self.agents.sla.status_for(&order)),
                None => None,
            }
        } else {
            None
        };
        self.agents
            .assignment
            .reassign(order_id, reason, &snapshot, status.as_ref())
            .await
    }

    // ── Direct handlers ──────────────────────────────────────────────────────

    async fn handle_completed(&self, order_id: &str) -> crate::error::CoreResult<Decision> {
        let Some(order) = self.agents.orders.get_by_id(order_id).await? else {
            return Ok(Decision::failed(vec![format!(
                "INVALID_EVENT: order '{order_id}' not found"
            )]));
        };
        if order.status.is_terminal() {
            return Ok(Decision::queued("ALREADY_SETTLED"));
        }

        let delivered = self
            .agents
            .orders
            .update_status(
                order_id,
                OrderStatus::Delivered,
                OrderPatch { delivered_at: Some(self.clock.now()), ..Default::default() },
            )
            .await?;
        if let Some(driver_id) = &delivered.assigned_driver_id {
            self.agents
                .drivers
                .detach_order(driver_id, order_id, delivered.service_type)
                .await?;
        }

        let breach_actions = self.agents.sla.on_completed(&delivered).await?;
        let mut decision = Decision::queued("ORDER_SETTLED");
        decision.risks.clear();
        decision.recommendations.push("ORDER_SETTLED".to_string());
        if !breach_actions.is_empty() {
            decision.risks.push("SLA_BREACHED".to_string());
        }
        Ok(decision)
    }

    async fn handle_reassign(
        &self,
        order_id: &str,
        reason: &str,
    ) -> crate::error::CoreResult<Decision> {
        match self.reassign_now(order_id, reason, true).await {
            Ok(ReassignOutcome::Reassigned { from, to }) => Ok(Decision {
                action: DecisionAction::AssignedPendingRoute,
                driver_id: Some(to.clone()),
                route: None,
                confidence: 0.5,
                risks: Vec::new(),
                recommendations: vec![format!(
                    "REASSIGNED:{}->{to}",
                    from.as_deref().unwrap_or("unassigned")
                )],
                requires_manual_intervention: false,
            }),
            Ok(ReassignOutcome::NoCandidate) => Ok(Decision::queued("NO_REASSIGNMENT_CANDIDATE")
                .with_recommendation("ACTIVATE_STANDBY_DRIVERS")),
            Ok(ReassignOutcome::Skipped { reason }) => {
                Ok(Decision::queued(&format!("REASSIGN_SKIPPED: {reason}")))
            }
            Ok(ReassignOutcome::EscalationRequired) => {
                self.handle_escalate(order_id, "reassignment attempts exhausted").await
            }
            Err(err) if err.kind() == ErrorKind::Conflict => Ok(Decision::queued("CONFLICT")),
            Err(err) => Err(err),
        }
    }

    async fn handle_escalate(
        &self,
        order_id: &str,
        reason: &str,
    ) -> crate::error::CoreResult<Decision> {
        let escalation = self
            .agents
            .escalation
            .initiate(
                EmergencyType::SlaBreach,
                Some(Severity::Critical),
                vec![order_id.to_string()],
                Vec::new(),
                reason,
            )
            .await?;
        let mut decision = Decision::queued("ESCALATED");
        decision.risks.clear();
        decision
            .recommendations
            .push(format!("ESCALATED:{}:{}", escalation.level.label(), escalation.id));
        Ok(decision)
    }
}

/// Decrements the inflight counter on every exit path.
struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
