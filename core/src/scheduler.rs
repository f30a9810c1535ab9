//! Scheduler — the periodic heartbeat of the core.
//!
//! Interval loops (each under its own child cancellation token):
//!   - SLA monitor pass (30 s): corrective actions, internal events,
//!     risk decay
//!   - fleet snapshot (10 s)
//!   - demand refresh (1 h), traffic refresh (5 min)
//!   - escalation resolution check + deferred-notification drain (60 s)

use crate::agent::Agents;
use crate::event::{ActionType, EventEnvelope};
use crate::notify::NotificationPolicy;
use crate::orchestrator::Orchestrator;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    agents:       Agents,
    policy:       Arc<NotificationPolicy>,
}

pub struct SchedulerHandle {
    cancel:  CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        agents: Agents,
        policy: Arc<NotificationPolicy>,
    ) -> Self {
        Self { orchestrator, agents, policy }
    }

    /// Spawn every loop. The returned handle owns their lifetimes.
    pub fn start(self) -> SchedulerHandle {
        let cancel = self.orchestrator.cancellation_token();
        let config = self.orchestrator.scheduler_config();
        let mut handles = Vec::new();

        // SLA pass.
        {
            let orchestrator = self.orchestrator.clone();
            let agents = self.agents.clone();
            let token = cancel.child_token();
            handles.push(tokio::spawn(every(
                Duration::from_secs(config.sla_tick_secs),
                token,
                move || {
                    let orchestrator = orchestrator.clone();
                    let agents = agents.clone();
                    async move {
                        let snapshot = agents.sla.tick().await;
                        for action in &snapshot.actions {
                            match action.action_type {
                                ActionType::EmergencyReassignment => {
                                    let envelope = EventEnvelope {
                                        kind: "INTERNAL_REASSIGN".into(),
                                        order_id: Some(action.order_id.clone()),
                                        driver_id: None,
                                        service_type: None,
                                        payload: json!({ "reason": "sla_critical" }),
                                        deadline_ms: None,
                                    };
                                    let decision = orchestrator.handle(envelope).await;
                                    log::debug!(
                                        "sla pass reassignment of {} -> {:?}",
                                        action.order_id,
                                        decision.action
                                    );
                                }
                                ActionType::SupervisorAlert => {
                                    if let Err(err) = agents
                                        .escalation
                                        .initiate(
                                            crate::escalation::EmergencyType::SlaBreach,
                                            None,
                                            vec![action.order_id.clone()],
                                            Vec::new(),
                                            "sla supervisor alert",
                                        )
                                        .await
                                    {
                                        log::warn!("supervisor alert escalation failed: {err}");
                                    }
                                }
                                _ => {}
                            }
                        }
                        orchestrator.decay_sla_risk();
                    }
                },
            )));
        }

        // Fleet heartbeat.
        {
            let agents = self.agents.clone();
            let token = cancel.child_token();
            handles.push(tokio::spawn(every(
                Duration::from_secs(config.fleet_tick_secs),
                token,
                move || {
                    let agents = agents.clone();
                    async move {
                        match agents.fleet.snapshot().await {
                            Ok(snapshot) => log::debug!(
                                "fleet heartbeat: {}/{} drivers available",
                                snapshot.available,
                                snapshot.drivers.len()
                            ),
                            Err(err) => log::warn!("fleet heartbeat failed: {err}"),
                        }
                    }
                },
            )));
        }

        // Demand refresh.
        {
            let agents = self.agents.clone();
            let token = cancel.child_token();
            handles.push(tokio::spawn(every(
                Duration::from_secs(config.demand_tick_secs),
                token,
                move || {
                    let agents = agents.clone();
                    async move {
                        let forecast = agents.demand.refresh();
                        log::debug!("demand refresh: overall {:.1}/h", forecast.overall);
                    }
                },
            )));
        }

        // Traffic refresh.
        {
            let agents = self.agents.clone();
            let token = cancel.child_token();
            handles.push(tokio::spawn(every(
                Duration::from_secs(config.traffic_tick_secs),
                token,
                move || {
                    let agents = agents.clone();
                    async move {
                        let conditions = agents.traffic.refresh();
                        log::debug!("traffic refresh: {}", conditions.level.label());
                    }
                },
            )));
        }

        // Escalation checker + deferred notification drain.
        {
            let agents = self.agents.clone();
            let policy = self.policy.clone();
            let token = cancel.child_token();
            handles.push(tokio::spawn(every(
                Duration::from_secs(config.escalation_tick_secs),
                token,
                move || {
                    let agents = agents.clone();
                    let policy = policy.clone();
                    async move {
                        match agents.escalation.check_resolutions().await {
                            Ok(changed) if !changed.is_empty() => {
                                log::info!("escalation pass: {} changed", changed.len())
                            }
                            Ok(_) => {}
                            Err(err) => log::warn!("escalation pass failed: {err}"),
                        }
                        if let Err(err) = policy.drain_deferred().await {
                            log::warn!("deferred notification drain failed: {err}");
                        }
                    }
                },
            )));
        }

        SchedulerHandle { cancel, handles }
    }
}

/// Run `work` on a fixed interval until cancelled. The first firing
/// waits one full period.
async fn every<F, Fut>(period: Duration, cancel: CancellationToken, work: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // immediate first tick consumed
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => work().await,
        }
    }
}
