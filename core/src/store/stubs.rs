//! Deterministic port stubs for the runner and tests.

use crate::error::{CoreError, CoreResult};
use crate::geo::{self, haversine_km};
use crate::ports::{
    AutonomousPort, EscalationGateway, Notifier, RouteLeg, RouteOracle, Router,
};
use crate::event::ActionPriority;
use crate::types::{EscalationLevel, Location};
use async_trait::async_trait;
use std::sync::Mutex;

// ── Router stubs ─────────────────────────────────────────────────────────────

/// Straight-line router: Haversine distance at a fixed pace. The same
/// arithmetic the engine falls back to, so runner output is stable.
pub struct StaticRouter {
    pub min_per_km: f64,
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self { min_per_km: geo::FALLBACK_MIN_PER_KM }
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(&self, from: Location, to: Location) -> CoreResult<RouteLeg> {
        let distance_km = haversine_km(from, to);
        Ok(RouteLeg {
            distance_km,
            duration_min: distance_km * self.min_per_km,
            geometry: None,
        })
    }
}

/// Router that fails every call. Exercises the engine's fallback path.
#[derive(Default)]
pub struct FailingRouter;

#[async_trait]
impl Router for FailingRouter {
    async fn route(&self, _from: Location, _to: Location) -> CoreResult<RouteLeg> {
        Err(CoreError::transient("router", "routing service unreachable"))
    }
}

// ── Oracle stub ──────────────────────────────────────────────────────────────

/// Oracle that always answers with a fixed ordering (or fails when
/// `ordering` is None, exercising oracle-absent handling).
#[derive(Default)]
pub struct FixedOracle {
    pub ordering: Option<Vec<usize>>,
}

#[async_trait]
impl RouteOracle for FixedOracle {
    async fn rank(&self, _start: Location, stops: &[Location]) -> CoreResult<Vec<usize>> {
        match &self.ordering {
            Some(order) if order.len() == stops.len() => Ok(order.clone()),
            Some(_) => Err(CoreError::Invalid("oracle ordering length mismatch".into())),
            None => Err(CoreError::transient("oracle", "oracle unavailable")),
        }
    }
}

// ── Outbound recorders ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub channel: &'static str,
    pub to:      String,
    pub body:    String,
}

/// Notifier that records every send for later assertion.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, channel: &'static str, to: &str, body: &str) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(SentNotification {
            channel,
            to: to.to_string(),
            body: body.to_string(),
        });
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn sms(&self, phone: &str, message: &str) -> CoreResult<()> {
        self.record("sms", phone, message);
        Ok(())
    }

    async fn email(&self, to: &str, subject: &str, body: &str) -> CoreResult<()> {
        self.record("email", to, &format!("{subject}: {body}"));
        Ok(())
    }

    async fn in_app(&self, user_id: &str, payload: serde_json::Value) -> CoreResult<()> {
        self.record("in_app", user_id, &payload.to_string());
        Ok(())
    }

    async fn voice(&self, phone: &str, message: &str) -> CoreResult<()> {
        self.record("voice", phone, message);
        Ok(())
    }
}

/// Gateway that records every escalation notification.
#[derive(Default)]
pub struct RecordingEscalationGateway {
    notified: Mutex<Vec<(EscalationLevel, serde_json::Value)>>,
}

impl RecordingEscalationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notified(&self) -> Vec<(EscalationLevel, serde_json::Value)> {
        self.notified.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EscalationGateway for RecordingEscalationGateway {
    async fn notify(&self, level: EscalationLevel, payload: serde_json::Value) -> CoreResult<()> {
        self.notified.lock().unwrap_or_else(|e| e.into_inner()).push((level, payload));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AutonomousTrigger {
    pub source:   String,
    pub reason:   String,
    pub priority: ActionPriority,
}

/// Autonomous port that records every trigger.
#[derive(Default)]
pub struct RecordingAutonomousPort {
    triggers: Mutex<Vec<AutonomousTrigger>>,
}

impl RecordingAutonomousPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers(&self) -> Vec<AutonomousTrigger> {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AutonomousPort for RecordingAutonomousPort {
    async fn trigger(
        &self,
        source: &str,
        reason: &str,
        _context: serde_json::Value,
        priority: ActionPriority,
    ) -> CoreResult<()> {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner()).push(AutonomousTrigger {
            source: source.to_string(),
            reason: reason.to_string(),
            priority,
        });
        Ok(())
    }
}
