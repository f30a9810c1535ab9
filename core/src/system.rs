//! Fully wired core — construction of the agent set, orchestrator and
//! ports.
//!
//! Call `DispatchCore::build` with real adapters, or
//! `DispatchCore::build_in_memory` to get the deterministic in-memory
//! rendition the tests and the headless runner use. Everything is
//! injected; there is no module-level state anywhere in the core.

use crate::agent::Agents;
use crate::assignment::AssignmentAgent;
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::context::{BatchOptimizer, DemandProvider, GeoProvider, TrafficProvider};
use crate::escalation::EscalationAgent;
use crate::fleet_agent::FleetAgent;
use crate::notify::NotificationPolicy;
use crate::orchestrator::Orchestrator;
use crate::ports::{
    ActivityRepository, AutonomousActionRepository, AutonomousPort, DriverRepository,
    EscalationGateway, Notifier, OrderRepository, RouteOracle, Router,
};
use crate::recovery::RecoveryAgent;
use crate::route_engine::RouteEngine;
use crate::sla_monitor::SlaMonitor;
use crate::store::{
    InMemoryActivities, InMemoryAutonomousActions, InMemoryDrivers, InMemoryOrders,
    RecordingAutonomousPort, RecordingEscalationGateway, RecordingNotifier, StaticRouter,
};
use std::sync::Arc;

/// External adapters the core consumes.
pub struct PortSet {
    pub orders:         Arc<dyn OrderRepository>,
    pub drivers:        Arc<dyn DriverRepository>,
    pub activities:     Arc<dyn ActivityRepository>,
    pub autonomous_log: Arc<dyn AutonomousActionRepository>,
    pub router:         Arc<dyn Router>,
    pub oracle:         Option<Arc<dyn RouteOracle>>,
    pub notifier:       Arc<dyn Notifier>,
    pub gateway:        Arc<dyn EscalationGateway>,
    pub autonomous:     Arc<dyn AutonomousPort>,
}

/// The assembled decision core.
pub struct DispatchCore {
    pub config:       Arc<CoreConfig>,
    pub clock:        Arc<dyn Clock>,
    pub agents:       Agents,
    pub orchestrator: Arc<Orchestrator>,
    pub policy:       Arc<NotificationPolicy>,
}

impl DispatchCore {
    /// Wire the core against a set of adapters.
    pub fn build(config: CoreConfig, clock: Arc<dyn Clock>, ports: PortSet) -> Self {
        let config = Arc::new(config);
        let policy = Arc::new(NotificationPolicy::new(
            ports.notifier.clone(),
            config.channels,
            config.quiet_hours,
            clock.clone(),
        ));

        let fleet = Arc::new(FleetAgent::new(ports.drivers.clone(), config.clone(), clock.clone()));
        let sla = Arc::new(SlaMonitor::new(
            ports.orders.clone(),
            ports.activities.clone(),
            ports.autonomous_log.clone(),
            ports.autonomous.clone(),
            policy.clone(),
            config.clone(),
            clock.clone(),
        ));
        let assignment = Arc::new(AssignmentAgent::new(
            ports.orders.clone(),
            ports.drivers.clone(),
            ports.activities.clone(),
            policy.clone(),
            clock.clone(),
        ));
        let routes = Arc::new(RouteEngine::new(
            ports.router.clone(),
            ports.oracle.clone(),
            config.clone(),
            clock.clone(),
        ));
        let escalation = Arc::new(EscalationAgent::new(
            ports.gateway.clone(),
            ports.orders.clone(),
            ports.activities.clone(),
            clock.clone(),
        ));
        let recovery = Arc::new(RecoveryAgent::new(
            ports.orders.clone(),
            ports.activities.clone(),
            policy.clone(),
            clock.clone(),
        ));

        let agents = Agents {
            fleet,
            sla,
            assignment,
            routes,
            batch: Arc::new(BatchOptimizer::new(config.clone())),
            demand: Arc::new(DemandProvider::new(config.clone(), clock.clone())),
            traffic: Arc::new(TrafficProvider::new(clock.clone())),
            geo: Arc::new(GeoProvider::new(config.clone())),
            escalation,
            recovery,
            orders: ports.orders,
            drivers: ports.drivers,
        };
        let orchestrator =
            Arc::new(Orchestrator::new(agents.clone(), config.clone(), clock.clone()));

        Self { config, clock, agents, orchestrator, policy }
    }
}

/// The deterministic in-memory rendition, with handles to every fake
/// so tests and the runner can seed and assert.
pub struct InMemoryCore {
    pub core:           DispatchCore,
    pub orders:         Arc<InMemoryOrders>,
    pub drivers:        Arc<InMemoryDrivers>,
    pub activities:     Arc<InMemoryActivities>,
    pub autonomous_log: Arc<InMemoryAutonomousActions>,
    pub notifier:       Arc<RecordingNotifier>,
    pub gateway:        Arc<RecordingEscalationGateway>,
    pub autonomous:     Arc<RecordingAutonomousPort>,
}

impl DispatchCore {
    /// Build against in-memory adapters and a straight-line router.
    /// Pass a custom router/oracle to exercise failure paths.
    pub fn build_in_memory(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        router: Option<Arc<dyn Router>>,
        oracle: Option<Arc<dyn RouteOracle>>,
    ) -> InMemoryCore {
        let capacity_config = config.capacity.clone();
        let orders = Arc::new(InMemoryOrders::new());
        let drivers = Arc::new(InMemoryDrivers::new(move |driver| {
            capacity_config.for_vehicle(driver.vehicle_type)
        }));
        let activities = Arc::new(InMemoryActivities::new());
        let autonomous_log = Arc::new(InMemoryAutonomousActions::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let gateway = Arc::new(RecordingEscalationGateway::new());
        let autonomous = Arc::new(RecordingAutonomousPort::new());

        let core = DispatchCore::build(
            config,
            clock,
            PortSet {
                orders: orders.clone(),
                drivers: drivers.clone(),
                activities: activities.clone(),
                autonomous_log: autonomous_log.clone(),
                router: router.unwrap_or_else(|| Arc::new(StaticRouter::default())),
                oracle,
                notifier: notifier.clone(),
                gateway: gateway.clone(),
                autonomous: autonomous.clone(),
            },
        );

        InMemoryCore {
            core,
            orders,
            drivers,
            activities,
            autonomous_log,
            notifier,
            gateway,
            autonomous,
        }
    }
}
