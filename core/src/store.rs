//! In-memory adapters for the repository and side-effect ports.
//!
//! RULE: Only adapters in this module mutate entity state.
//! Agents call ports — they never touch the maps directly. These
//! adapters are the deterministic fakes the whole core is tested
//! against, and what the headless runner wires up; a deployment swaps
//! them for database/gateway-backed implementations of the same traits.

pub mod activities;
pub mod autonomous;
pub mod drivers;
pub mod orders;
pub mod stubs;

pub use activities::InMemoryActivities;
pub use autonomous::InMemoryAutonomousActions;
pub use drivers::InMemoryDrivers;
pub use orders::InMemoryOrders;
pub use stubs::{
    FailingRouter, FixedOracle, RecordingAutonomousPort, RecordingEscalationGateway,
    RecordingNotifier, StaticRouter,
};
