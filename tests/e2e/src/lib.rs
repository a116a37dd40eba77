//! End-to-End Test Framework for the Mesh
//!
//! Builds multi-switch topologies over in-process queues, TCP and Unix
//! sockets and checks routing behaviour through real clients.

pub mod framework;
pub mod scenarios;

pub use framework::{run_scenario, MeshHarness, TestResult, TestScenario};
pub use scenarios::all_scenarios;
