//! Runs every end-to-end scenario on its own harness

use mesh_e2e::scenarios::{
    AddressedAcrossHops, ControlReplay, LeastCostFailover, ReconnectAfterRestart,
    RejectedHandshake, SynchronizedFeeds, TopicRemapBridge,
};
use mesh_e2e::{run_scenario, TestScenario};

async fn assert_passes(scenario: impl TestScenario) {
    let result = run_scenario(&scenario).await;
    assert!(
        result.success,
        "{} failed: {}",
        result.scenario_name,
        result.error_message.unwrap_or_default()
    );
}

#[tokio::test]
async fn test_least_cost_failover() {
    assert_passes(LeastCostFailover).await;
}

#[tokio::test]
async fn test_addressed_across_hops() {
    assert_passes(AddressedAcrossHops).await;
}

#[tokio::test]
async fn test_control_replay() {
    assert_passes(ControlReplay).await;
}

#[tokio::test]
async fn test_topic_remap_bridge() {
    assert_passes(TopicRemapBridge).await;
}

#[tokio::test]
async fn test_reconnect_after_restart() {
    assert_passes(ReconnectAfterRestart).await;
}

#[tokio::test]
async fn test_synchronized_feeds() {
    assert_passes(SynchronizedFeeds).await;
}

#[tokio::test]
async fn test_rejected_handshake() {
    assert_passes(RejectedHandshake).await;
}

#[tokio::test]
async fn test_scenario_names_are_unique() {
    let mut names: Vec<String> = mesh_e2e::all_scenarios()
        .iter()
        .map(|scenario| scenario.name().to_string())
        .collect();
    let count = names.len();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), count);
}
