use std::sync::Arc;
use std::time::Duration;

use scan_registry_rs::lifecycle::{spawn_stop_finalizer, ScanState, StateSignal};
use scan_registry_rs::registry::ScanRegistry;

async fn wait_until_finished(registry: &ScanRegistry) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !registry.summary().finished {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("summary was never finalized");
}

#[tokio::test]
async fn transition_to_idle_finalizes_the_summary() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let _bridge = spawn_stop_finalizer(registry.clone(), signal.subscribe());

    assert!(!registry.summary().finished);
    signal.transition(ScanState::Scanning);
    signal.transition(ScanState::Idle);

    wait_until_finished(&registry).await;
    assert!(registry.summary().finished);
}

#[tokio::test]
async fn repeated_stop_notifications_do_not_restamp_the_end_time() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let _bridge = spawn_stop_finalizer(registry.clone(), signal.subscribe());

    signal.transition(ScanState::Scanning);
    signal.transition(ScanState::Idle);
    wait_until_finished(&registry).await;
    let frozen = registry.summary().elapsed();

    tokio::time::sleep(Duration::from_millis(30)).await;
    signal.transition(ScanState::Stopping);
    signal.transition(ScanState::Idle);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(registry.summary().elapsed(), frozen);
}

#[tokio::test]
async fn a_new_scan_arms_the_finalizer_again() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let _bridge = spawn_stop_finalizer(registry.clone(), signal.subscribe());

    signal.transition(ScanState::Scanning);
    signal.transition(ScanState::Idle);
    wait_until_finished(&registry).await;

    registry.start_new_scan("second session".into(), Vec::new());
    assert!(!registry.summary().finished);

    signal.transition(ScanState::Scanning);
    signal.transition(ScanState::Idle);
    wait_until_finished(&registry).await;
    assert!(registry.summary().finished);
}

#[test]
fn states_render_their_wire_names() {
    assert_eq!(ScanState::Idle.as_str(), "idle");
    assert_eq!(ScanState::Scanning.as_str(), "running");
    assert_eq!(ScanState::Stopping.as_str(), "stopping");
}
