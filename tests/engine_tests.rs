use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use scan_registry_rs::engine::{run_scan, EngineConfig};
use scan_registry_rs::feeder::{Feeder, RangeFeeder};
use scan_registry_rs::fetchers::FetcherRegistry;
use scan_registry_rs::lifecycle::{spawn_stop_finalizer, ScanState, StateSignal};
use scan_registry_rs::registry::ScanRegistry;

// The identity fetcher needs no network, so these tests run the full
// producer pipeline deterministically against documentation addresses.

fn no_io_config() -> EngineConfig {
    EngineConfig {
        concurrency: 4,
        timeout: Duration::from_millis(50),
        include_unresponsive: true,
        ports: Vec::new(),
    }
}

#[tokio::test]
async fn identity_scan_registers_every_fed_address_once() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let fetchers = FetcherRegistry::with_builtins().select(&["ip"]).unwrap();
    let feeder = RangeFeeder::parse("198.51.100.0/29").unwrap();
    let expected: Vec<IpAddr> = feeder.addresses();
    assert_eq!(expected.len(), 6);

    let summary = run_scan(
        registry.clone(),
        &feeder,
        fetchers,
        no_io_config(),
        CancellationToken::new(),
        signal.clone(),
    )
    .await
    .unwrap();

    assert_eq!(summary.scanned as usize, expected.len());
    assert_eq!(registry.len(), expected.len());
    assert_eq!(signal.current(), ScanState::Idle);

    // every fed address is registered exactly once, wherever it landed
    for address in expected {
        let result = registry.get_or_create(address);
        assert!(registry.is_registered(&result));
        let position = registry.position_of(&result).unwrap();
        assert_eq!(registry.get(position).unwrap().address(), address);
        assert_eq!(result.value_text(0).unwrap(), address.to_string());
    }
    assert_eq!(registry.summary().scanned as usize, registry.len());
}

#[tokio::test]
async fn unresponsive_hosts_are_dropped_by_default() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let fetchers = FetcherRegistry::with_builtins().select(&["ip"]).unwrap();
    let feeder = RangeFeeder::parse("198.51.100.0/30").unwrap();

    let mut config = no_io_config();
    config.include_unresponsive = false;

    let summary = run_scan(
        registry.clone(),
        &feeder,
        fetchers,
        config,
        CancellationToken::new(),
        signal,
    )
    .await
    .unwrap();

    // scanned counts creations; nothing was alive, so nothing registered
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.alive, 0);
    assert!(registry.is_empty());
    assert!(!registry.results_available());
}

#[tokio::test]
async fn scan_captures_feeder_info_and_fetcher_snapshot() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let fetchers = FetcherRegistry::with_builtins().select(&["ip"]).unwrap();
    let feeder = RangeFeeder::parse("203.0.113.5").unwrap();

    run_scan(
        registry.clone(),
        &feeder,
        fetchers,
        no_io_config(),
        CancellationToken::new(),
        signal,
    )
    .await
    .unwrap();

    assert_eq!(registry.feeder_info(), "range: 203.0.113.5/32");
    let specs = registry.selected_fetchers();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].id, "ip");
    assert_eq!(specs[0].label, "IP");
}

#[tokio::test]
async fn the_stop_bridge_finalizes_the_summary_after_a_run() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let _bridge = spawn_stop_finalizer(registry.clone(), signal.subscribe());
    let fetchers = FetcherRegistry::with_builtins().select(&["ip"]).unwrap();
    let feeder = RangeFeeder::parse("203.0.113.1").unwrap();

    run_scan(
        registry.clone(),
        &feeder,
        fetchers,
        no_io_config(),
        CancellationToken::new(),
        signal,
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !registry.summary().finished {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stop bridge never finalized the summary");
}

#[tokio::test]
async fn a_cancelled_scan_still_ends_idle() {
    let registry = Arc::new(ScanRegistry::new());
    let signal = StateSignal::new();
    let fetchers = FetcherRegistry::with_builtins().select(&["ip"]).unwrap();
    let feeder = RangeFeeder::parse("198.51.100.0/28").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = run_scan(
        registry.clone(),
        &feeder,
        fetchers,
        no_io_config(),
        cancel,
        signal.clone(),
    )
    .await
    .unwrap();

    assert_eq!(signal.current(), ScanState::Idle);
    // the feed stopped immediately; nothing was probed
    assert_eq!(summary.scanned, 0);
    assert!(registry.is_empty());
}
