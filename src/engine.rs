use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feeder::Feeder;
use crate::fetchers::{Fetcher, ScanSubject};
use crate::lifecycle::{ScanState, StateSignal};
use crate::registry::{ScanRegistry, ScanSummary};
use crate::types::ScanResult;

/// Tunables for one scan run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrently probed addresses.
    pub concurrency: usize,
    /// Per-connect timeout.
    pub timeout: Duration,
    /// Also register hosts that answered nothing. Off by default, matching
    /// the usual hide-dead-hosts view.
    pub include_unresponsive: bool,
    /// Sweep list for the ports fetcher.
    pub ports: Vec<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 256,
            timeout: Duration::from_millis(400),
            include_unresponsive: false,
            ports: crate::ports::default_ports(),
        }
    }
}

/// Runs one full scan: feeds addresses into a bounded pool of probe tasks,
/// each of which obtains its entity from the registry, runs the selected
/// fetchers against it, and hands the completed entity to a single
/// registrar task for ordered registration.
///
/// Producers never hold the registry lock while probing; the registrar
/// serializes all registrations, so display positions are assigned in
/// completion order. On return the signal has transitioned to
/// [`ScanState::Idle`], whether the scan drained naturally or was
/// cancelled.
pub async fn run_scan(
    registry: Arc<ScanRegistry>,
    feeder: &dyn Feeder,
    fetchers: Vec<Arc<dyn Fetcher>>,
    config: EngineConfig,
    cancel: CancellationToken,
    signal: StateSignal,
) -> Result<ScanSummary> {
    let specs = fetchers.iter().map(|f| f.spec()).collect();
    registry.start_new_scan(feeder.info(), specs);
    signal.transition(ScanState::Scanning);

    let addresses = feeder.addresses();
    info!(
        targets = addresses.len(),
        fetchers = fetchers.len(),
        feeder = %registry.feeder_info(),
        "scan started"
    );

    let (done_tx, mut done_rx) = mpsc::channel::<Arc<ScanResult>>(256);
    let registrar = {
        let registry = registry.clone();
        let include_unresponsive = config.include_unresponsive;
        tokio::spawn(async move {
            while let Some(result) = done_rx.recv().await {
                if !include_unresponsive && !result.state().is_alive() {
                    continue;
                }
                // A duplicate here means the feeder emitted an address
                // twice and both probes completed; the second one loses.
                if let Err(err) = registry.register_tail(result) {
                    warn!(%err, "dropping completed result");
                }
            }
        })
    };

    let semaphore = Arc::new(Semaphore::new(config.concurrency.clamp(1, 5_000)));
    let sweep_ports = Arc::new(config.ports.clone());
    let mut probes = JoinSet::new();

    for address in addresses {
        if cancel.is_cancelled() {
            debug!("address feed interrupted by cancellation");
            break;
        }
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore in scope");
        let registry = registry.clone();
        let fetchers = fetchers.clone();
        let sweep_ports = sweep_ports.clone();
        let cancel = cancel.clone();
        let done_tx = done_tx.clone();
        let timeout = config.timeout;

        probes.spawn(async move {
            let _permit = permit; // keep the permit until the probe completes

            if cancel.is_cancelled() {
                return;
            }
            let result = registry.get_or_create(address);
            let mut subject = ScanSubject::new(address, timeout, sweep_ports);
            for (slot, fetcher) in fetchers.iter().enumerate() {
                if cancel.is_cancelled() {
                    break;
                }
                let value = fetcher.fetch(&mut subject).await;
                result.set_value(slot, value);
            }
            result.set_state(subject.classification());
            let _ = done_tx.send(result).await;
        });
    }
    drop(done_tx);

    while probes.join_next().await.is_some() {}
    registrar
        .await
        .map_err(|e| anyhow::anyhow!("registrar task failed: {e}"))?;

    signal.transition(ScanState::Idle);
    let summary = registry.summary();
    info!(
        scanned = summary.scanned,
        alive = summary.alive,
        with_ports = summary.with_ports,
        elapsed_ms = summary.elapsed().as_millis() as u64,
        "scan finished"
    );
    Ok(summary)
}
