use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::ScanRegistry;

/// Externally driven scan states, at the granularity this crate reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No scan in progress; also the fully-stopped end of a scan, whether
    /// it completed naturally or was aborted.
    Idle,
    Scanning,
    /// Abort requested; producers are draining.
    Stopping,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "running",
            ScanState::Stopping => "stopping",
        }
    }
}

/// Broadcast handle for scan state transitions, backed by a watch channel.
/// Clone freely; all clones publish to the same subscribers.
#[derive(Clone)]
pub struct StateSignal {
    tx: Arc<watch::Sender<ScanState>>,
}

impl StateSignal {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(ScanState::Idle).0),
        }
    }

    /// Publishes `next`, returning the state it replaced.
    pub fn transition(&self, next: ScanState) -> ScanState {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "scan state transition");
        }
        previous
    }

    pub fn current(&self) -> ScanState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.tx.subscribe()
    }
}

impl Default for StateSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the bridge task that stamps the registry's summary when the scan
/// fully stops.
///
/// Fires on every transition into [`ScanState::Idle`];
/// [`ScanRegistry::finalize_summary`] makes repeated notifications within
/// one session no-ops, so the end time is recorded exactly once. The task
/// ends when the signal's last sender is dropped.
pub fn spawn_stop_finalizer(
    registry: Arc<ScanRegistry>,
    mut states: watch::Receiver<ScanState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if state == ScanState::Idle && registry.finalize_summary() {
                debug!("scan summary finalized");
            }
        }
    })
}
