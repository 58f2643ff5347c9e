use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use time::OffsetDateTime;

use crate::types::{FetcherSpec, ScanResult};

/// Contract violations surfaced by the registry. None of these are retried
/// internally; retry policy belongs to the scanning pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A producer tried to register the same address twice. This is a broken
    /// producer contract, not a recoverable condition.
    #[error("{address} is already registered in the result list")]
    DuplicateRegistration { address: IpAddr },

    #[error("{address} is not registered in the result list")]
    NotRegistered { address: IpAddr },

    #[error("position {position} is out of range (len {len})")]
    OutOfRange { position: usize, len: usize },
}

/// Running counters and timestamps for one scan session.
///
/// Counters only move as a side effect of registry mutations: `scanned` in
/// [`ScanRegistry::get_or_create`], `alive`/`with_ports` in
/// [`ScanRegistry::register`]. The whole summary is replaced by
/// [`ScanRegistry::start_new_scan`].
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub started_at: OffsetDateTime,
    started: Instant,
    ended: Option<Duration>,
    pub scanned: u64,
    pub alive: u64,
    pub with_ports: u64,
    pub finished: bool,
}

impl ScanSummary {
    fn new() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            ended: None,
            scanned: 0,
            alive: 0,
            with_ports: 0,
            finished: false,
        }
    }

    /// Total scan time. While the scan is still running this is the time
    /// from start until now; once finalized it is frozen.
    pub fn elapsed(&self) -> Duration {
        match self.ended {
            Some(ended) => ended,
            None => self.started.elapsed(),
        }
    }
}

struct RegistryInner {
    /// Display order of registered results.
    sequence: Vec<Arc<ScanResult>>,
    /// address -> current position in `sequence`. Exactly one entry per
    /// element of `sequence`; must agree with it whenever the lock is
    /// released.
    index: HashMap<IpAddr, usize>,
    /// Created but not yet registered entities, so a second `get_or_create`
    /// for the same address hands back the same entity instead of
    /// allocating (and counting) it twice.
    pending: HashMap<IpAddr, Arc<ScanResult>>,
    /// Fetchers captured at scan start; frozen for the session.
    selected: Arc<[FetcherSpec]>,
    feeder_info: String,
    summary: ScanSummary,
}

/// The holder of scanning results.
///
/// One instance is shared by all producer tasks and the reader for the
/// duration of a scan session. A single mutex guards the sequence/index
/// pair (plus the summary, which mutates in lockstep); entity cell locks
/// are only ever taken while holding either nothing or the registry lock,
/// in that order.
pub struct ScanRegistry {
    inner: Mutex<RegistryInner>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sequence: Vec::new(),
                index: HashMap::new(),
                pending: HashMap::new(),
                selected: Arc::from(Vec::new()),
                feeder_info: String::new(),
                summary: ScanSummary::new(),
            }),
        }
    }

    /// Returns the entity already known for `address`, or allocates a new
    /// one sized to the selected-fetcher snapshot. Allocation counts the
    /// address as scanned, exactly once. This is the single authoritative
    /// "have we seen this address" check, so it takes the lock for the
    /// whole lookup-or-allocate step.
    ///
    /// Callers fill in the returned entity's values without holding the
    /// registry lock, then hand it to [`ScanRegistry::register`].
    pub fn get_or_create(&self, address: IpAddr) -> Arc<ScanResult> {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(&address) {
            return inner.sequence[pos].clone();
        }
        if let Some(existing) = inner.pending.get(&address) {
            return existing.clone();
        }
        let result = Arc::new(ScanResult::new(address, inner.selected.len()));
        inner.pending.insert(address, result.clone());
        inner.summary.scanned += 1;
        result
    }

    /// Inserts `result` into the display order at `position`; positions of
    /// later entries shift up and their index entries are re-pointed in the
    /// same critical section.
    ///
    /// Registering an address twice is a producer protocol violation and
    /// fails with [`RegistryError::DuplicateRegistration`], leaving the
    /// registry unchanged.
    pub fn register(&self, position: usize, result: Arc<ScanResult>) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        inner.register_at(position, result)
    }

    /// Appends `result` at the end of the display order. Same contract as
    /// [`ScanRegistry::register`], but the position is taken under the lock
    /// so it cannot race with a concurrent `remove` or `sort`.
    pub fn register_tail(&self, result: Arc<ScanResult>) -> Result<usize, RegistryError> {
        let mut inner = self.lock();
        let position = inner.sequence.len();
        inner.register_at(position, result)?;
        Ok(position)
    }

    pub fn is_registered(&self, result: &ScanResult) -> bool {
        self.lock().index.contains_key(&result.address())
    }

    /// Current display position of a registered result.
    pub fn position_of(&self, result: &ScanResult) -> Result<usize, RegistryError> {
        let inner = self.lock();
        inner
            .index
            .get(&result.address())
            .copied()
            .ok_or(RegistryError::NotRegistered {
                address: result.address(),
            })
    }

    pub fn get(&self, position: usize) -> Result<Arc<ScanResult>, RegistryError> {
        let inner = self.lock();
        inner
            .sequence
            .get(position)
            .cloned()
            .ok_or(RegistryError::OutOfRange {
                position,
                len: inner.sequence.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.lock().sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sequence.is_empty()
    }

    /// True once at least one result has been registered.
    pub fn results_available(&self) -> bool {
        !self.is_empty()
    }

    /// Drops all results and the selected-fetcher snapshot.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Prepares for a new scan: clears previous results, freezes the given
    /// fetcher snapshot and feeder description, and replaces the summary.
    /// Callers must quiesce producers of the previous session first.
    pub fn start_new_scan(&self, feeder_info: String, selected: Vec<FetcherSpec>) {
        let mut inner = self.lock();
        inner.clear();
        inner.selected = Arc::from(selected);
        inner.feeder_info = feeder_info;
        inner.summary = ScanSummary::new();
    }

    /// Removes the results at the given positions (any order, duplicates
    /// ignored), preserving the relative order of the kept results. The
    /// sequence and index are rebuilt in one linear pass, which beats
    /// shifting the tail once per removed position.
    pub fn remove(&self, positions: &[usize]) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let len = inner.sequence.len();
        if let Some(&bad) = positions.iter().find(|&&p| p >= len) {
            return Err(RegistryError::OutOfRange { position: bad, len });
        }
        let doomed: HashSet<usize> = positions.iter().copied().collect();
        let mut sequence = Vec::with_capacity(len - doomed.len());
        let mut index = HashMap::with_capacity(len - doomed.len());
        for (pos, result) in inner.sequence.drain(..).enumerate() {
            if !doomed.contains(&pos) {
                index.insert(result.address(), sequence.len());
                sequence.push(result);
            }
        }
        inner.sequence = sequence;
        inner.index = index;
        Ok(())
    }

    /// Reorders the results ascending by the rendered text of the value in
    /// `column`. Absent values sort first. Ordering between equal keys is
    /// unspecified. The index is rebuilt from the new order before the lock
    /// is released.
    pub fn sort_by_column(&self, column: usize) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if column >= inner.selected.len() {
            return Err(RegistryError::OutOfRange {
                position: column,
                len: inner.selected.len(),
            });
        }
        let mut keyed: Vec<(Option<String>, Arc<ScanResult>)> = inner
            .sequence
            .drain(..)
            .map(|r| (r.value_text(column), r))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        inner.sequence = keyed.into_iter().map(|(_, r)| r).collect();
        inner.index = inner
            .sequence
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.address(), pos))
            .collect();
        Ok(())
    }

    /// Forward-scans from `start` for the first result whose rendered
    /// values contain `text` (case sensitive), checking slots in column
    /// order and skipping absent values. Returns `None` when nothing
    /// matches.
    ///
    /// The structural lock is held for the whole scan, so the returned
    /// position refers to a consistent snapshot: a concurrent `remove`
    /// cannot shift row identities mid-search.
    pub fn find_text(&self, text: &str, start: usize) -> Option<usize> {
        let inner = self.lock();
        let slots = inner.selected.len();
        for pos in start..inner.sequence.len() {
            let result = &inner.sequence[pos];
            for slot in 0..slots {
                if let Some(rendered) = result.value_text(slot) {
                    if rendered.contains(text) {
                        return Some(pos);
                    }
                }
            }
        }
        None
    }

    /// Renders one result as human-readable text, one `Label:\tvalue` line
    /// per selected fetcher, in column order. Used by the details view.
    pub fn render_row(&self, position: usize) -> Result<String, RegistryError> {
        let inner = self.lock();
        let result = inner
            .sequence
            .get(position)
            .ok_or(RegistryError::OutOfRange {
                position,
                len: inner.sequence.len(),
            })?;
        let newline = if cfg!(windows) { "\r\n" } else { "\n" };
        let mut out = String::new();
        for (slot, spec) in inner.selected.iter().enumerate() {
            out.push_str(&spec.label);
            out.push_str(":\t");
            if let Some(rendered) = result.value_text(slot) {
                out.push_str(&rendered);
            }
            out.push_str(newline);
        }
        Ok(out)
    }

    /// Copy of the current display order. The snapshot reflects registry
    /// state at the moment of the call only; results registered or removed
    /// afterwards are not reflected (weak consistency).
    pub fn snapshot(&self) -> Vec<Arc<ScanResult>> {
        self.lock().sequence.clone()
    }

    /// The fetcher snapshot captured at scan start. May differ from the
    /// live fetcher registry, which can be re-selected at any time.
    pub fn selected_fetchers(&self) -> Arc<[FetcherSpec]> {
        self.lock().selected.clone()
    }

    /// Description of the address source used for this scan.
    pub fn feeder_info(&self) -> String {
        self.lock().feeder_info.clone()
    }

    pub fn summary(&self) -> ScanSummary {
        self.lock().summary.clone()
    }

    /// Stamps the summary when the scan fully stops. Idempotent: only the
    /// first call per session records the end time; returns whether this
    /// call did.
    pub fn finalize_summary(&self) -> bool {
        let mut inner = self.lock();
        if inner.summary.finished {
            return false;
        }
        inner.summary.ended = Some(inner.summary.started.elapsed());
        inner.summary.finished = true;
        true
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("registry mutex poisoned")
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.lock();
        assert_eq!(inner.index.len(), inner.sequence.len());
        for (addr, &pos) in &inner.index {
            assert_eq!(inner.sequence[pos].address(), *addr);
        }
    }
}

impl Default for ScanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryInner {
    fn register_at(&mut self, position: usize, result: Arc<ScanResult>) -> Result<(), RegistryError> {
        let address = result.address();
        if self.index.contains_key(&address) {
            return Err(RegistryError::DuplicateRegistration { address });
        }
        if position > self.sequence.len() {
            return Err(RegistryError::OutOfRange {
                position,
                len: self.sequence.len(),
            });
        }
        self.pending.remove(&address);
        let state = result.state();
        self.sequence.insert(position, result);
        self.index.insert(address, position);
        for pos in position + 1..self.sequence.len() {
            self.index.insert(self.sequence[pos].address(), pos);
        }
        if state.is_alive() {
            self.summary.alive += 1;
        }
        if state.has_info() {
            self.summary.with_ports += 1;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.sequence.clear();
        self.index.clear();
        self.pending.clear();
        self.selected = Arc::from(Vec::new());
    }
}
