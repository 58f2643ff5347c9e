use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

/// Classification of one scanned host, set once its probing has finished.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// Probing has not finished yet.
    Unknown,
    Unresponsive,
    Alive,
    /// Alive, and at least one fetcher found service-level information
    /// (open ports, banners, certificates).
    AliveWithInfo,
}

impl HostState {
    pub fn is_alive(self) -> bool {
        matches!(self, HostState::Alive | HostState::AliveWithInfo)
    }

    pub fn has_info(self) -> bool {
        matches!(self, HostState::AliveWithInfo)
    }
}

/// One typed cell value produced by a fetcher.
///
/// Sorting and searching operate on the `Display` rendering, so every
/// variant must render to a stable, human-meaningful string.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResultValue {
    Text(String),
    Int(i64),
    /// A latency measurement in milliseconds.
    Millis(u64),
    Addr(IpAddr),
    Ports(Vec<u16>),
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Text(s) => f.write_str(s),
            ResultValue::Int(n) => write!(f, "{n}"),
            ResultValue::Millis(ms) => write!(f, "{ms} ms"),
            ResultValue::Addr(ip) => write!(f, "{ip}"),
            ResultValue::Ports(ports) => {
                let mut first = true;
                for p in ports {
                    if !first {
                        f.write_str(",")?;
                    }
                    write!(f, "{p}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// Descriptor of one fetcher as selected for a scan. The registry captures
/// an ordered snapshot of these at scan start; slot `i` of every result
/// holds the value produced by fetcher `i` of that snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FetcherSpec {
    pub id: String,
    pub label: String,
}

#[derive(Debug)]
struct ResultCells {
    values: Vec<Option<ResultValue>>,
    state: HostState,
}

/// Everything known about one scanned address.
///
/// The address is the immutable identity; the cells are filled in by
/// producers after creation, behind the entity's own lock, so the registry
/// lock never has to be held while a probe is in flight.
#[derive(Debug)]
pub struct ScanResult {
    address: IpAddr,
    cells: Mutex<ResultCells>,
}

impl ScanResult {
    pub(crate) fn new(address: IpAddr, slots: usize) -> Self {
        Self {
            address,
            cells: Mutex::new(ResultCells {
                values: vec![None; slots],
                state: HostState::Unknown,
            }),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn slot_count(&self) -> usize {
        self.lock_cells().values.len()
    }

    /// Stores `value` into the given slot. Slots outside the fetcher
    /// snapshot this entity was sized for are ignored.
    pub fn set_value(&self, slot: usize, value: Option<ResultValue>) {
        let mut cells = self.lock_cells();
        if let Some(cell) = cells.values.get_mut(slot) {
            *cell = value;
        }
    }

    /// Rendered text of the value in `slot`, or `None` if the slot is
    /// absent or out of range.
    pub fn value_text(&self, slot: usize) -> Option<String> {
        let cells = self.lock_cells();
        cells
            .values
            .get(slot)
            .and_then(|v| v.as_ref())
            .map(|v| v.to_string())
    }

    /// Copies the current values out, in slot order.
    pub fn values(&self) -> Vec<Option<ResultValue>> {
        self.lock_cells().values.clone()
    }

    pub fn state(&self) -> HostState {
        self.lock_cells().state
    }

    pub fn set_state(&self, state: HostState) {
        self.lock_cells().state = state;
    }

    /// Serializable snapshot of this entity, for the JSON read path and
    /// file export.
    pub fn row(&self) -> ResultRow {
        let cells = self.lock_cells();
        ResultRow {
            address: self.address,
            state: cells.state,
            values: cells.values.clone(),
        }
    }

    fn lock_cells(&self) -> MutexGuard<'_, ResultCells> {
        self.cells.lock().expect("result cells mutex poisoned")
    }
}

/// Flattened, serializable view of one [`ScanResult`].
#[derive(Serialize, Debug, Clone)]
pub struct ResultRow {
    pub address: IpAddr,
    pub state: HostState,
    pub values: Vec<Option<ResultValue>>,
}
