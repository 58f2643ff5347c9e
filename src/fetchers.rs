use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::types::{FetcherSpec, HostState, ResultValue};

/// Mutable probing context for one address, threaded through the selected
/// fetchers in column order. Fetchers upgrade the liveness classification
/// as they learn more; it never downgrades.
pub struct ScanSubject {
    address: IpAddr,
    timeout: Duration,
    sweep_ports: Arc<Vec<u16>>,
    state: HostState,
    open_ports: Vec<u16>,
}

impl ScanSubject {
    pub fn new(address: IpAddr, timeout: Duration, sweep_ports: Arc<Vec<u16>>) -> Self {
        Self {
            address,
            timeout,
            sweep_ports,
            state: HostState::Unknown,
            open_ports: Vec::new(),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sweep_ports(&self) -> &[u16] {
        &self.sweep_ports
    }

    pub fn mark_alive(&mut self) {
        if !self.state.is_alive() {
            self.state = HostState::Alive;
        }
    }

    pub fn mark_with_info(&mut self) {
        self.state = HostState::AliveWithInfo;
    }

    pub fn note_open_ports(&mut self, ports: &[u16]) {
        self.open_ports = ports.to_vec();
    }

    pub fn first_open_port(&self) -> Option<u16> {
        self.open_ports.first().copied()
    }

    /// Final classification once every selected fetcher has run: a host
    /// nothing responded for is unresponsive, not unknown.
    pub fn classification(&self) -> HostState {
        match self.state {
            HostState::Unknown => HostState::Unresponsive,
            other => other,
        }
    }
}

/// One value producer. A scan captures an ordered selection of these at
/// start; fetcher `i` of the selection fills slot `i` of every result.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    /// Stable identifier used for selection.
    fn id(&self) -> &'static str;

    /// Column header and details-view row label.
    fn label(&self) -> &'static str;

    async fn fetch(&self, subject: &mut ScanSubject) -> Option<ResultValue>;

    fn spec(&self) -> FetcherSpec {
        FetcherSpec {
            id: self.id().to_string(),
            label: self.label().to_string(),
        }
    }
}

/// Identity column: the scanned address itself.
#[derive(Debug)]
pub struct IpFetcher;

#[async_trait]
impl Fetcher for IpFetcher {
    fn id(&self) -> &'static str {
        "ip"
    }

    fn label(&self) -> &'static str {
        "IP"
    }

    async fn fetch(&self, subject: &mut ScanSubject) -> Option<ResultValue> {
        Some(ResultValue::Addr(subject.address()))
    }
}

/// TCP connect liveness probe. Tries a few well-known ports and reports the
/// round-trip of the first one that answers; a refused connection is an
/// answer too, so it counts as alive.
#[derive(Debug)]
pub struct PingFetcher;

const PROBE_PORTS: &[u16] = &[80, 443, 22, 445];

#[async_trait]
impl Fetcher for PingFetcher {
    fn id(&self) -> &'static str {
        "ping"
    }

    fn label(&self) -> &'static str {
        "Ping"
    }

    async fn fetch(&self, subject: &mut ScanSubject) -> Option<ResultValue> {
        for &port in PROBE_PORTS {
            let addr = SocketAddr::new(subject.address(), port);
            let start = Instant::now();
            match time::timeout(subject.timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    subject.mark_alive();
                    return Some(ResultValue::Millis(start.elapsed().as_millis() as u64));
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    subject.mark_alive();
                    return Some(ResultValue::Millis(start.elapsed().as_millis() as u64));
                }
                _ => {}
            }
        }
        None
    }
}

/// Sweeps the configured port list with concurrent connect attempts and
/// reports the open ones in ascending order.
#[derive(Debug)]
pub struct PortsFetcher;

#[async_trait]
impl Fetcher for PortsFetcher {
    fn id(&self) -> &'static str {
        "ports"
    }

    fn label(&self) -> &'static str {
        "Open ports"
    }

    async fn fetch(&self, subject: &mut ScanSubject) -> Option<ResultValue> {
        let address = subject.address();
        let timeout = subject.timeout();
        let ports: Vec<u16> = subject.sweep_ports().to_vec();

        let mut set = JoinSet::new();
        for port in ports {
            let addr = SocketAddr::new(address, port);
            set.spawn(async move {
                match time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(_stream)) => Some(port),
                    _ => None,
                }
            });
        }

        let mut open = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(port)) = joined {
                open.push(port);
            }
        }
        if open.is_empty() {
            return None;
        }
        open.sort_unstable();
        subject.note_open_ports(&open);
        subject.mark_with_info();
        Some(ResultValue::Ports(open))
    }
}

/// Short passive banner grab from the first known-open port, falling back
/// to port 80 when the port sweep did not run before this fetcher.
#[derive(Debug)]
pub struct BannerFetcher;

#[async_trait]
impl Fetcher for BannerFetcher {
    fn id(&self) -> &'static str {
        "banner"
    }

    fn label(&self) -> &'static str {
        "Banner"
    }

    async fn fetch(&self, subject: &mut ScanSubject) -> Option<ResultValue> {
        let port = subject.first_open_port().unwrap_or(80);
        let addr = SocketAddr::new(subject.address(), port);
        let mut stream = match time::timeout(subject.timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            _ => return None,
        };
        subject.mark_alive();
        read_banner(&mut stream).await.map(ResultValue::Text)
    }
}

/// Try to read up to 256 bytes with a short timeout and convert to a lossy
/// single-line UTF-8 string.
async fn read_banner(stream: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf).to_string();
            Some(s.replace('\n', "\\n").replace('\r', "\\r"))
        }
        _ => None,
    }
}

/// TLS handshake against port 443; reports the subject of the peer's
/// certificate. Certificate validity is deliberately not enforced, this is
/// reconnaissance, not trust establishment.
#[derive(Debug)]
pub struct TlsFetcher;

#[async_trait]
impl Fetcher for TlsFetcher {
    fn id(&self) -> &'static str {
        "tls"
    }

    fn label(&self) -> &'static str {
        "TLS subject"
    }

    async fn fetch(&self, subject: &mut ScanSubject) -> Option<ResultValue> {
        let addr = SocketAddr::new(subject.address(), 443);
        let stream = match time::timeout(subject.timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            _ => return None,
        };
        subject.mark_alive();

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .ok()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let domain = subject.address().to_string();
        let tls = match time::timeout(subject.timeout(), connector.connect(&domain, stream)).await {
            Ok(Ok(t)) => t,
            _ => return None,
        };
        subject.mark_with_info();

        let der = tls
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()?
            .to_der()
            .ok()?;
        let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
        Some(ResultValue::Text(cert.subject().to_string()))
    }
}

/// The built-in fetchers in display order, with selection by id.
pub struct FetcherRegistry {
    available: Vec<Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn with_builtins() -> Self {
        Self {
            available: vec![
                Arc::new(IpFetcher),
                Arc::new(PingFetcher),
                Arc::new(PortsFetcher),
                Arc::new(BannerFetcher),
                Arc::new(TlsFetcher),
            ],
        }
    }

    pub fn all(&self) -> &[Arc<dyn Fetcher>] {
        &self.available
    }

    /// Resolve an id list into fetchers, preserving the requested order.
    pub fn select<S: AsRef<str>>(&self, ids: &[S]) -> anyhow::Result<Vec<Arc<dyn Fetcher>>> {
        let mut selection = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            let fetcher = self
                .available
                .iter()
                .find(|f| f.id() == id)
                .cloned()
                .ok_or_else(|| {
                    let known: Vec<&str> = self.available.iter().map(|f| f.id()).collect();
                    anyhow::anyhow!("unknown fetcher '{id}' (known: {})", known.join(", "))
                })?;
            selection.push(fetcher);
        }
        Ok(selection)
    }

    /// The selection used when the caller does not ask for anything
    /// specific: address, liveness, open ports.
    pub fn default_selection(&self) -> Vec<Arc<dyn Fetcher>> {
        self.select(&["ip", "ping", "ports"])
            .expect("built-in ids are always known")
    }
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn subject() -> ScanSubject {
        ScanSubject::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_millis(100),
            Arc::new(vec![80, 443]),
        )
    }

    #[test]
    fn classification_never_downgrades() {
        let mut s = subject();
        assert_eq!(s.classification(), HostState::Unresponsive);
        s.mark_alive();
        assert_eq!(s.classification(), HostState::Alive);
        s.mark_with_info();
        s.mark_alive();
        assert_eq!(s.classification(), HostState::AliveWithInfo);
    }

    #[test]
    fn selection_preserves_requested_order() {
        let registry = FetcherRegistry::with_builtins();
        let selection = registry.select(&["ports", "ip"]).unwrap();
        let ids: Vec<&str> = selection.iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec!["ports", "ip"]);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let registry = FetcherRegistry::with_builtins();
        let err = registry.select(&["bogus"]).unwrap_err();
        assert!(err.to_string().contains("unknown fetcher"));
    }

    #[test]
    fn specs_carry_display_labels() {
        let registry = FetcherRegistry::with_builtins();
        let specs: Vec<_> = registry
            .default_selection()
            .iter()
            .map(|f| f.spec())
            .collect();
        assert_eq!(specs[0].id, "ip");
        assert_eq!(specs[0].label, "IP");
        assert_eq!(specs[2].label, "Open ports");
    }

    #[tokio::test]
    async fn ip_fetcher_needs_no_network() {
        let mut s = subject();
        let value = IpFetcher.fetch(&mut s).await;
        assert_eq!(
            value,
            Some(ResultValue::Addr(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        );
        // identity alone says nothing about liveness
        assert_eq!(s.classification(), HostState::Unresponsive);
    }
}
