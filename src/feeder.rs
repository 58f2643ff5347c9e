use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use tracing::warn;

/// Supplies the addresses for one scan, plus the descriptive text the
/// registry records as the session's feeder info.
pub trait Feeder: Send + Sync {
    fn info(&self) -> String;

    /// The addresses to scan, in feed order, without duplicates.
    fn addresses(&self) -> Vec<IpAddr>;
}

/// Feeds the host addresses of one or more IPv4 networks.
pub struct RangeFeeder {
    nets: Vec<IpNet>,
}

impl RangeFeeder {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    /// Parse a comma-separated list of CIDRs and plain IP addresses.
    /// A plain address becomes a single-host network.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut nets = Vec::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let net = if entry.contains('/') {
                entry
                    .parse::<IpNet>()
                    .with_context(|| format!("invalid CIDR: {entry}"))?
            } else {
                let ip = entry
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid IP address: {entry}"))?;
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                IpNet::new(ip, prefix).expect("host prefix is always valid")
            };
            nets.push(net);
        }
        Ok(Self::new(nets))
    }

    /// Feeder over the default /24 networks of all local non-loopback IPv4
    /// interfaces.
    pub fn detect_local() -> Result<Self> {
        Ok(Self::new(detect_local_cidrs()?))
    }
}

impl Feeder for RangeFeeder {
    fn info(&self) -> String {
        let nets: Vec<String> = self.nets.iter().map(|n| n.to_string()).collect();
        format!("range: {}", nets.join(", "))
    }

    fn addresses(&self) -> Vec<IpAddr> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for net in &self.nets {
            for ip in expand_net(*net) {
                if seen.insert(ip) {
                    out.push(ip);
                }
            }
        }
        out
    }
}

/// Detect local non-loopback IPv4 addresses and convert each to a default
/// /24 CIDR network, sorted and deduplicated.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    let mut cidrs: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    cidrs.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(cidrs)
}

/// Convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).expect("/24 is always valid")
}

/// Expand a network into scannable host addresses.
///
/// Networks of /30 and wider exclude the network and broadcast addresses;
/// /31 and /32 yield every address, so a plain-IP target scans itself.
/// IPv6 networks are not scanned and yield nothing.
fn expand_net(net: IpNet) -> Vec<IpAddr> {
    let n4 = match net {
        IpNet::V4(n4) => n4,
        IpNet::V6(_) => {
            warn!(%net, "IPv6 targets are not supported, skipping");
            return Vec::new();
        }
    };
    let start = u32::from(n4.network());
    let end = u32::from(n4.broadcast());
    let (lo, hi) = if n4.prefix_len() >= 31 {
        (start, end)
    } else {
        (start + 1, end - 1)
    };
    (lo..=hi).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect()
}
