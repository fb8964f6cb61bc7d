use ipnetwork::IpNetwork;
use lazy_static::lazy_static;
use std::net::{IpAddr, SocketAddr};

lazy_static! {
    static ref NON_PUBLIC_NETWORKS: Vec<IpNetwork> = [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .filter_map(|network| network.parse().ok())
    .collect();
}

/// Returns true for addresses a geo database has nothing useful to say
/// about: private, loopback, link-local, multicast and unspecified ranges.
pub fn is_private(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };

    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || NON_PUBLIC_NETWORKS.iter().any(|network| network.contains(ip))
}

/// Parses an address that may carry a port (`1.2.3.4:80`, `[::1]:443`).
pub fn parse_host(value: &str) -> Option<IpAddr> {
    let value = value.trim();

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }

    value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value)
        .parse()
        .ok()
}

/// The addresses a request may claim as its client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAddr {
    pub remote_addr: String,
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
}

impl ClientAddr {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    /// Candidate client IPs in the order they should be tried: the peer
    /// address, then one proxy-supplied address (the first
    /// `X-Forwarded-For` hop, else `X-Real-IP`).
    pub fn candidates(&self) -> Vec<IpAddr> {
        let mut candidates: Vec<IpAddr> = parse_host(&self.remote_addr).into_iter().collect();

        let forwarded = self
            .forwarded_for
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .and_then(|v| v.split(',').next())
            .and_then(parse_host);
        let proxied = forwarded.or_else(|| self.real_ip.as_deref().and_then(parse_host));

        if let Some(ip) = proxied {
            if !candidates.contains(&ip) {
                candidates.push(ip);
            }
        }

        candidates
    }
}
