//! NO_PROXY rule matching.

use std::net::IpAddr;
use url::Url;

/// Bypass rules in curl's NO_PROXY dialect: comma separated domains (a
/// leading dot is optional and subdomains always match), IP addresses,
/// CIDR ranges and `*` for everything. A `:port` suffix on a domain entry
/// is ignored.
#[derive(Debug, Clone, Default)]
pub struct ProxyMatcher {
    domains: Vec<String>,
    networks: Vec<(IpAddr, u8)>,
    match_all: bool,
}

impl ProxyMatcher {
    /// Rules from `NO_PROXY`, then `no_proxy`.
    pub fn from_env() -> Self {
        let raw = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")).unwrap_or_default();
        Self::from_string(&raw)
    }

    pub fn from_string(no_proxy: &str) -> Self {
        let mut matcher = ProxyMatcher::default();
        for part in no_proxy.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "*" {
                matcher.match_all = true;
            } else if let Some(net) = parse_network(part) {
                matcher.networks.push(net);
            } else {
                let domain = match part.rsplit_once(':') {
                    Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
                    _ => part,
                };
                matcher.domains.push(domain.trim_start_matches('.').to_ascii_lowercase());
            }
        }
        matcher
    }

    pub fn is_empty(&self) -> bool {
        !self.match_all && self.domains.is_empty() && self.networks.is_empty()
    }

    pub fn should_bypass(&self, host: &str) -> bool {
        if self.match_all {
            return true;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.networks.iter().any(|(net, prefix)| cidr_contains(*net, *prefix, ip));
        }
        let host = host.to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || host.strip_suffix(domain.as_str()).is_some_and(|rest| rest.ends_with('.'))
        })
    }

    pub fn should_bypass_url(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|h| self.should_bypass(h))
    }
}

/// `addr` or `addr/prefix`; a bare address is a full-length prefix.
fn parse_network(entry: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
        None => (entry, None),
    };
    let ip = addr.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().ok()?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    Some((ip, prefix.unwrap_or(max).min(max)))
}

fn cidr_contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard() {
        let m = ProxyMatcher::from_string("*");
        assert!(m.should_bypass("anything.com"));
        assert!(m.should_bypass("192.168.1.1"));
    }

    #[test]
    fn test_domains() {
        let m = ProxyMatcher::from_string(".example.com, other.org:8080");
        assert!(m.should_bypass("example.com"));
        assert!(m.should_bypass("WWW.Example.com"));
        assert!(!m.should_bypass("notexample.com"));
        assert!(m.should_bypass("a.other.org"));
    }

    #[test]
    fn test_addresses_and_ranges() {
        let m = ProxyMatcher::from_string("10.0.0.5, 192.168.1.0/24, ::1, 2001:db8::/32");
        assert!(m.should_bypass("10.0.0.5"));
        assert!(!m.should_bypass("10.0.0.6"));
        assert!(m.should_bypass("192.168.1.254"));
        assert!(!m.should_bypass("192.168.2.1"));
        assert!(m.should_bypass("[::1]"));
        assert!(m.should_bypass("2001:db8::1"));
        assert!(!m.should_bypass("2001:db9::1"));
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let m = ProxyMatcher::from_string("0.0.0.0/0");
        assert!(m.should_bypass("8.8.8.8"));
        assert!(!m.should_bypass("::1"));
        assert!(ProxyMatcher::from_string(" , ").is_empty());
    }
}
