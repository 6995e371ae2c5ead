//! `getaddrinfo` on the blocking pool, and connection-attempt ordering.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::debug;

/// The system resolver. IP literals are answered without a lookup.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            if let Some(literal) = AddressList::literal(name.as_str()) {
                return Ok(Box::new(literal.into_iter()) as Addrs);
            }
            let host = name.as_str().to_string();
            let lookup = tokio::task::spawn_blocking(move || {
                (host.as_str(), 0u16).to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            });
            let addrs = lookup
                .await
                .map_err(|_| NetError::NameNotResolved)?
                .dns_context(name.as_str())
                .inspect_err(|e| debug!(host = %name, error = %e, "lookup failed"))?;
            if addrs.is_empty() {
                return Err(NetError::NameNotResolvedFor {
                    domain: name.to_string(),
                    source: Arc::new(io::Error::new(io::ErrorKind::NotFound, "no addresses")),
                });
            }
            debug!(host = %name, count = addrs.len(), "resolved");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Addresses for one destination, in the order they are tried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList {
    addrs: Vec<SocketAddr>,
}

impl AddressList {
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self { addrs: addrs.into_iter().collect() }
    }

    /// `host` parsed as an IP address, if it is one.
    pub fn literal(host: &str) -> Option<Self> {
        let ip: IpAddr = host.parse().ok()?;
        Some(Self { addrs: vec![SocketAddr::new(ip, 0)] })
    }

    /// Every address aimed at `port`.
    pub fn with_port(mut self, port: u16) -> Self {
        for addr in &mut self.addrs {
            addr.set_port(port);
        }
        self
    }

    /// Alternate address families, starting with the family the resolver
    /// listed first (RFC 8305 section 4). Order within a family is kept.
    pub fn interleaved(self) -> Self {
        let Some(first) = self.addrs.first() else {
            return self;
        };
        let prefer_v6 = first.is_ipv6();
        let (preferred, other): (Vec<_>, Vec<_>) =
            self.addrs.into_iter().partition(|a| a.is_ipv6() == prefer_v6);
        let mut addrs = Vec::with_capacity(preferred.len() + other.len());
        let (mut preferred, mut other) = (preferred.into_iter(), other.into_iter());
        loop {
            match (preferred.next(), other.next()) {
                (None, None) => break,
                (a, b) => addrs.extend(a.into_iter().chain(b)),
            }
        }
        Self { addrs }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn as_slice(&self) -> &[SocketAddr] {
        &self.addrs
    }
}

impl IntoIterator for AddressList {
    type Item = SocketAddr;
    type IntoIter = std::vec::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> AddressList {
        AddressList::new(list.iter().map(|a| a.parse::<SocketAddr>().unwrap()))
    }

    #[test]
    fn test_literals() {
        assert_eq!(AddressList::literal("127.0.0.1"), Some(addrs(&["127.0.0.1:0"])));
        assert_eq!(AddressList::literal("::1"), Some(addrs(&["[::1]:0"])));
        assert_eq!(AddressList::literal("example.com"), None);
    }

    #[test]
    fn test_interleaves_families() {
        let list = addrs(&["[2001:db8::1]:0", "[2001:db8::2]:0", "[2001:db8::3]:0", "192.0.2.1:0"])
            .with_port(443)
            .interleaved();
        assert_eq!(
            list,
            addrs(&[
                "[2001:db8::1]:443",
                "192.0.2.1:443",
                "[2001:db8::2]:443",
                "[2001:db8::3]:443"
            ])
        );
        assert!(AddressList::default().interleaved().is_empty());
    }

    #[tokio::test]
    async fn test_literal_skips_lookup() {
        let found: Vec<_> = GaiResolver::new().resolve(Name::new("[::1]")).await.unwrap().collect();
        assert_eq!(found, vec!["[::1]:0".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let found: Vec<_> = GaiResolver::new().resolve(Name::new("localhost")).await.unwrap().collect();
        assert!(!found.is_empty());
    }
}
