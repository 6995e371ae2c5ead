//! The resolver seam and host overrides.

use crate::base::neterror::NetError;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

/// A hostname as handed to a resolver: lowercase, IPv6 brackets removed.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    pub fn new(host: &str) -> Self {
        let bare = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        Self { host: bare.to_ascii_lowercase().into_boxed_str() }
    }

    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// Resolved addresses. Ports are not meaningful; the connect job sets the
/// destination port on each.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Hostname lookup, roughly Chromium's `HostResolver`.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Answers configured hostnames from a fixed table and everything else
/// from `inner`. Lookups ignore ASCII case.
pub struct DnsResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: Arc<HashMap<Name, Vec<SocketAddr>>>,
}

impl DnsResolverWithOverrides {
    pub fn new(
        inner: Arc<dyn Resolve>,
        overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    ) -> Self {
        let overrides = overrides.into_iter().map(|(host, addrs)| (Name::new(&host), addrs)).collect();
        Self { inner, overrides: Arc::new(overrides) }
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        match self.overrides.get(&name) {
            Some(addrs) => {
                tracing::trace!(host = %name, count = addrs.len(), "resolved from overrides");
                let addrs: Addrs = Box::new(addrs.clone().into_iter());
                Box::pin(std::future::ready(Ok(addrs)))
            }
            None => self.inner.resolve(name),
        }
    }
}

impl fmt::Debug for DnsResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolverWithOverrides")
            .field("hosts", &self.overrides.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_normalization() {
        assert_eq!(Name::new("API.Example.COM").as_str(), "api.example.com");
        assert_eq!(Name::new("[::1]").as_str(), "::1");
        assert_eq!(Name::new("[broken").as_str(), "[broken");
    }

    /// Fails every lookup so a miss is visible.
    struct Unreachable;

    impl Resolve for Unreachable {
        fn resolve(&self, _name: Name) -> Resolving {
            Box::pin(async { Err(NetError::NameNotResolved) })
        }
    }

    #[tokio::test]
    async fn test_overrides_ignore_case() {
        let pinned: SocketAddr = "10.0.0.7:0".parse().unwrap();
        let resolver = DnsResolverWithOverrides::new(
            Arc::new(Unreachable),
            HashMap::from([(Cow::Borrowed("Api.Test"), vec![pinned])]),
        );
        assert_eq!(resolver.override_count(), 1);

        let addrs: Vec<_> = resolver.resolve(Name::new("api.TEST")).await.unwrap().collect();
        assert_eq!(addrs, vec![pinned]);
        assert!(matches!(
            resolver.resolve(Name::new("other.test")).await,
            Err(NetError::NameNotResolved)
        ));
    }
}
