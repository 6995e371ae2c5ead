//! Proxy settings and proxy selection.

use super::matcher::ProxyMatcher;
use crate::base::neterror::NetError;
use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;
use zeroize::Zeroizing;

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// HTTP proxy: absolute-form requests, CONNECT for `https` targets.
    Http,
    /// TLS to the proxy itself. Not supported for connecting.
    Https,
    /// Not supported for connecting.
    Socks5,
}

/// One proxy with optional credentials and NO_PROXY bypass rules.
#[derive(Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.com:8080`)
    pub url: Url,
    pub username: Option<String>,
    /// Zeroized on drop.
    pub password: Option<Zeroizing<String>>,
    bypass: ProxyMatcher,
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl ProxySettings {
    pub fn new(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str).ok()?;
        url.host_str()?;
        Some(Self { url, username: None, password: None, bypass: ProxyMatcher::default() })
    }

    /// Proxy for `scheme` from the environment.
    ///
    /// `https` targets use `HTTPS_PROXY`/`https_proxy`, `http` targets
    /// `HTTP_PROXY`/`http_proxy`; bypass rules come from `NO_PROXY`.
    pub fn from_env(scheme: &str) -> Option<Self> {
        let names: [&str; 2] = match scheme {
            "https" => ["HTTPS_PROXY", "https_proxy"],
            _ => ["HTTP_PROXY", "http_proxy"],
        };
        let url_str = names.iter().find_map(|n| std::env::var(n).ok().filter(|v| !v.is_empty()))?;
        let mut settings = Self::new(&url_str)?;
        if !settings.url.username().is_empty() {
            let user = settings.url.username().to_string();
            let pass = settings.url.password().unwrap_or_default().to_string();
            settings = settings.with_auth(&user, &pass);
        }
        settings.bypass = ProxyMatcher::from_env();
        Some(settings)
    }

    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Add bypass rules from a NO_PROXY style string.
    pub fn with_bypass(mut self, no_proxy: &str) -> Self {
        self.bypass = ProxyMatcher::from_string(no_proxy);
        self
    }

    pub fn proxy_type(&self) -> ProxyType {
        match self.url.scheme() {
            "https" => ProxyType::Https,
            "socks5" | "socks5h" | "socks4" | "socks4a" => ProxyType::Socks5,
            _ => ProxyType::Http,
        }
    }

    pub fn should_bypass(&self, target: &Url) -> bool {
        self.bypass.should_bypass_url(target)
    }

    /// `Proxy-Authorization` value for configured credentials.
    pub fn auth_header(&self) -> Option<Zeroizing<String>> {
        let (user, pass) = (self.username.as_ref()?, self.password.as_ref()?);
        let creds = Zeroizing::new(format!("{}:{}", user, pass.as_str()));
        Some(Zeroizing::new(format!("Basic {}", general_purpose::STANDARD.encode(creds.as_bytes()))))
    }

    pub fn host_port(&self) -> Option<(&str, u16)> {
        let host = self.url.host_str()?;
        let port = self.url.port().unwrap_or(match self.proxy_type() {
            ProxyType::Http => 80,
            ProxyType::Https => 443,
            ProxyType::Socks5 => 1080,
        });
        Some((host, port))
    }

    /// Stable identity used in pool keys: `scheme://host:port`.
    pub fn identity(&self) -> String {
        match self.host_port() {
            Some((host, port)) => format!("{}://{}:{}", self.url.scheme(), host, port),
            None => self.url.to_string(),
        }
    }
}

/// Chooses the proxies for a request.
///
/// The client consults the selector once per logical send and origin;
/// retries and authentication round trips reuse the answer.
pub trait ProxySelector: Send + Sync + fmt::Debug {
    /// Proxies to try for `target`, in order. Empty means DIRECT.
    fn select(&self, target: &Url) -> Vec<ProxySettings>;

    /// Connecting to `target` through `proxy` failed with `error`.
    fn connect_failed(&self, _target: &Url, _proxy: &ProxySettings, _error: &NetError) {}
}

/// Always DIRECT.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _target: &Url) -> Vec<ProxySettings> {
        Vec::new()
    }
}

impl ProxySelector for ProxySettings {
    fn select(&self, target: &Url) -> Vec<ProxySettings> {
        if self.should_bypass(target) {
            Vec::new()
        } else {
            vec![self.clone()]
        }
    }
}

/// Per-scheme proxies read from `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`.
#[derive(Debug, Clone, Default)]
pub struct EnvProxies {
    http: Option<ProxySettings>,
    https: Option<ProxySettings>,
}

impl EnvProxies {
    pub fn from_env() -> Self {
        Self { http: ProxySettings::from_env("http"), https: ProxySettings::from_env("https") }
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

impl ProxySelector for EnvProxies {
    fn select(&self, target: &Url) -> Vec<ProxySettings> {
        let proxy = if target.scheme() == "https" { &self.https } else { &self.http };
        proxy.as_ref().map(|p| p.select(target)).unwrap_or_default()
    }
}

/// Round-robin over several proxies. The rest of the rotation follows the
/// chosen proxy as fallbacks.
pub struct ProxyPool {
    proxies: Vec<ProxySettings>,
    index: AtomicUsize,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxySettings>) -> Self {
        Self { proxies, index: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl ProxySelector for ProxyPool {
    fn select(&self, target: &Url) -> Vec<ProxySettings> {
        if self.proxies.is_empty() {
            return Vec::new();
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        self.proxies
            .iter()
            .cycle()
            .skip(start)
            .take(self.proxies.len())
            .filter(|p| !p.should_bypass(target))
            .cloned()
            .collect()
    }

    fn connect_failed(&self, target: &Url, proxy: &ProxySettings, error: &NetError) {
        tracing::debug!(target = %target, proxy = %proxy.identity(), error = %error, "proxy failed");
    }
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool").field("count", &self.proxies.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_auth_header() {
        let p = ProxySettings::new("http://proxy:3128").unwrap().with_auth("user", "pass");
        assert_eq!(p.auth_header().unwrap().as_str(), "Basic dXNlcjpwYXNz");
        assert!(!format!("{p:?}").contains("pass\""));
    }

    #[test]
    fn test_bypass_returns_direct() {
        let p = ProxySettings::new("http://proxy:3128").unwrap().with_bypass("localhost,.internal");
        assert!(p.select(&url("http://localhost/")).is_empty());
        assert!(p.select(&url("http://api.internal/")).is_empty());
        assert_eq!(p.select(&url("http://example.com/")).len(), 1);
    }

    #[test]
    fn test_identity_and_type() {
        let p = ProxySettings::new("http://proxy").unwrap();
        assert_eq!(p.identity(), "http://proxy:80");
        assert_eq!(p.proxy_type(), ProxyType::Http);
        assert_eq!(ProxySettings::new("socks5://s:1").unwrap().proxy_type(), ProxyType::Socks5);
    }

    #[test]
    fn test_pool_rotates() {
        let pool = ProxyPool::new(vec![
            ProxySettings::new("http://a:1").unwrap(),
            ProxySettings::new("http://b:1").unwrap(),
        ]);
        let first = pool.select(&url("http://x/"));
        let second = pool.select(&url("http://x/"));
        assert_eq!(first[0].identity(), "http://a:1");
        assert_eq!(first[1].identity(), "http://b:1");
        assert_eq!(second[0].identity(), "http://b:1");
        assert!(NoProxy.select(&url("http://x/")).is_empty());
    }
}
