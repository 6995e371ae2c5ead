//! Client configuration and the shared state behind every request.
//!
//! Based on Chromium's net::URLRequestContext: one place owning the socket
//! pool, auth cache, proxy selection and timers for a client.

use crate::base::neterror::NetError;
use crate::base::timer::DeadlineTimer;
use crate::base::tracker::OperationTracker;
use crate::dns::{DnsResolverWithOverrides, GaiResolver, Resolve};
use crate::http::auth::Authenticator;
use crate::http::h1::H1Options;
use crate::http::h2::H2Config;
use crate::http::headers::HeaderPolicy;
use crate::http::negotiate::VersionPolicy;
use crate::http::redirect::{RedirectPolicy, DEFAULT_MAX_REDIRECTS};
use crate::http::retry::RetryConfig;
use crate::http::transaction::TransactionSettings;
use crate::socket::authcache::AuthCache;
use crate::socket::client::SocketOptions;
use crate::socket::connectjob::Connector;
use crate::socket::pool::{ClientSocketPool, PoolConfig};
use crate::socket::proxy::{EnvProxies, NoProxy, ProxySelector};
use crate::socket::tls::TlsConfig;
use http::Version;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Comma separated header names the client may set despite the restricted
/// list.
pub const ENV_ALLOW_RESTRICTED_HEADERS: &str = "PULSENET_ALLOW_RESTRICTED_HEADERS";
/// Any non-empty value other than `0` or `false` disables automatic resend.
pub const ENV_DISABLE_RETRY: &str = "PULSENET_DISABLE_RETRY";

const DEFAULT_USER_AGENT: &str = concat!("pulsenet/", env!("CARGO_PKG_VERSION"));

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    /// Sent unless the request sets its own `User-Agent`.
    pub user_agent: Option<String>,

    /// Preferred protocol. `None` uses h2 through ALPN on TLS and HTTP/1.1
    /// on plaintext; `HTTP_2` also tries `h2c` on plaintext; `HTTP_11` never
    /// offers h2.
    pub version: Option<Version>,

    /// Start plaintext HTTP/2 with the connection preface instead of an
    /// upgrade. Only used when `version` is `HTTP_2`.
    pub http2_prior_knowledge: bool,

    /// Default deadline for response headers.
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub expect_continue_timeout: Duration,

    pub redirect_policy: RedirectPolicy,
    pub max_redirects: usize,

    /// Resend once after a connection failure when safe.
    pub retry_on_connection_failure: bool,

    /// Restricted header names requests may set anyway.
    pub allow_restricted_headers: Vec<String>,

    pub pool: PoolConfig,
    pub socket: SocketOptions,
    pub tls: TlsConfig,
    pub h2: H2Config,

    /// Proxy selection (None for direct connections).
    pub proxy: Option<Arc<dyn ProxySelector>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,

    /// Custom DNS resolver (None = getaddrinfo).
    pub dns_resolver: Option<Arc<dyn Resolve>>,
    /// DNS hostname overrides (hostname -> addresses).
    pub dns_overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,

    /// Bytes read from an unwanted response body (redirects, auth
    /// challenges) to keep its connection reusable.
    pub max_drain_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            version: None,
            http2_prior_knowledge: false,
            request_timeout: None,
            connect_timeout: Duration::from_secs(30),
            expect_continue_timeout: Duration::from_secs(1),
            redirect_policy: RedirectPolicy::default(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry_on_connection_failure: true,
            allow_restricted_headers: Vec::new(),
            pool: PoolConfig::default(),
            socket: SocketOptions::default(),
            tls: TlsConfig::default(),
            h2: H2Config::default(),
            proxy: None,
            authenticator: None,
            dns_resolver: None,
            dns_overrides: HashMap::new(),
            max_drain_bytes: 64 * 1024,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user_agent", &self.user_agent)
            .field("version", &self.version)
            .field("http2_prior_knowledge", &self.http2_prior_knowledge)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("redirect_policy", &self.redirect_policy)
            .field("max_redirects", &self.max_redirects)
            .field("retry_on_connection_failure", &self.retry_on_connection_failure)
            .field("allow_restricted_headers", &self.allow_restricted_headers)
            .field("pool", &self.pool)
            .field("socket", &self.socket)
            .field("tls", &self.tls)
            .field("h2", &self.h2)
            .field("proxy", &self.proxy)
            .field("authenticator", &self.authenticator.is_some())
            .field("dns_resolver", &self.dns_resolver.is_some())
            .field("dns_overrides_count", &self.dns_overrides.len())
            .finish()
    }
}

impl ClientConfig {
    /// Defaults adjusted by the process environment: allowed restricted
    /// headers, retry switch and `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        let proxies = EnvProxies::from_env();
        if !proxies.is_empty() {
            config.proxy = Some(Arc::new(proxies));
        }
        config
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(names) = var(ENV_ALLOW_RESTRICTED_HEADERS) {
            self.allow_restricted_headers = names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_ascii_lowercase)
                .collect();
        }
        if let Some(flag) = var(ENV_DISABLE_RETRY) {
            let flag = flag.trim();
            if !flag.is_empty() && flag != "0" && !flag.eq_ignore_ascii_case("false") {
                self.retry_on_connection_failure = false;
            }
        }
    }

    pub(crate) fn version_policy(&self, version: Option<Version>) -> VersionPolicy {
        let version = version.or(self.version);
        VersionPolicy {
            h2_plaintext: version == Some(Version::HTTP_2),
            prior_knowledge: self.http2_prior_knowledge,
            http11_only: version == Some(Version::HTTP_11),
        }
    }
}

/// Shared state for every request of one client.
pub struct URLRequestContext {
    pub(crate) pool: ClientSocketPool,
    pub(crate) auth_cache: AuthCache,
    pub(crate) proxy: Arc<dyn ProxySelector>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) timer: DeadlineTimer,
    pub(crate) tracker: Arc<OperationTracker>,
    pub(crate) settings: TransactionSettings,
    pub(crate) header_policy: HeaderPolicy,
    pub(crate) config: ClientConfig,
}

impl fmt::Debug for URLRequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("URLRequestContext")
            .field("config", &self.config)
            .field("idle_sockets", &self.pool.idle_socket_count())
            .field("auth_entries", &self.auth_cache.len())
            .finish_non_exhaustive()
    }
}

impl URLRequestContext {
    /// Build the context, spawning its background tasks on `handle`.
    pub fn new(config: ClientConfig, handle: &Handle) -> Result<Self, NetError> {
        let header_policy = HeaderPolicy::allowing(config.allow_restricted_headers.iter())?;
        let tracker = OperationTracker::new();

        let base: Arc<dyn Resolve> =
            config.dns_resolver.clone().unwrap_or_else(|| Arc::new(GaiResolver::new()));
        let resolver: Arc<dyn Resolve> = if config.dns_overrides.is_empty() {
            base
        } else {
            Arc::new(DnsResolverWithOverrides::new(base, config.dns_overrides.clone()))
        };
        let connector = Connector {
            resolver,
            tls: config.tls.clone(),
            options: config.socket,
            connect_timeout: config.connect_timeout,
        };
        let pool = ClientSocketPool::new(config.pool.clone(), connector, Some(Arc::clone(&tracker)));
        pool.start_cleanup_task(handle);

        let settings = TransactionSettings {
            policy: config.version_policy(None),
            h2: config.h2.clone(),
            h1: H1Options {
                expect_continue_timeout: config.expect_continue_timeout,
                read_timeout: config.socket.read_timeout,
                ..H1Options::default()
            },
            retry: if config.retry_on_connection_failure {
                RetryConfig::default()
            } else {
                RetryConfig::no_retry()
            },
        };

        Ok(Self {
            pool,
            auth_cache: AuthCache::default(),
            proxy: config.proxy.clone().unwrap_or_else(|| Arc::new(NoProxy)),
            authenticator: config.authenticator.clone(),
            timer: DeadlineTimer::spawn(handle),
            tracker,
            settings,
            header_policy,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ClientSocketPool {
        &self.pool
    }

    pub fn auth_cache(&self) -> &AuthCache {
        &self.auth_cache
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    pub fn header_policy(&self) -> &HeaderPolicy {
        &self.header_policy
    }
}
