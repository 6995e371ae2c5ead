//! One logical send: proxy choice, authentication round trips and
//! redirects around a sequence of network transactions.
//!
//! Roughly Chromium's URLRequestHttpJob.

use crate::base::neterror::{ErrorCategory, NetError};
use crate::base::timer::DeadlineTimer;
use crate::base::tracker::TrackedKind;
use crate::http::auth::{select_challenge, AuthChallengeInfo, AuthScheme};
use crate::http::body::BodyHandler;
use crate::http::redirect::{self, RedirectChain};
use crate::http::request::{HttpRequest, RequestHead};
use crate::http::response::{HttpResponse, PreviousResponse};
use crate::http::retry::AttemptError;
use crate::http::transaction::{Exchange, HttpNetworkTransaction, Route};
use crate::socket::authcache::{AuthEntry, AuthTarget};
use crate::socket::pool::RequestPriority;
use crate::socket::proxy::ProxySettings;
use crate::urlrequest::context::URLRequestContext;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use url::Url;

/// Send `request` and decode the final response body with `handler`.
pub(crate) async fn execute<T: Send + 'static>(
    context: &URLRequestContext,
    request: HttpRequest,
    handler: &BodyHandler<T>,
) -> Result<HttpResponse<T>, NetError> {
    let op = context.tracker.track(TrackedKind::PendingOperation);
    let timeout = request.timeout().or(context.config.request_timeout);

    let mut job = URLRequestHttpJob::new(context, request);
    let (exchange, previous) = with_deadline(&context.timer, timeout, job.start()).await?;

    let Exchange { info, body, tls } = exchange;
    let mut subscriber = handler.apply(&info);
    let value = subscriber.body();
    body.deliver(Box::new(subscriber), Some(op));
    let value = value.await?;
    Ok(HttpResponse::new(
        info.status,
        info.version,
        info.headers,
        job.request.url().clone(),
        value,
        tls,
        previous,
    ))
}

/// Run `work` until it finishes or `timeout` elapses on `timer`.
pub(crate) async fn with_deadline<F, T>(
    timer: &DeadlineTimer,
    timeout: Option<Duration>,
    work: F,
) -> Result<T, NetError>
where
    F: Future<Output = Result<T, NetError>>,
{
    let Some(timeout) = timeout else {
        return work.await;
    };
    let (fire, fired) = oneshot::channel();
    let _guard = timer.register(tokio::time::Instant::now() + timeout, move || {
        let _ = fire.send(());
    });
    tokio::select! {
        biased;
        out = work => out,
        Ok(()) = fired => Err(NetError::TimedOut),
    }
}

/// Proxies chosen for one origin and the one currently in use.
#[derive(Debug)]
struct ProxyChoice {
    proxies: Vec<ProxySettings>,
    current: usize,
}

impl ProxyChoice {
    fn proxy(&self) -> Option<&ProxySettings> {
        self.proxies.get(self.current)
    }
}

/// A challenge the authenticator was consulted for during this send.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChallengeKey {
    target: AuthTarget,
    host: String,
    port: u16,
    scheme: AuthScheme,
    realm: String,
}

/// Credentials attached to the last attempt.
#[derive(Default)]
struct SentAuth {
    server: Option<Arc<AuthEntry>>,
    proxy: Option<Arc<AuthEntry>>,
}

struct Attempt {
    exchange: Exchange,
    proxy: Option<ProxySettings>,
}

pub(crate) struct URLRequestHttpJob<'a> {
    context: &'a URLRequestContext,
    request: HttpRequest,
    proxies: HashMap<String, ProxyChoice>,
    asked: HashSet<ChallengeKey>,
    renewed: HashSet<ChallengeKey>,
    sent: SentAuth,
}

impl<'a> URLRequestHttpJob<'a> {
    pub fn new(context: &'a URLRequestContext, request: HttpRequest) -> Self {
        Self {
            context,
            request,
            proxies: HashMap::new(),
            asked: HashSet::new(),
            renewed: HashSet::new(),
            sent: SentAuth::default(),
        }
    }

    /// Drive the send up to the final response head.
    pub async fn start(&mut self) -> Result<(Exchange, Vec<PreviousResponse>), NetError> {
        let context = self.context;
        let config = &context.config;
        let mut chain = RedirectChain::new(&self.request, config.max_redirects);
        let mut previous = Vec::new();

        loop {
            let Attempt { exchange, proxy } = self.send_once().await?;
            let status = exchange.info.status;

            let retry_auth = match status {
                StatusCode::UNAUTHORIZED => self.on_server_challenge(&exchange)?,
                StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                    let Some(proxy) = proxy else {
                        exchange.body.drain(config.max_drain_bytes).await;
                        return Err(NetError::UnexpectedProxyAuth);
                    };
                    let values = exchange.info.headers.all_values("proxy-authenticate");
                    self.on_proxy_challenge(&proxy, values)?
                }
                _ => false,
            };
            if retry_auth {
                trace!(url = %self.request.url(), %status, "retrying with credentials");
                previous.push(self.previous(&exchange));
                exchange.body.drain(config.max_drain_bytes).await;
                continue;
            }

            let next = redirect::next_request(
                &self.request,
                status,
                &exchange.info.headers,
                config.redirect_policy,
            )?;
            let Some(next) = next else {
                return Ok((exchange, previous));
            };
            chain.follow(&next)?;
            debug!(from = %self.request.url(), to = %next.url(), %status, "following redirect");
            previous.push(self.previous(&exchange));
            exchange.body.drain(config.max_drain_bytes).await;
            self.request = next;
        }
    }

    fn previous(&self, exchange: &Exchange) -> PreviousResponse {
        PreviousResponse {
            status: exchange.info.status,
            headers: exchange.info.headers.clone(),
            url: self.request.url().clone(),
        }
    }

    /// One network transaction, falling back through the chosen proxies and
    /// answering proxy challenges on CONNECT.
    async fn send_once(&mut self) -> Result<Attempt, NetError> {
        let context = self.context;
        loop {
            let proxy = self.current_proxy();
            if proxy.is_some() {
                self.request.check_proxied(&context.header_policy)?;
            }
            let head = self.build_head()?;
            let route = Route {
                proxy_authorization: self.proxy_authorization(proxy.as_ref())?,
                proxy: proxy.clone(),
            };

            let mut transaction = HttpNetworkTransaction::new(&context.pool, &context.settings);
            transaction.set_version_policy(context.config.version_policy(self.request.version()));
            let result = transaction
                .start(
                    &head,
                    self.request.body(),
                    &route,
                    self.request.expect_continue(),
                    RequestPriority::default(),
                )
                .await;
            let failure = match result {
                Ok(exchange) => return Ok(Attempt { exchange, proxy }),
                Err(failure) => failure,
            };
            debug!(
                url = %self.request.url(),
                error = %failure.error,
                retries = transaction.retry_attempts(),
                state = transaction.load_state().as_str(),
                "transaction failed"
            );

            let Some(proxy) = proxy else {
                return Err(failure.error);
            };
            if let NetError::ProxyAuthRequested { challenges } = &failure.error {
                if self.on_proxy_challenge(&proxy, challenges.iter().map(String::as_str).collect())? {
                    continue;
                }
                return Err(failure.error);
            }
            if is_proxy_failure(&failure) {
                context.proxy.connect_failed(self.request.url(), &proxy, &failure.error);
                if self.advance_proxy() {
                    debug!(proxy = %proxy.identity(), "falling back to next proxy");
                    continue;
                }
            }
            return Err(failure.error);
        }
    }

    /// The proxy for the current origin. The selector is asked once per
    /// origin and send.
    fn current_proxy(&mut self) -> Option<ProxySettings> {
        let url = self.request.url();
        let origin = url.origin().ascii_serialization();
        let selector = &self.context.proxy;
        let choice = self.proxies.entry(origin).or_insert_with(|| {
            let proxies = selector.select(url);
            trace!(%url, count = proxies.len(), "proxies selected");
            ProxyChoice { proxies, current: 0 }
        });
        choice.proxy().cloned()
    }

    fn advance_proxy(&mut self) -> bool {
        let origin = self.request.url().origin().ascii_serialization();
        match self.proxies.get_mut(&origin) {
            Some(choice) if choice.current + 1 < choice.proxies.len() => {
                choice.current += 1;
                true
            }
            _ => false,
        }
    }

    /// Wire head for the current request, with default headers and cached
    /// server credentials.
    fn build_head(&mut self) -> Result<RequestHead, NetError> {
        let url = self.request.url();
        let mut headers = self.request.headers().as_map().clone();
        if !headers.contains_key(header::USER_AGENT) {
            if let Some(agent) = &self.context.config.user_agent {
                let value = HeaderValue::from_str(agent)
                    .map_err(|_| NetError::InvalidHeader { name: "user-agent".into() })?;
                headers.insert(header::USER_AGENT, value);
            }
        }

        self.sent.server = None;
        if !headers.contains_key(header::AUTHORIZATION) {
            let (host, port) = host_port(url)?;
            if let Some(entry) = self.context.auth_cache.preemptive(host, port, AuthTarget::Server) {
                let uri = request_uri(url);
                headers.insert(
                    header::AUTHORIZATION,
                    entry.authorization(self.request.method().as_str(), &uri)?,
                );
                self.sent.server = Some(entry);
            }
        }

        Ok(RequestHead { method: self.request.method().clone(), url: url.clone(), headers })
    }

    fn proxy_authorization(
        &mut self,
        proxy: Option<&ProxySettings>,
    ) -> Result<Option<HeaderValue>, NetError> {
        self.sent.proxy = None;
        let Some(proxy) = proxy else {
            return Ok(None);
        };
        let (host, port) = proxy.host_port().ok_or(NetError::ProxyConnectionFailed)?;
        if let Some(entry) = self.context.auth_cache.preemptive(host, port, AuthTarget::Proxy) {
            let url = self.request.url();
            let (method, uri) = if url.scheme() == "https" {
                let (target_host, target_port) = host_port(url)?;
                (Method::CONNECT, format!("{target_host}:{target_port}"))
            } else {
                let mut absolute = url.clone();
                absolute.set_fragment(None);
                (self.request.method().clone(), absolute.to_string())
            };
            let value = entry.authorization(method.as_str(), &uri)?;
            self.sent.proxy = Some(entry);
            return Ok(Some(value));
        }
        match proxy.auth_header() {
            Some(token) => {
                let mut value =
                    HeaderValue::from_str(&token).map_err(|_| NetError::InvalidAuthCredentials)?;
                value.set_sensitive(true);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn on_server_challenge(&mut self, exchange: &Exchange) -> Result<bool, NetError> {
        if self.request.headers().contains(header::AUTHORIZATION.as_str()) {
            // caller-managed credentials
            return Ok(false);
        }
        let url = self.request.url().clone();
        let (host, port) = host_port(&url)?;
        let values = exchange.info.headers.all_values("www-authenticate");
        let sent = self.sent.server.clone();
        self.on_challenge(AuthTarget::Server, host, port, values, &url, sent)
    }

    fn on_proxy_challenge(
        &mut self,
        proxy: &ProxySettings,
        values: Vec<&str>,
    ) -> Result<bool, NetError> {
        let (host, port) = proxy.host_port().ok_or(NetError::ProxyConnectionFailed)?;
        let url = self.request.url().clone();
        let sent = self.sent.proxy.clone();
        self.on_challenge(AuthTarget::Proxy, host, port, values, &url, sent)
    }

    /// Decide whether a 401/407 is answered with new credentials. The
    /// authenticator is consulted at most once per challenge and send.
    fn on_challenge(
        &mut self,
        target: AuthTarget,
        host: &str,
        port: u16,
        values: Vec<&str>,
        url: &Url,
        sent: Option<Arc<AuthEntry>>,
    ) -> Result<bool, NetError> {
        let Some((scheme, challenge)) = select_challenge(values) else {
            trace!(%host, "no supported auth challenge");
            return Ok(false);
        };
        let context = self.context;
        let cache = &context.auth_cache;
        let key = ChallengeKey {
            target,
            host: host.to_string(),
            port,
            scheme,
            realm: challenge.realm().to_string(),
        };

        if let Some(sent) = sent {
            let stale = challenge.param("stale").is_some_and(|s| s.eq_ignore_ascii_case("true"));
            if scheme == AuthScheme::Digest
                && sent.scheme() == AuthScheme::Digest
                && sent.realm() == key.realm
                && stale
                && self.renewed.insert(key.clone())
            {
                let entry = AuthEntry::new(scheme, &challenge, sent.credentials().clone())?;
                cache.store(host, port, target, entry);
                return Ok(true);
            }
            debug!(%host, realm = sent.realm(), "credentials rejected");
            cache.evict(host, port, sent.realm(), target);
        } else if let Some(cached) = cache.lookup(host, port, &key.realm, target) {
            // known realm that was not sent preemptively
            if !self.asked.contains(&key) && self.renewed.insert(key.clone()) {
                cache.store(host, port, target, AuthEntry::new(scheme, &challenge, cached.credentials().clone())?);
                return Ok(true);
            }
        }

        let Some(authenticator) = &context.authenticator else {
            return Ok(false);
        };
        if !self.asked.insert(key.clone()) {
            return Ok(false);
        }
        let info = AuthChallengeInfo {
            scheme,
            realm: key.realm.clone(),
            host: key.host.clone(),
            port,
            is_proxy: target == AuthTarget::Proxy,
            url: url.clone(),
        };
        let Some(credentials) = authenticator.authenticate(&info) else {
            return Ok(false);
        };
        cache.store(host, port, target, AuthEntry::new(scheme, &challenge, credentials)?);
        Ok(true)
    }
}

/// A failure that says more about the proxy than about the destination.
fn is_proxy_failure(failure: &AttemptError) -> bool {
    !failure.progress.connected
        && (failure.error.category() == ErrorCategory::Connect
            || matches!(failure.error, NetError::ConnectionTimedOut))
}

fn host_port(url: &Url) -> Result<(&str, u16), NetError> {
    let host = url.host_str().ok_or(NetError::InvalidUrl)?;
    let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
    Ok((host, port))
}

/// Request-target used in digest responses.
fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::neterror::NetError;
    use crate::http::retry::Progress;
    use tokio::time::Instant;

    #[test]
    fn test_proxy_failure_classification() {
        let early = AttemptError::early(NetError::ConnectionRefused);
        assert!(is_proxy_failure(&early));
        let timed_out = AttemptError::early(NetError::ConnectionTimedOut);
        assert!(is_proxy_failure(&timed_out));
        let late = AttemptError::new(
            NetError::ConnectionRefused,
            Progress { connected: true, ..Progress::default() },
        );
        assert!(!is_proxy_failure(&late));
        let tls = AttemptError::early(NetError::SslProtocolError);
        assert!(!is_proxy_failure(&tls));
    }

    #[test]
    fn test_request_uri() {
        let url = Url::parse("http://example.com/dir/index.html?x=1#frag").unwrap();
        assert_eq!(request_uri(&url), "/dir/index.html?x=1");
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let timer = DeadlineTimer::spawn(&tokio::runtime::Handle::current());
        let start = Instant::now();
        let result: Result<(), NetError> = with_deadline(
            &timer,
            Some(Duration::from_millis(50)),
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(NetError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(50));

        let fast = with_deadline(&timer, Some(Duration::from_secs(5)), async { Ok(7) }).await;
        assert_eq!(fast.unwrap(), 7);
    }
}
