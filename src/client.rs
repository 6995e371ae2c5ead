//! HTTP client with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use pulsenet::{BodyHandler, Client};
//!
//! # async fn run() -> Result<(), pulsenet::NetError> {
//! let client = Client::builder().build()?;
//! let request = client.get("https://example.com/").build()?;
//! let response = client.send(request, BodyHandler::string()).await?;
//! println!("{} {}", response.status(), response.body());
//! # Ok(())
//! # }
//! ```

use crate::base::cancel::CancelToken;
use crate::base::completion::Completion;
use crate::base::neterror::NetError;
use crate::base::tracker::{OperationTracker, TrackerSnapshot};
use crate::http::auth::Authenticator;
use crate::http::body::BodyHandler;
use crate::http::redirect::RedirectPolicy;
use crate::http::request::{HttpRequest, HttpRequestBuilder};
use crate::http::response::HttpResponse;
use crate::socket::authcache::AuthCache;
use crate::socket::pool::{ClientSocketPool, PoolConfig};
use crate::socket::proxy::ProxySelector;
use crate::socket::tls::TlsConfig;
use crate::urlrequest::context::{ClientConfig, URLRequestContext};
use crate::urlrequest::job;
use futures::future::{self, Either};
use http::Version;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::debug;

/// HTTP client. Cheap to clone; clones share connections, credentials and
/// timers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    context: URLRequestContext,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("context", &self.inner.context)
            .field("owns_runtime", &self.inner.runtime.is_some())
            .finish()
    }
}

impl Client {
    /// Client with default settings.
    pub fn new() -> Result<Self, NetError> {
        ClientBuilder::default().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Request builder accepting the restricted headers this client allows.
    pub fn request(&self) -> HttpRequestBuilder {
        HttpRequest::builder().header_policy(self.inner.context.header_policy().clone())
    }

    /// Start building a GET request.
    pub fn get(&self, url: &str) -> HttpRequestBuilder {
        self.request().uri(url)
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.context.config()
    }

    pub fn pool(&self) -> &ClientSocketPool {
        self.inner.context.pool()
    }

    /// Credentials learned from server and proxy challenges.
    pub fn auth_cache(&self) -> &AuthCache {
        self.inner.context.auth_cache()
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        self.inner.context.tracker()
    }

    /// Outstanding exchanges, streams, operations and connections.
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.tracker().snapshot()
    }

    /// Send `request` and decode the body with `handler`.
    pub async fn send<T: Send + 'static>(
        &self,
        request: HttpRequest,
        handler: BodyHandler<T>,
    ) -> Result<HttpResponse<T>, NetError> {
        job::execute(&self.inner.context, request, &handler).await
    }

    /// Send on the client's runtime and return immediately.
    pub fn send_async<T: Send + 'static>(
        &self,
        request: HttpRequest,
        handler: BodyHandler<T>,
    ) -> ResponseFuture<T> {
        let completion = Completion::new();
        let done = Arc::clone(&completion);
        let client = self.clone();
        let task = self.inner.handle.spawn(async move {
            let result = job::execute(&client.inner.context, request, &handler).await;
            done.complete(result);
        });
        ResponseFuture { completion, abort: task.abort_handle() }
    }

    /// Send and block the calling thread until the body is decoded. Must not
    /// be called from inside an async task.
    pub fn send_blocking<T: Send + 'static>(
        &self,
        request: HttpRequest,
        handler: BodyHandler<T>,
    ) -> Result<HttpResponse<T>, NetError> {
        futures::executor::block_on(self.send_async(request, handler))
    }

    /// Like [`send_blocking`](Self::send_blocking), returning `Interrupted`
    /// as soon as `cancel` fires. A token cancelled beforehand fails without
    /// touching the network.
    pub fn send_blocking_with_cancel<T: Send + 'static>(
        &self,
        request: HttpRequest,
        handler: BodyHandler<T>,
        cancel: &CancelToken,
    ) -> Result<HttpResponse<T>, NetError> {
        if cancel.is_cancelled() {
            return Err(NetError::Interrupted);
        }
        let response = self.send_async(request, handler);
        let abort = response.abort.clone();
        let cancelled = Box::pin(cancel.cancelled());
        match futures::executor::block_on(future::select(response, cancelled)) {
            Either::Left((result, _)) => result,
            Either::Right(((), _)) => {
                debug!("blocking send interrupted");
                abort.abort();
                Err(NetError::Interrupted)
            }
        }
    }
}

/// Handle to a send running in the background.
pub struct ResponseFuture<T> {
    completion: Arc<Completion<Result<HttpResponse<T>, NetError>>>,
    abort: AbortHandle,
}

impl<T: Send + 'static> ResponseFuture<T> {
    /// Run `callback` with the result instead of awaiting it. Called
    /// immediately when the send already finished.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Result<HttpResponse<T>, NetError>) + Send + 'static,
    {
        self.completion.on_complete(callback);
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_complete()
    }

    /// Abandon the send. Pending callers observe `Cancelled`.
    pub fn cancel(&self) {
        self.abort.abort();
        self.completion.complete(Err(NetError::Cancelled));
    }
}

impl<T: Send + 'static> Future for ResponseFuture<T> {
    type Output = Result<HttpResponse<T>, NetError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.completion.poll_take(cx) {
            Poll::Ready(Some(result)) => Poll::Ready(result),
            Poll::Ready(None) => Poll::Ready(Err(NetError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

/// Builder for [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start from an explicit configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from [`ClientConfig::from_env`].
    pub fn from_env() -> Self {
        Self { config: ClientConfig::from_env() }
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.config.version = Some(version);
        self
    }

    pub fn http2_prior_knowledge(mut self) -> Self {
        self.config.version = Some(Version::HTTP_2);
        self.config.http2_prior_knowledge = true;
        self
    }

    /// Default deadline for response headers.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.config.redirect_policy = policy;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    pub fn retry_on_connection_failure(mut self, enable: bool) -> Self {
        self.config.retry_on_connection_failure = enable;
        self
    }

    pub fn allow_restricted_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allow_restricted_headers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn proxy(mut self, selector: impl ProxySelector + 'static) -> Self {
        self.config.proxy = Some(Arc::new(selector));
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.config.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Resolve `host` to `addrs` instead of asking DNS.
    pub fn resolve(mut self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        self.config.dns_overrides.insert(host.to_ascii_lowercase().into(), addrs);
        self
    }

    /// Build the client. Inside a tokio runtime the client uses it;
    /// otherwise it starts its own multi-thread runtime.
    pub fn build(self) -> Result<Client, NetError> {
        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .thread_name("pulsenet-worker")
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };
        let context = {
            let _enter = handle.enter();
            URLRequestContext::new(self.config, &handle)?
        };
        Ok(Client { inner: Arc::new(ClientRef { context, handle, runtime }) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_runtime_and_pre_cancelled_send() {
        let client = Client::new().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let request = client.get("http://127.0.0.1:9/").build().unwrap();
        let result = client.send_blocking_with_cancel(request, BodyHandler::discarding(), &token);
        assert!(matches!(result, Err(NetError::Interrupted)));
        assert_eq!(client.pool().total_active_count(), 0);
        assert!(client.snapshot().is_idle());
    }

    #[tokio::test]
    async fn test_ambient_runtime() {
        let client = Client::builder().allow_restricted_headers(["host"]).build().unwrap();
        let request = client.get("http://example.com/").header("Host", "other.example").build();
        assert!(request.is_ok());
        let default = Client::new().unwrap();
        let rejected = default.get("http://example.com/").header("Host", "other.example").build();
        assert!(matches!(rejected, Err(NetError::RestrictedHeader { .. })));
    }
}
