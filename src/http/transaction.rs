//! One logical network exchange: connection, request and response head,
//! with a single resend after a connection failure.
//!
//! Follows Chromium's `HttpNetworkTransaction` state machine; redirects
//! and authentication live one level up in the job.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::tracker::TrackedOp;
use crate::http::body::wire::{self, RequestBodyStream};
use crate::http::body::{BodyPublisher, ResponseInfo, Subscriber};
use crate::http::h1::{H1Body, H1Options, H1Outcome};
use crate::http::h2::connection::H2Stream;
use crate::http::h2::{H2Config, H2Connection};
use crate::http::negotiate::{self, Negotiated, UpgradeState, VersionPolicy};
use crate::http::request::RequestHead;
use crate::http::retry::{should_retry, AttemptError, Progress, RetryConfig};
use crate::socket::pool::{ClientSocketPool, PoolKey, RequestPriority, SocketRequest};
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsInfo;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::StatusCode;
use tracing::{debug, trace};

/// Internal state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    CreateStream,
    SendRequest,
    ReadHeaders,
    Done,
}

impl State {
    fn to_load_state(self) -> LoadState {
        match self {
            State::Idle | State::Done => LoadState::Idle,
            State::CreateStream => LoadState::Connecting,
            State::SendRequest => LoadState::SendingRequest,
            State::ReadHeaders => LoadState::WaitingForResponse,
        }
    }
}

/// Protocol knobs shared by every transaction of a client.
#[derive(Debug, Clone)]
pub(crate) struct TransactionSettings {
    pub policy: VersionPolicy,
    pub h2: H2Config,
    pub h1: H1Options,
    pub retry: RetryConfig,
}

/// Where a transaction sends its request.
#[derive(Debug, Clone, Default)]
pub(crate) struct Route {
    pub proxy: Option<ProxySettings>,
    /// Sent to the proxy: on CONNECT for `https`, on the request itself for
    /// `http`.
    pub proxy_authorization: Option<HeaderValue>,
}

/// A response body still on the wire.
pub(crate) enum ResponseBody {
    Http1(H1Body),
    Http2(H2Stream),
}

impl ResponseBody {
    /// Stream the body into `subscriber` on a background task.
    pub fn deliver(self, subscriber: Box<dyn Subscriber<Bytes>>, guard: Option<TrackedOp>) {
        match self {
            ResponseBody::Http1(body) => wire::spawn_delivery(body, subscriber, guard),
            ResponseBody::Http2(stream) => wire::spawn_delivery(stream, subscriber, guard),
        }
    }

    /// Discard the body, reading at most `limit` bytes so the connection can
    /// be reused.
    pub async fn drain(self, limit: u64) {
        match self {
            ResponseBody::Http1(body) => wire::drain(body, limit).await,
            ResponseBody::Http2(stream) => wire::drain(stream, limit).await,
        }
    }
}

/// Response head plus the body left to read.
pub(crate) struct Exchange {
    pub info: ResponseInfo,
    pub body: ResponseBody,
    pub tls: Option<TlsInfo>,
}

pub(crate) struct HttpNetworkTransaction<'a> {
    pool: &'a ClientSocketPool,
    settings: &'a TransactionSettings,
    policy: VersionPolicy,
    state: State,
    attempts: usize,
}

impl<'a> HttpNetworkTransaction<'a> {
    pub fn new(pool: &'a ClientSocketPool, settings: &'a TransactionSettings) -> Self {
        Self { pool, settings, policy: settings.policy, state: State::Idle, attempts: 0 }
    }

    /// Override the client-wide protocol choice for this exchange.
    pub fn set_version_policy(&mut self, policy: VersionPolicy) {
        self.policy = policy;
    }

    pub fn load_state(&self) -> LoadState {
        self.state.to_load_state()
    }

    /// Resends performed by the last [`start`](Self::start).
    pub fn retry_attempts(&self) -> usize {
        self.attempts
    }

    /// Send `head` and wait for the final response head. A failed attempt is
    /// resent once when the server cannot have acted on it.
    pub async fn start(
        &mut self,
        head: &RequestHead,
        body: Option<&BodyPublisher>,
        route: &Route,
        expect_continue: bool,
        priority: RequestPriority,
    ) -> Result<Exchange, AttemptError> {
        self.attempts = 0;
        loop {
            self.state = State::CreateStream;
            match self.attempt(head, body, route, expect_continue, priority).await {
                Ok(exchange) => {
                    self.state = State::Done;
                    return Ok(exchange);
                }
                Err(failure) => {
                    let reason = should_retry(self.attempts, &head.method, &failure, &self.settings.retry);
                    let Some(reason) = reason else {
                        self.state = State::Done;
                        return Err(failure);
                    };
                    debug!(url = %head.url, ?reason, error = %failure.error, "resending request");
                    self.attempts += 1;
                }
            }
        }
    }

    async fn attempt(
        &mut self,
        head: &RequestHead,
        body: Option<&BodyPublisher>,
        route: &Route,
        expect_continue: bool,
        priority: RequestPriority,
    ) -> Result<Exchange, AttemptError> {
        let url = &head.url;
        let alpn = self.policy.alpn(url.scheme());
        let key = PoolKey::new(url, alpn, route.proxy.as_ref()).map_err(AttemptError::early)?;
        let proxy_authorization = route.proxy_authorization.as_ref().and_then(|v| v.to_str().ok());
        let request = SocketRequest {
            key: &key,
            target: url,
            proxy: route.proxy.as_ref(),
            proxy_authorization,
            priority,
        };

        let negotiated =
            negotiate::negotiate(self.pool, request, self.policy, &self.settings.h2, body.is_some())
                .await?;
        self.state = State::SendRequest;

        match negotiated {
            Negotiated::Http2 { session, reused } => {
                self.send_h2(&session, reused, head, body).await
            }
            Negotiated::Http1 { conn, upgrade } => {
                let mut head = head.clone();
                let plain_proxy = route.proxy.is_some() && url.scheme() == "http";
                if plain_proxy {
                    if let Some(value) = &route.proxy_authorization {
                        if !head.headers.contains_key(header::PROXY_AUTHORIZATION) {
                            head.append(header::PROXY_AUTHORIZATION, value.clone());
                        }
                    }
                }
                if upgrade == UpgradeState::Offered {
                    negotiate::offer_upgrade(&mut head, &self.settings.h2)
                        .map_err(AttemptError::early)?;
                }
                let options = H1Options {
                    absolute_form: plain_proxy,
                    expect_continue: expect_continue && body.is_some(),
                    ..self.settings.h1.clone()
                };
                self.state = State::ReadHeaders;
                let outcome = conn.exchange(&head, body, &options).await?;
                self.finish_h1(&key, upgrade, outcome).await
            }
        }
    }

    async fn send_h2(
        &mut self,
        session: &H2Connection,
        reused: bool,
        head: &RequestHead,
        body: Option<&BodyPublisher>,
    ) -> Result<Exchange, AttemptError> {
        let mut progress = Progress { connected: true, reused, ..Progress::default() };
        let stream_body = body.map(RequestBodyStream::open);
        let mut stream = session
            .send_request(head, stream_body)
            .await
            .map_err(|e| AttemptError::new(e, progress))?;
        self.state = State::ReadHeaders;
        match stream.response().await {
            Ok(info) => {
                trace!(stream_id = stream.id(), status = %info.status, "h2 response head");
                Ok(Exchange {
                    info,
                    body: ResponseBody::Http2(stream),
                    tls: session.tls_info().cloned(),
                })
            }
            Err(error) => {
                // refused and unprocessed streams were never acted on
                progress.request_sent = !matches!(
                    error,
                    NetError::Http2ServerRefusedStream | NetError::Http2GoAway { .. }
                );
                Err(AttemptError::new(error, progress))
            }
        }
    }

    async fn finish_h1(
        &mut self,
        key: &PoolKey,
        upgrade: UpgradeState,
        outcome: H1Outcome,
    ) -> Result<Exchange, AttemptError> {
        let sent = Progress { connected: true, request_sent: true, response_started: true, ..Progress::default() };
        match outcome {
            H1Outcome::Response { info, body, tls } => {
                if upgrade.on_response(false) == UpgradeState::Declined {
                    trace!(host = %key.host, "h2c upgrade declined");
                    self.pool.mark_h2c_declined(key);
                }
                Ok(Exchange { info, body: ResponseBody::Http1(body), tls })
            }
            H1Outcome::Switched { socket, buffered } => {
                if upgrade.on_response(true) != UpgradeState::Switched {
                    return Err(AttemptError::new(NetError::InvalidResponse, sent));
                }
                let (session, mut stream) =
                    negotiate::complete_upgrade(self.pool, key, socket, buffered, &self.settings.h2);
                let info = stream.response().await.map_err(|e| AttemptError::new(e, sent))?;
                if info.status == StatusCode::SWITCHING_PROTOCOLS {
                    return Err(AttemptError::new(NetError::InvalidResponse, sent));
                }
                Ok(Exchange { info, body: ResponseBody::Http2(stream), tls: session.tls_info().cloned() })
            }
        }
    }
}
