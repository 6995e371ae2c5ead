//! One HTTP/1.1 exchange on a leased pool connection.

use super::codec::{
    self, encode_chunk, encode_head, BodyFraming, ChunkedDecoder, Decoded, RequestFraming,
    ResponseHead, LAST_CHUNK,
};
use crate::base::neterror::NetError;
use crate::base::tracker::{TrackedKind, TrackedOp};
use crate::http::body::wire::{BodyEnd, RequestBodyStream, WireBody};
use crate::http::body::{BodyPublisher, ResponseInfo};
use crate::http::request::RequestHead;
use crate::http::retry::{AttemptError, Progress};
use crate::socket::client::SocketType;
use crate::socket::pool::PoolLease;
use crate::socket::tls::TlsInfo;
use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderValue};
use http::StatusCode;
use std::borrow::Cow;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

const READ_CHUNK: usize = 16 * 1024;

/// Per-exchange knobs.
#[derive(Debug, Clone)]
pub(crate) struct H1Options {
    /// Request-target in absolute form, for a plain HTTP proxy.
    pub absolute_form: bool,
    pub expect_continue: bool,
    pub expect_continue_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for H1Options {
    fn default() -> Self {
        Self {
            absolute_form: false,
            expect_continue: false,
            expect_continue_timeout: Duration::from_secs(1),
            read_timeout: None,
        }
    }
}

/// Where the exchange is. Mirrors the states of Chromium's HttpStreamParser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    SendingHeaders,
    SendingBody,
    AwaitingResponse,
    ReadingHeaders,
    ReadingBody,
    Closed,
}

/// What an exchange produced.
pub(crate) enum H1Outcome {
    Response { info: ResponseInfo, body: H1Body, tls: Option<TlsInfo> },
    /// `101 Switching Protocols`: the transport now speaks another protocol.
    /// `buffered` holds bytes read past the `101` head.
    Switched { socket: SocketType, buffered: BytesMut },
}

struct Exchanged {
    response: ResponseHead,
    framing: BodyFraming,
    keep_alive: bool,
}

/// Exclusive HTTP/1.1 connection for the duration of one exchange.
pub(crate) struct H1Connection {
    lease: PoolLease,
    buf: BytesMut,
    state: ExchangeState,
    read_timeout: Option<Duration>,
    progress: Progress,
    op: Option<TrackedOp>,
}

impl H1Connection {
    pub fn new(lease: PoolLease) -> Self {
        let op = lease.pool().tracker().map(|t| t.track(TrackedKind::Http1Exchange));
        let progress = Progress { connected: true, reused: lease.is_reused(), ..Progress::default() };
        Self {
            lease,
            buf: BytesMut::with_capacity(READ_CHUNK),
            state: ExchangeState::Idle,
            read_timeout: None,
            progress,
            op,
        }
    }

    /// Send `head` (and `body`) and read the response head. On failure the
    /// connection is discarded.
    pub async fn exchange(
        mut self,
        head: &RequestHead,
        body: Option<&BodyPublisher>,
        options: &H1Options,
    ) -> Result<H1Outcome, AttemptError> {
        self.read_timeout = options.read_timeout;
        let exchanged = match self.run(head, body, options).await {
            Ok(exchanged) => exchanged,
            Err(error) => {
                debug!(host = %self.lease.key().host, state = ?self.state, error = %error, "h1 exchange failed");
                let progress = self.progress;
                self.state = ExchangeState::Closed;
                self.lease.discard();
                return Err(AttemptError::new(error, progress));
            }
        };

        let Exchanged { response, framing, keep_alive } = exchanged;
        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            trace!(host = %self.lease.key().host, "switching protocols");
            let progress = self.progress;
            let (socket, _connection) =
                self.lease.detach().map_err(|e| AttemptError::new(e, progress))?;
            return Ok(H1Outcome::Switched { socket, buffered: self.buf });
        }

        self.state = ExchangeState::ReadingBody;
        let tls = self.lease.socket().and_then(SocketType::tls_info);
        let info = ResponseInfo {
            status: response.status,
            headers: response.headers,
            version: response.version,
        };
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            _ => 0,
        };
        let body = H1Body {
            lease: Some(self.lease),
            buf: self.buf,
            framing,
            remaining,
            decoder: ChunkedDecoder::default(),
            keep_alive,
            done: framing == BodyFraming::Empty,
            read_timeout: self.read_timeout,
            _op: self.op,
        };
        Ok(H1Outcome::Response { info, body, tls })
    }

    async fn run(
        &mut self,
        head: &RequestHead,
        body: Option<&BodyPublisher>,
        options: &H1Options,
    ) -> Result<Exchanged, NetError> {
        let framing =
            RequestFraming::choose(&head.method, &head.headers, body.map(|b| b.content_length()));
        let expect = options.expect_continue && body.is_some();
        let head: Cow<'_, RequestHead> = if expect {
            let mut owned = head.clone();
            owned.append(header::EXPECT, HeaderValue::from_static("100-continue"));
            Cow::Owned(owned)
        } else {
            Cow::Borrowed(head)
        };

        self.state = ExchangeState::SendingHeaders;
        let mut out = BytesMut::with_capacity(1024);
        encode_head(&head, framing, options.absolute_form, &mut out);
        self.write(&out).await?;
        self.progress.request_sent = true;

        let mut final_early = None;
        if let Some(body) = body {
            if expect {
                self.state = ExchangeState::AwaitingResponse;
                match tokio::time::timeout(options.expect_continue_timeout, self.read_interim()).await
                {
                    Ok(Ok(None)) => trace!("100 Continue received"),
                    Ok(Ok(Some(response))) => final_early = Some(response),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => trace!("no interim response, sending body anyway"),
                }
            }
            if final_early.is_none() {
                self.state = ExchangeState::SendingBody;
                self.send_body(body, framing).await?;
            }
        }

        self.state = ExchangeState::ReadingHeaders;
        let skipped_body = final_early.is_some();
        let response = match final_early {
            Some(response) => response,
            None => self.read_final_head().await?,
        };
        let framing = codec::response_framing(&head.method, &response)?;
        let keep_alive = response.is_keep_alive()
            && !skipped_body
            && !requests_close(&head)
            && framing != BodyFraming::CloseDelimited;
        Ok(Exchanged { response, framing, keep_alive })
    }

    async fn send_body(&mut self, body: &BodyPublisher, framing: RequestFraming) -> Result<(), NetError> {
        let mut stream = RequestBodyStream::open(body);
        let mut sent: u64 = 0;
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next_chunk().await? {
            sent += chunk.len() as u64;
            match framing {
                RequestFraming::Chunked => {
                    out.clear();
                    encode_chunk(&chunk, &mut out);
                    self.write(&out).await?;
                }
                RequestFraming::Length(expected) => {
                    if sent > expected {
                        return Err(NetError::ContentLengthMismatch);
                    }
                    self.write(&chunk).await?;
                }
                RequestFraming::None => {}
            }
        }
        match framing {
            RequestFraming::Chunked => self.write(LAST_CHUNK).await,
            RequestFraming::Length(expected) if sent != expected => {
                Err(NetError::ContentLengthMismatch)
            }
            _ => Ok(()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), NetError> {
        let socket = self.lease.socket_mut()?;
        socket.write_all(data).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Interim responses after `Expect: 100-continue`: `None` on
    /// `100 Continue`, the head of a final response otherwise.
    async fn read_interim(&mut self) -> Result<Option<ResponseHead>, NetError> {
        loop {
            let response = self.read_head().await?;
            if response.status == StatusCode::CONTINUE {
                return Ok(None);
            }
            if response.status.is_informational()
                && response.status != StatusCode::SWITCHING_PROTOCOLS
            {
                continue;
            }
            return Ok(Some(response));
        }
    }

    /// Skip informational responses other than `101`.
    async fn read_final_head(&mut self) -> Result<ResponseHead, NetError> {
        loop {
            let response = self.read_head().await?;
            if response.status.is_informational()
                && response.status != StatusCode::SWITCHING_PROTOCOLS
            {
                trace!(status = response.status.as_u16(), "skipping informational response");
                continue;
            }
            return Ok(response);
        }
    }

    async fn read_head(&mut self) -> Result<ResponseHead, NetError> {
        loop {
            if let Some(head) = codec::parse_head(&mut self.buf)? {
                return Ok(head);
            }
            let read =
                read_some(self.lease.socket_mut()?, &mut self.buf, self.read_timeout).await?;
            if read == 0 {
                return Err(if self.progress.response_started {
                    NetError::ResponseHeadersTruncated
                } else {
                    NetError::EmptyResponse
                });
            }
            self.progress.response_started = true;
        }
    }
}

fn requests_close(head: &RequestHead) -> bool {
    head.headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("close"))
}

/// One read into `buf`, bounded by `timeout`.
async fn read_some(
    socket: &mut SocketType,
    buf: &mut BytesMut,
    timeout: Option<Duration>,
) -> Result<usize, NetError> {
    buf.reserve(READ_CHUNK);
    let read = socket.read_buf(buf);
    let n = match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| NetError::ConnectionTimedOut)??,
        None => read.await?,
    };
    Ok(n)
}

/// Response body read off an HTTP/1.1 connection. Finishing it returns the
/// connection to the pool when the exchange left it reusable.
pub(crate) struct H1Body {
    lease: Option<PoolLease>,
    buf: BytesMut,
    framing: BodyFraming,
    remaining: u64,
    decoder: ChunkedDecoder,
    keep_alive: bool,
    done: bool,
    read_timeout: Option<Duration>,
    _op: Option<TrackedOp>,
}

impl H1Body {
    async fn fill(&mut self) -> Result<usize, NetError> {
        let lease = self.lease.as_mut().ok_or(NetError::SocketNotConnected)?;
        read_some(lease.socket_mut()?, &mut self.buf, self.read_timeout).await
    }
}

impl WireBody for H1Body {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.framing {
                BodyFraming::Empty => {
                    self.done = true;
                    return Ok(None);
                }
                BodyFraming::Length(_) => {
                    if self.remaining == 0 {
                        self.done = true;
                        return Ok(None);
                    }
                    if !self.buf.is_empty() {
                        let n = self.remaining.min(self.buf.len() as u64) as usize;
                        self.remaining -= n as u64;
                        return Ok(Some(self.buf.split_to(n).freeze()));
                    }
                    if self.fill().await? == 0 {
                        return Err(NetError::ContentLengthMismatch);
                    }
                }
                BodyFraming::Chunked => match self.decoder.decode(&mut self.buf)? {
                    Decoded::Data(chunk) => return Ok(Some(chunk)),
                    Decoded::Done => {
                        self.done = true;
                        return Ok(None);
                    }
                    Decoded::NeedMore => {
                        if self.fill().await? == 0 {
                            return Err(NetError::IncompleteChunkedEncoding);
                        }
                    }
                },
                BodyFraming::CloseDelimited => {
                    if !self.buf.is_empty() {
                        return Ok(Some(self.buf.split().freeze()));
                    }
                    if self.fill().await? == 0 {
                        self.done = true;
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn finish(mut self, end: BodyEnd) {
        let reusable = end == BodyEnd::Complete
            && self.done
            && self.keep_alive
            && self.buf.is_empty()
            && self.framing != BodyFraming::CloseDelimited;
        if let Some(lease) = self.lease.take() {
            if reusable {
                lease.release();
            } else {
                trace!(?end, keep_alive = self.keep_alive, "h1 connection not reusable");
                lease.discard();
            }
        }
    }
}
