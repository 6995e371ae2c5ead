//! A multiplexed HTTP/2 session.
//!
//! The session is split across two tasks and any number of callers:
//! - the writer task owns the write half and emits queued frames in order;
//! - the reader task owns the read half, answers PING and SETTINGS, and
//!   demultiplexes everything else into per-stream event channels;
//! - callers open streams and push DATA through [`H2Connection`].
//!
//! All shared bookkeeping lives under one mutex that is never held across
//! an await. Stream ids are allocated and header blocks encoded and queued
//! under that same lock, so HEADERS reach the wire in id and HPACK order.

use super::error::{stream_reset_error, ErrorCode, H2Error};
use super::flow::{Replenish, Window};
use super::frame::{self, Frame};
use super::hpack::{Decoder, Encoder, HeaderField};
use super::settings::{Settings, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE};
use super::stream::{StreamEntry, StreamEvent, StreamState};
use crate::base::neterror::NetError;
use crate::base::tracker::{OperationTracker, TrackedKind, TrackedOp};
use crate::http::body::wire::{BodyEnd, RequestBodyStream, WireBody};
use crate::http::body::ResponseInfo;
use crate::http::headers::HttpHeaders;
use crate::http::request::RequestHead;
use crate::socket::tls::TlsInfo;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Header names that are meaningless on an HTTP/2 connection.
const CONNECTION_SPECIFIC: [&str; 6] =
    ["connection", "host", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

/// Tunables for new sessions.
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Receive window advertised for every stream.
    pub initial_stream_window: u32,
    /// Receive window for the connection as a whole.
    pub initial_connection_window: u32,
    pub max_header_list_size: u32,
    pub header_table_size: u32,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            initial_stream_window: 256 * 1024,
            initial_connection_window: 1024 * 1024,
            max_header_list_size: 256 * 1024,
            header_table_size: 4096,
        }
    }
}

impl H2Config {
    /// SETTINGS this client advertises.
    pub fn local_settings(&self) -> Settings {
        Settings {
            header_table_size: self.header_table_size,
            max_header_list_size: Some(self.max_header_list_size),
            ..Settings::client(self.initial_stream_window)
        }
    }
}

enum WriteCmd {
    Frame(Frame),
    /// Flush what is queued and close the write half.
    Shutdown,
}

struct SessionState {
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    local: Settings,
    remote: Settings,
    send_window: Window,
    recv_window: Window,
    replenish: Replenish,
    encoder: Encoder,
    /// `(last_stream_id, code)` from the peer's GOAWAY.
    goaway: Option<(u32, ErrorCode)>,
    failure: Option<NetError>,
    shutting_down: bool,
}

impl SessionState {
    fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn max_streams(&self) -> usize {
        self.remote.max_concurrent_streams.map_or(usize::MAX, |n| n as usize)
    }

    fn accepts_streams(&self) -> bool {
        self.failure.is_none()
            && self.goaway.is_none()
            && !self.shutting_down
            && self.next_stream_id <= MAX_STREAM_ID
    }

    /// Drop the entry once both directions are closed.
    fn settle(&mut self, id: u32) -> bool {
        if self.streams.get(&id).is_some_and(|s| s.state == StreamState::Closed) {
            self.streams.remove(&id);
            return true;
        }
        false
    }
}

struct Shared {
    state: Mutex<SessionState>,
    writer: mpsc::UnboundedSender<WriteCmd>,
    /// Woken when send windows grow or the session fails.
    window: Notify,
    /// Woken when a stream slot frees up.
    capacity: Notify,
    shutdown: Notify,
    tracker: Option<Arc<OperationTracker>>,
    _connection: Option<TrackedOp>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a frame for the writer task. Sending fails only once the
    /// writer has exited, which follows a session failure or shutdown, so a
    /// dropped frame has no stream left to report to.
    fn send(&self, frame: Frame) {
        let _ = self.writer.send(WriteCmd::Frame(frame));
    }

    fn wake_all(&self) {
        self.window.notify_waiters();
        self.capacity.notify_waiters();
    }

    /// Fail the session: every open stream sees `err`, no new stream opens.
    fn fail(&self, err: NetError, goaway: Option<ErrorCode>) {
        {
            let mut st = self.lock();
            if st.failure.is_some() {
                return;
            }
            st.failure = Some(err.clone());
            for (_, stream) in st.streams.drain() {
                stream.emit(StreamEvent::Failed(err.clone()));
            }
        }
        if let Some(code) = goaway {
            warn!(code = ?code, error = %err, "h2 connection error, sending GOAWAY");
            self.send(Frame::GoAway { last_stream_id: 0, code, debug: Bytes::new() });
        } else {
            debug!(error = %err, "h2 session closed");
        }
        let _ = self.writer.send(WriteCmd::Shutdown);
        self.shutdown.notify_one();
        self.wake_all();
    }

    fn reset_stream(&self, st: &mut SessionState, id: u32, code: ErrorCode) {
        if st.streams.remove(&id).is_some() {
            self.send(Frame::RstStream { stream_id: id, code });
            self.capacity.notify_waiters();
        }
    }
}

/// Cloneable handle to a session. The session closes once the last handle
/// and the last stream are gone.
#[derive(Clone)]
pub struct H2Connection {
    handle: Arc<Handle>,
}

struct Handle {
    shared: Arc<Shared>,
    tls: OnceLock<TlsInfo>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        let failed = {
            let mut st = self.shared.lock();
            st.shutting_down = true;
            st.failure.is_some()
        };
        if !failed {
            self.shared.send(Frame::GoAway {
                last_stream_id: 0,
                code: ErrorCode::NoError,
                debug: Bytes::new(),
            });
        }
        let _ = self.shared.writer.send(WriteCmd::Shutdown);
        self.shared.shutdown.notify_one();
    }
}

impl fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared().lock();
        f.debug_struct("H2Connection")
            .field("streams", &st.active_streams())
            .field("next_stream_id", &st.next_stream_id)
            .field("goaway", &st.goaway)
            .field("failed", &st.failure.is_some())
            .finish()
    }
}

impl H2Connection {
    /// Start a session with the connection preface.
    pub async fn handshake<T>(
        io: T,
        config: &H2Config,
        tracker: Option<Arc<OperationTracker>>,
    ) -> Result<Self, NetError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Ok(Self::start(io, BytesMut::new(), config, tracker, false))
    }

    /// Continue an `h2c` upgrade. Stream 1 already carries the request that
    /// was sent over HTTP/1.1; its response is read from the returned stream.
    /// `buffered` holds bytes read past the `101` response.
    pub(crate) fn upgraded<T>(
        io: T,
        buffered: BytesMut,
        config: &H2Config,
        tracker: Option<Arc<OperationTracker>>,
    ) -> (Self, H2Stream)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Self::start(io, buffered, config, tracker, true);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = conn.shared().lock();
            let mut entry = StreamEntry::new(
                st.remote.initial_window_size,
                st.local.initial_window_size,
                tx,
            );
            entry.state = StreamState::Idle.open(true);
            st.streams.insert(1, entry);
        }
        let stream = conn.stream_handle(1, rx);
        (conn, stream)
    }

    fn start<T>(
        io: T,
        buffered: BytesMut,
        config: &H2Config,
        tracker: Option<Arc<OperationTracker>>,
        upgraded: bool,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let local = config.local_settings();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_window = config.initial_connection_window.max(DEFAULT_WINDOW_SIZE);
        let state = SessionState {
            streams: HashMap::new(),
            next_stream_id: if upgraded { 3 } else { 1 },
            local: local.clone(),
            remote: Settings::default(),
            send_window: Window::new(DEFAULT_WINDOW_SIZE),
            recv_window: Window::new(conn_window),
            replenish: Replenish::new(conn_window),
            encoder: Encoder::new(4096),
            goaway: None,
            failure: None,
            shutting_down: false,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            writer: tx,
            window: Notify::new(),
            capacity: Notify::new(),
            shutdown: Notify::new(),
            _connection: tracker.as_ref().map(|t| t.track(TrackedKind::Connection)),
            tracker,
        });

        shared.send(Frame::settings(&local));
        if conn_window > DEFAULT_WINDOW_SIZE {
            shared.send(Frame::WindowUpdate {
                stream_id: 0,
                increment: conn_window - DEFAULT_WINDOW_SIZE,
            });
        }

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(write_loop(write_half, rx, Arc::clone(&shared)));
        let decoder = Decoder::new(local.header_table_size as usize)
            .with_max_header_list_size(config.max_header_list_size as usize);
        tokio::spawn(read_loop(read_half, buffered, decoder, Arc::clone(&shared)));
        debug!(upgraded, "h2 session started");

        Self { handle: Arc::new(Handle { shared, tls: OnceLock::new() }) }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// True while new streams may be opened right now.
    pub fn has_capacity(&self) -> bool {
        let st = self.shared().lock();
        st.accepts_streams() && st.active_streams() < st.max_streams()
    }

    /// True once the session can never open another stream.
    pub fn is_closed(&self) -> bool {
        !self.shared().lock().accepts_streams()
    }

    pub fn active_streams(&self) -> usize {
        self.shared().lock().active_streams()
    }

    /// TLS session the connection runs over, if any.
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.handle.tls.get()
    }

    pub(crate) fn set_tls_info(&self, info: TlsInfo) {
        let _ = self.handle.tls.set(info);
    }

    /// Open a stream for `head` and return once HEADERS are queued. A body,
    /// if any, is streamed by a background task honouring flow control.
    pub(crate) async fn send_request(
        &self,
        head: &RequestHead,
        body: Option<RequestBodyStream>,
    ) -> Result<H2Stream, NetError> {
        let fields = request_fields(head);
        let end_stream = body.is_none();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tx = Some(tx);

        let id = loop {
            let notified = self.shared().capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared().lock();
                if let Some(err) = &st.failure {
                    return Err(err.clone());
                }
                if let Some((last_stream_id, code)) = st.goaway {
                    return Err(NetError::Http2GoAway { last_stream_id, code: code.as_u32() });
                }
                if st.shutting_down || st.next_stream_id > MAX_STREAM_ID {
                    return Err(NetError::ConnectionClosed);
                }
                if st.active_streams() < st.max_streams() {
                    let id = st.next_stream_id;
                    st.next_stream_id += 2;
                    let Some(events) = tx.take() else {
                        return Err(NetError::ConnectionClosed);
                    };
                    let mut entry = StreamEntry::new(
                        st.remote.initial_window_size,
                        st.local.initial_window_size,
                        events,
                    );
                    entry.state = entry.state.open(end_stream);
                    st.streams.insert(id, entry);

                    let mut block = BytesMut::new();
                    st.encoder.encode(
                        fields.iter().map(|(n, v)| (&n[..], &v[..])),
                        &mut block,
                    );
                    let max_frame = st.remote.max_frame_size as usize;
                    queue_header_block(self.shared(), id, block.freeze(), end_stream, max_frame);
                    break id;
                }
            }
            notified.await;
        };
        trace!(stream_id = id, method = %head.method, "h2 stream opened");

        if let Some(body) = body {
            let conn = self.clone();
            tokio::spawn(async move { conn.stream_body(id, body).await });
        }
        Ok(self.stream_handle(id, rx))
    }

    fn stream_handle(&self, id: u32, events: mpsc::UnboundedReceiver<StreamEvent>) -> H2Stream {
        let op = self.shared().tracker.as_ref().map(|t| t.track(TrackedKind::Http2Stream));
        H2Stream { conn: self.clone(), id, events, done: false, _op: op }
    }

    async fn stream_body(&self, id: u32, mut body: RequestBodyStream) {
        loop {
            match body.next_chunk().await {
                Ok(Some(chunk)) => {
                    if self.send_data(id, chunk, false).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = self.send_data(id, Bytes::new(), true).await;
                    return;
                }
                Err(e) => {
                    debug!(stream_id = id, error = %e, "request body failed, resetting stream");
                    let shared = self.shared();
                    let mut st = shared.lock();
                    if let Some(stream) = st.streams.get(&id) {
                        stream.emit(StreamEvent::Failed(e));
                    }
                    shared.reset_stream(&mut st, id, ErrorCode::Cancel);
                    return;
                }
            }
        }
    }

    /// Queue `data` on stream `id`, waiting for window as needed.
    async fn send_data(&self, id: u32, mut data: Bytes, end_stream: bool) -> Result<(), NetError> {
        let shared = self.shared();
        loop {
            let notified = shared.window.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = shared.lock();
                if let Some(err) = &st.failure {
                    return Err(err.clone());
                }
                let max_frame = st.remote.max_frame_size;
                let conn_available = st.send_window.available();
                let Some(stream) = st.streams.get_mut(&id) else {
                    return Err(NetError::Cancelled);
                };
                if !stream.state.can_send() {
                    // the peer finished the exchange without reading the body
                    let code = ErrorCode::Cancel;
                    shared.reset_stream(&mut st, id, code);
                    return Err(NetError::Cancelled);
                }
                if data.is_empty() {
                    shared.send(Frame::data(id, data, end_stream));
                    if end_stream {
                        stream.state = stream.state.close_local();
                        if st.settle(id) {
                            shared.capacity.notify_waiters();
                        }
                    }
                    return Ok(());
                }
                let allowed = conn_available.min(stream.send_window.available()).min(max_frame);
                if allowed > 0 {
                    let n = (allowed as usize).min(data.len());
                    let chunk = data.split_to(n);
                    // both windows were checked above
                    let _ = stream.send_window.consume(n as u32);
                    let last = data.is_empty() && end_stream;
                    if last {
                        stream.state = stream.state.close_local();
                    }
                    let _ = st.send_window.consume(n as u32);
                    shared.send(Frame::data(id, chunk, last));
                    if last && st.settle(id) {
                        shared.capacity.notify_waiters();
                    }
                    if data.is_empty() {
                        return Ok(());
                    }
                    continue;
                }
            }
            notified.await;
        }
    }

    /// The consumer took `len` bytes of stream `id`; give the window back.
    fn release(&self, id: u32, len: usize) {
        if len == 0 {
            return;
        }
        let shared = self.shared();
        let mut st = shared.lock();
        if st.failure.is_some() {
            return;
        }
        if let Some(stream) = st.streams.get_mut(&id) {
            if stream.state.can_receive() {
                if let Some(increment) = stream.replenish.release(len as u32) {
                    if stream.recv_window.increase(increment).is_ok() {
                        shared.send(Frame::WindowUpdate { stream_id: id, increment });
                    }
                }
            }
        }
        release_connection(shared, &mut st, len as u32);
    }

    /// Stream `id` is no longer read. Resets it unless already closed.
    fn forget(&self, id: u32) {
        let shared = self.shared();
        let mut st = shared.lock();
        if st.streams.contains_key(&id) {
            trace!(stream_id = id, "h2 stream cancelled");
            shared.reset_stream(&mut st, id, ErrorCode::Cancel);
        }
    }
}

fn release_connection(shared: &Shared, st: &mut SessionState, len: u32) {
    if let Some(increment) = st.replenish.release(len) {
        if st.recv_window.increase(increment).is_ok() {
            shared.send(Frame::WindowUpdate { stream_id: 0, increment });
        }
    }
}

fn queue_header_block(shared: &Shared, id: u32, mut block: Bytes, end_stream: bool, max: usize) {
    let first = block.split_to(block.len().min(max));
    shared.send(Frame::Headers {
        stream_id: id,
        block: first,
        end_stream,
        end_headers: block.is_empty(),
    });
    while !block.is_empty() {
        let next = block.split_to(block.len().min(max));
        shared.send(Frame::Continuation { stream_id: id, block: next, end_headers: block.is_empty() });
    }
}

fn request_fields(head: &RequestHead) -> Vec<(Bytes, Bytes)> {
    let authority = head
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| head.authority());
    let mut fields = vec![
        (Bytes::from_static(b":method"), Bytes::copy_from_slice(head.method.as_str().as_bytes())),
        (Bytes::from_static(b":scheme"), Bytes::copy_from_slice(head.url.scheme().as_bytes())),
        (Bytes::from_static(b":authority"), Bytes::from(authority)),
        (Bytes::from_static(b":path"), Bytes::from(head.origin_form())),
    ];
    for (name, value) in head.headers.iter() {
        let name = name.as_str();
        if CONNECTION_SPECIFIC.contains(&name) {
            continue;
        }
        if name == "te" && !value.as_bytes().eq_ignore_ascii_case(b"trailers") {
            continue;
        }
        fields.push((
            Bytes::copy_from_slice(name.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
    }
    fields
}

/// Split a decoded response block into status and regular headers.
fn response_info(fields: Vec<HeaderField>) -> Result<ResponseInfo, NetError> {
    let mut status = None;
    let mut headers = HeaderMap::new();
    for field in fields {
        if field.name.first() == Some(&b':') {
            if &field.name[..] != b":status" || !headers.is_empty() {
                return Err(NetError::Http2ProtocolError);
            }
            status = Some(
                StatusCode::from_bytes(&field.value).map_err(|_| NetError::Http2ProtocolError)?,
            );
            continue;
        }
        let name = HeaderName::from_bytes(&field.name).map_err(|_| NetError::Http2ProtocolError)?;
        let value =
            HeaderValue::from_maybe_shared(field.value).map_err(|_| NetError::Http2ProtocolError)?;
        headers.append(name, value);
    }
    let status = status.ok_or(NetError::Http2ProtocolError)?;
    Ok(ResponseInfo { status, headers: HttpHeaders::from_map(headers), version: Version::HTTP_2 })
}

/// The caller's side of one stream.
pub(crate) struct H2Stream {
    conn: H2Connection,
    id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
    _op: Option<TrackedOp>,
}

impl H2Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the final (non-1xx) response headers.
    pub async fn response(&mut self) -> Result<ResponseInfo, NetError> {
        loop {
            match self.events.recv().await {
                Some(StreamEvent::Headers { fields, end_stream }) => {
                    let info = response_info(fields)?;
                    if info.status.is_informational() && !end_stream {
                        continue;
                    }
                    self.done = end_stream;
                    return Ok(info);
                }
                Some(StreamEvent::Data { .. }) => {
                    self.conn.forget(self.id);
                    return Err(NetError::Http2ProtocolError);
                }
                Some(StreamEvent::Failed(err)) => {
                    self.done = true;
                    return Err(err);
                }
                None => {
                    self.done = true;
                    return Err(NetError::ConnectionClosed);
                }
            }
        }
    }
}

impl WireBody for H2Stream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        while !self.done {
            match self.events.recv().await {
                Some(StreamEvent::Data { chunk, end_stream }) => {
                    self.done = end_stream;
                    if !chunk.is_empty() {
                        return Ok(Some(chunk));
                    }
                }
                // trailers end the body
                Some(StreamEvent::Headers { .. }) => self.done = true,
                Some(StreamEvent::Failed(err)) => {
                    self.done = true;
                    return Err(err);
                }
                None => {
                    self.done = true;
                    return Err(NetError::ConnectionClosed);
                }
            }
        }
        Ok(None)
    }

    fn delivered(&mut self, len: usize) {
        self.conn.release(self.id, len);
    }

    fn finish(self, end: BodyEnd) {
        if end != BodyEnd::Complete {
            trace!(stream_id = self.id, ?end, "h2 response body abandoned");
        }
        // Drop resets the stream if it is still open.
    }
}

impl Drop for H2Stream {
    fn drop(&mut self) {
        self.conn.forget(self.id);
    }
}

async fn write_loop<W>(mut io: W, mut rx: mpsc::UnboundedReceiver<WriteCmd>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    buf.extend_from_slice(frame::PREFACE);
    let mut closing = false;
    while !closing {
        match rx.recv().await {
            Some(WriteCmd::Frame(f)) => f.encode(&mut buf),
            Some(WriteCmd::Shutdown) | None => closing = true,
        }
        // coalesce whatever else is queued
        while !closing && buf.len() < 64 * 1024 {
            match rx.try_recv() {
                Ok(WriteCmd::Frame(f)) => f.encode(&mut buf),
                Ok(WriteCmd::Shutdown) => closing = true,
                Err(_) => break,
            }
        }
        if buf.is_empty() {
            continue;
        }
        if let Err(e) = io.write_all(&buf).await {
            shared.fail(NetError::from_io(e), None);
            return;
        }
        if let Err(e) = io.flush().await {
            shared.fail(NetError::from_io(e), None);
            return;
        }
        buf.clear();
    }
    let _ = io.shutdown().await;
}

/// Reader-task state that never leaves the task.
struct Inbound {
    decoder: Decoder,
    /// Header block being assembled from HEADERS + CONTINUATION.
    partial: Option<(u32, BytesMut, bool)>,
    max_frame_size: u32,
}

async fn read_loop<R>(mut io: R, mut buf: BytesMut, decoder: Decoder, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut inbound = Inbound { decoder, partial: None, max_frame_size: DEFAULT_MAX_FRAME_SIZE };
    loop {
        loop {
            match frame::decode(&mut buf, inbound.max_frame_size) {
                Ok(Some(f)) => {
                    if let Err(err) = dispatch(&shared, &mut inbound, f) {
                        shared.fail(NetError::from(err.clone()), Some(err.code()));
                        return;
                    }
                }
                Ok(None) => break,
                Err(H2Error::Stream { stream_id, code }) => {
                    let mut st = shared.lock();
                    if let Some(stream) = st.streams.get(&stream_id) {
                        stream.emit(StreamEvent::Failed(stream_reset_error(stream_id, code)));
                    }
                    shared.reset_stream(&mut st, stream_id, code);
                }
                Err(err) => {
                    shared.fail(NetError::from(err.clone()), Some(err.code()));
                    return;
                }
            }
        }
        tokio::select! {
            // every handle is gone, so no stream can still be read
            _ = shared.shutdown.notified() => return,
            read = io.read_buf(&mut buf) => match read {
                Ok(0) => {
                    shared.fail(NetError::ConnectionClosed, None);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    shared.fail(NetError::from_io(e), None);
                    return;
                }
            }
        }
    }
}

fn dispatch(shared: &Shared, inbound: &mut Inbound, frame: Frame) -> Result<(), H2Error> {
    if let Some((pending, _, _)) = &inbound.partial {
        let continues = matches!(&frame, Frame::Continuation { stream_id, .. } if stream_id == pending);
        if !continues {
            return Err(H2Error::Protocol("expected CONTINUATION"));
        }
    }
    match frame {
        Frame::Settings { ack: true, .. } => Ok(()),
        Frame::Settings { ack: false, payload } => apply_settings(shared, &payload),
        Frame::Ping { ack: false, data } => {
            shared.send(Frame::Ping { ack: true, data });
            Ok(())
        }
        Frame::Ping { ack: true, .. } | Frame::Priority { .. } | Frame::Unknown { .. } => Ok(()),
        Frame::GoAway { last_stream_id, code, .. } => {
            on_goaway(shared, last_stream_id, code);
            Ok(())
        }
        Frame::WindowUpdate { stream_id: 0, increment } => {
            shared.lock().send_window.increase(increment)?;
            shared.window.notify_waiters();
            Ok(())
        }
        Frame::WindowUpdate { stream_id, increment } => {
            let mut st = shared.lock();
            let overflow = match st.streams.get_mut(&stream_id) {
                Some(stream) => stream.send_window.increase(increment).is_err(),
                None => false,
            };
            if overflow {
                if let Some(stream) = st.streams.get(&stream_id) {
                    stream.emit(StreamEvent::Failed(NetError::Http2FlowControlError));
                }
                shared.reset_stream(&mut st, stream_id, ErrorCode::FlowControlError);
            }
            drop(st);
            shared.window.notify_waiters();
            Ok(())
        }
        Frame::RstStream { stream_id, code } => {
            let mut st = shared.lock();
            if let Some(stream) = st.streams.remove(&stream_id) {
                debug!(stream_id, code = ?code, "h2 stream reset by peer");
                stream.emit(StreamEvent::Failed(stream_reset_error(stream_id, code)));
                shared.capacity.notify_waiters();
            }
            drop(st);
            shared.window.notify_waiters();
            Ok(())
        }
        Frame::PushPromise { .. } => Err(H2Error::Protocol("PUSH_PROMISE while push is disabled")),
        Frame::Headers { stream_id, block, end_stream, end_headers } => {
            check_peer_stream(shared, stream_id)?;
            if end_headers {
                on_header_block(shared, inbound, stream_id, &block, end_stream)
            } else {
                inbound.partial = Some((stream_id, BytesMut::from(&block[..]), end_stream));
                Ok(())
            }
        }
        Frame::Continuation { stream_id, block, end_headers } => {
            let Some((id, mut pending, end_stream)) = inbound.partial.take() else {
                return Err(H2Error::Protocol("CONTINUATION without HEADERS"));
            };
            pending.extend_from_slice(&block);
            if end_headers {
                on_header_block(shared, inbound, id, &pending, end_stream)
            } else {
                inbound.partial = Some((stream_id, pending, end_stream));
                Ok(())
            }
        }
        Frame::Data { stream_id, payload, end_stream, flow_len } => {
            check_peer_stream(shared, stream_id)?;
            on_data(shared, stream_id, payload, end_stream, flow_len)
        }
    }
}

/// Frames for streams we never opened are a connection error.
fn check_peer_stream(shared: &Shared, id: u32) -> Result<(), H2Error> {
    let st = shared.lock();
    if id % 2 == 0 || id >= st.next_stream_id {
        return Err(H2Error::Protocol("frame on a stream the client never opened"));
    }
    Ok(())
}

fn apply_settings(shared: &Shared, payload: &[u8]) -> Result<(), H2Error> {
    let mut st = shared.lock();
    let old_window = st.remote.initial_window_size;
    st.remote.merge(payload)?;
    let delta = i64::from(st.remote.initial_window_size) - i64::from(old_window);
    if delta != 0 {
        for stream in st.streams.values_mut() {
            stream.send_window.adjust(delta)?;
        }
    }
    let table = st.remote.header_table_size.min(4096) as usize;
    st.encoder.set_max_table_size(table);
    trace!(
        max_concurrent_streams = ?st.remote.max_concurrent_streams,
        initial_window_size = st.remote.initial_window_size,
        max_frame_size = st.remote.max_frame_size,
        "h2 settings received"
    );
    shared.send(Frame::settings_ack());
    drop(st);
    shared.wake_all();
    Ok(())
}

fn on_goaway(shared: &Shared, last_stream_id: u32, code: ErrorCode) {
    let mut st = shared.lock();
    debug!(last_stream_id, code = ?code, "h2 GOAWAY received");
    st.goaway = Some((last_stream_id, code));
    let refused: Vec<u32> = st.streams.keys().copied().filter(|id| *id > last_stream_id).collect();
    for id in refused {
        if let Some(stream) = st.streams.remove(&id) {
            stream.emit(StreamEvent::Failed(NetError::Http2GoAway {
                last_stream_id,
                code: code.as_u32(),
            }));
        }
    }
    drop(st);
    shared.wake_all();
}

fn on_header_block(
    shared: &Shared,
    inbound: &mut Inbound,
    id: u32,
    block: &[u8],
    end_stream: bool,
) -> Result<(), H2Error> {
    // decode even for forgotten streams to keep the HPACK state in sync
    let fields = inbound.decoder.decode(block)?;
    let mut st = shared.lock();
    let Some(stream) = st.streams.get_mut(&id) else {
        return Ok(());
    };
    if !stream.state.can_receive() {
        return Err(H2Error::Protocol("HEADERS on a closed stream"));
    }
    if end_stream {
        stream.state = stream.state.close_remote();
    }
    stream.emit(StreamEvent::Headers { fields, end_stream });
    if end_stream && st.settle(id) {
        shared.capacity.notify_waiters();
    }
    Ok(())
}

fn on_data(
    shared: &Shared,
    id: u32,
    payload: Bytes,
    end_stream: bool,
    flow_len: u32,
) -> Result<(), H2Error> {
    let mut st = shared.lock();
    st.recv_window.consume(flow_len)?;
    // padding is never delivered, so it is returned right away
    let padding = flow_len - payload.len() as u32;

    let Some(stream) = st.streams.get_mut(&id) else {
        // stream already reset locally: nobody will consume this
        release_connection(shared, &mut st, flow_len);
        return Ok(());
    };
    if !stream.state.can_receive() {
        stream.emit(StreamEvent::Failed(stream_reset_error(id, ErrorCode::StreamClosed)));
        shared.reset_stream(&mut st, id, ErrorCode::StreamClosed);
        release_connection(shared, &mut st, flow_len);
        return Ok(());
    }
    if stream.recv_window.consume(flow_len).is_err() {
        stream.emit(StreamEvent::Failed(NetError::Http2FlowControlError));
        shared.reset_stream(&mut st, id, ErrorCode::FlowControlError);
        release_connection(shared, &mut st, flow_len);
        return Ok(());
    }
    if padding > 0 {
        if let Some(increment) = stream.replenish.release(padding) {
            let _ = stream.recv_window.increase(increment);
            shared.send(Frame::WindowUpdate { stream_id: id, increment });
        }
    }
    if end_stream {
        stream.state = stream.state.close_remote();
    }
    stream.emit(StreamEvent::Data { chunk: payload, end_stream });
    if end_stream && st.settle(id) {
        shared.capacity.notify_waiters();
    }
    if padding > 0 {
        release_connection(shared, &mut st, padding);
    }
    Ok(())
}
