//! Response body subscribers.
//!
//! Each adapter is a [`BodySubscriber`]: a [`Subscriber<Bytes>`] that also
//! hands out a future for the body value it produces. Aggregating
//! subscribers resolve once the body ends; streaming ones ([`of_lines`],
//! [`of_byte_stream`], [`of_reader`]) resolve as soon as they are
//! subscribed and feed their output lazily.

use super::drain::DrainSubscription;
use super::{Subscriber, Subscription, SubscriptionSlot};
use crate::base::neterror::NetError;
use bytes::{Buf, Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::sync::{mpsc, oneshot};

/// Future resolving to a decoded body.
pub type BodyFuture<T> = BoxFuture<'static, Result<T, NetError>>;

/// Boxed subscriber producing a `T`.
pub type BoxBodySubscriber<T> = Box<dyn BodySubscriber<T>>;

/// A subscriber that turns the response body into a `T`.
pub trait BodySubscriber<T>: Subscriber<Bytes> {
    /// Future for the body value. Taken once, before subscribing.
    fn body(&mut self) -> BodyFuture<T>;
}

impl<T, S: BodySubscriber<T> + ?Sized> BodySubscriber<T> for Box<S> {
    fn body(&mut self) -> BodyFuture<T> {
        (**self).body()
    }
}

/// One-shot result slot behind [`BodySubscriber::body`].
struct Promise<T> {
    tx: Option<oneshot::Sender<Result<T, NetError>>>,
    rx: Option<oneshot::Receiver<Result<T, NetError>>>,
}

impl<T: Send + 'static> Promise<T> {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self { tx: Some(tx), rx: Some(rx) }
    }

    fn complete(&mut self, result: Result<T, NetError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    fn is_complete(&self) -> bool {
        self.tx.is_none()
    }

    fn future(&mut self) -> BodyFuture<T> {
        match self.rx.take() {
            Some(rx) => async move { rx.await.unwrap_or(Err(NetError::Cancelled)) }.boxed(),
            None => futures::future::ready(Err(NetError::InvalidArgument {
                reason: "body future already taken".to_string(),
            }))
            .boxed(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type Finisher<T> = Box<dyn FnOnce(Bytes) -> Result<T, NetError> + Send>;

/// Accumulates the whole body, then maps it.
struct Collecting<T> {
    slot: SubscriptionSlot,
    buf: BytesMut,
    finish: Option<Finisher<T>>,
    promise: Promise<T>,
}

impl<T: Send + 'static> Collecting<T> {
    fn new(finish: Finisher<T>) -> Self {
        Self { slot: SubscriptionSlot::new(), buf: BytesMut::new(), finish: Some(finish), promise: Promise::new() }
    }
}

impl<T: Send + 'static> Subscriber<Bytes> for Collecting<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.slot.accept(subscription) {
            self.slot.request(u64::MAX);
        }
    }

    fn on_next(&mut self, item: Bytes) {
        self.buf.extend_from_slice(&item);
    }

    fn on_error(&mut self, error: NetError) {
        self.slot.clear();
        self.promise.complete(Err(error));
    }

    fn on_complete(&mut self) {
        self.slot.clear();
        let body = std::mem::take(&mut self.buf).freeze();
        if let Some(finish) = self.finish.take() {
            self.promise.complete(finish(body));
        }
    }
}

impl<T: Send + 'static> BodySubscriber<T> for Collecting<T> {
    fn body(&mut self) -> BodyFuture<T> {
        self.promise.future()
    }
}

/// Whole body as bytes.
pub fn of_bytes() -> BoxBodySubscriber<Bytes> {
    Box::new(Collecting::new(Box::new(Ok)))
}

/// Whole body decoded with `encoding`.
pub fn of_string(encoding: &'static Encoding) -> BoxBodySubscriber<String> {
    Box::new(Collecting::new(Box::new(move |body: Bytes| {
        let (text, _) = encoding.decode_without_bom_handling(&body);
        Ok(text.into_owned())
    })))
}

/// Whole body parsed as JSON.
#[cfg(feature = "json")]
pub fn of_json<T>() -> BoxBodySubscriber<T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    Box::new(Collecting::new(Box::new(|body: Bytes| {
        serde_json::from_slice(&body).map_err(|_| NetError::ContentDecodingFailed)
    })))
}

/// Discards the body, producing `value`.
pub fn replacing<U: Send + 'static>(value: U) -> BoxBodySubscriber<U> {
    Box::new(Discarding { slot: SubscriptionSlot::new(), value: Some(value), promise: Promise::new() })
}

/// Discards the body.
pub fn discarding() -> BoxBodySubscriber<()> {
    replacing(())
}

struct Discarding<U> {
    slot: SubscriptionSlot,
    value: Option<U>,
    promise: Promise<U>,
}

impl<U: Send + 'static> Subscriber<Bytes> for Discarding<U> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.slot.accept(subscription) {
            self.slot.request(u64::MAX);
        }
    }

    fn on_next(&mut self, _item: Bytes) {}

    fn on_error(&mut self, error: NetError) {
        self.slot.clear();
        self.promise.complete(Err(error));
    }

    fn on_complete(&mut self) {
        self.slot.clear();
        if let Some(value) = self.value.take() {
            self.promise.complete(Ok(value));
        }
    }
}

impl<U: Send + 'static> BodySubscriber<U> for Discarding<U> {
    fn body(&mut self) -> BodyFuture<U> {
        self.promise.future()
    }
}

/// Writes the body to `path` (created or truncated), producing the path.
///
/// File writes run on the blocking pool, in arrival order.
pub fn of_file(path: impl Into<PathBuf>) -> BoxBodySubscriber<PathBuf> {
    Box::new(FileSink { slot: SubscriptionSlot::new(), path: path.into(), writer: None, promise: Promise::new() })
}

enum FileWrite {
    Chunk(Bytes),
    Finish,
    Abort(NetError),
}

struct FileSink {
    slot: SubscriptionSlot,
    path: PathBuf,
    writer: Option<mpsc::UnboundedSender<FileWrite>>,
    promise: Promise<PathBuf>,
}

impl FileSink {
    fn send(&mut self, write: FileWrite) {
        if let Some(writer) = &self.writer {
            // a failed writer has already cancelled and settled the body
            let _ = writer.send(write);
        }
    }
}

impl Subscriber<Bytes> for FileSink {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if !self.slot.accept(Arc::clone(&subscription)) {
            return;
        }
        let Some(tx) = self.promise.tx.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.slot.cancel();
            let _ = tx.send(Err(NetError::InvalidArgument {
                reason: "file body requires a tokio runtime".to_string(),
            }));
            return;
        };
        let (writer, rx) = mpsc::unbounded_channel();
        self.writer = Some(writer);
        let path = self.path.clone();
        handle.spawn_blocking(move || {
            let written = write_file(&path, rx).map(|()| path);
            if written.is_err() {
                subscription.cancel();
            }
            let _ = tx.send(written);
        });
        self.slot.request(u64::MAX);
    }

    fn on_next(&mut self, item: Bytes) {
        self.send(FileWrite::Chunk(item));
    }

    fn on_error(&mut self, error: NetError) {
        self.slot.clear();
        self.send(FileWrite::Abort(error.clone()));
        self.writer = None;
        self.promise.complete(Err(error));
    }

    fn on_complete(&mut self) {
        self.slot.clear();
        self.send(FileWrite::Finish);
        self.writer = None;
    }
}

fn write_file(path: &Path, mut rx: mpsc::UnboundedReceiver<FileWrite>) -> Result<(), NetError> {
    let mut file = File::create(path).map_err(NetError::from_io)?;
    loop {
        match rx.blocking_recv() {
            Some(FileWrite::Chunk(chunk)) => file.write_all(&chunk).map_err(NetError::from_io)?,
            Some(FileWrite::Finish) => return file.flush().map_err(NetError::from_io),
            Some(FileWrite::Abort(error)) => return Err(error),
            None => return Err(NetError::Cancelled),
        }
    }
}

impl BodySubscriber<PathBuf> for FileSink {
    fn body(&mut self) -> BodyFuture<PathBuf> {
        self.promise.future()
    }
}

/// Hands every chunk to `consumer` as `Some(chunk)`, then `None` at the end.
/// Not called with `None` when the body fails.
pub fn of_consumer<F>(consumer: F) -> BoxBodySubscriber<()>
where
    F: FnMut(Option<Bytes>) + Send + 'static,
{
    Box::new(Consumer { slot: SubscriptionSlot::new(), consumer, promise: Promise::new() })
}

struct Consumer<F> {
    slot: SubscriptionSlot,
    consumer: F,
    promise: Promise<()>,
}

impl<F: FnMut(Option<Bytes>) + Send + 'static> Subscriber<Bytes> for Consumer<F> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.slot.accept(subscription) {
            self.slot.request(u64::MAX);
        }
    }

    fn on_next(&mut self, item: Bytes) {
        (self.consumer)(Some(item));
    }

    fn on_error(&mut self, error: NetError) {
        self.slot.clear();
        self.promise.complete(Err(error));
    }

    fn on_complete(&mut self) {
        self.slot.clear();
        (self.consumer)(None);
        self.promise.complete(Ok(()));
    }
}

impl<F: FnMut(Option<Bytes>) + Send + 'static> BodySubscriber<()> for Consumer<F> {
    fn body(&mut self) -> BodyFuture<()> {
        self.promise.future()
    }
}

/// Wraps a plain subscriber; the body value is `()` once it terminates.
pub fn from_subscriber<S>(subscriber: S) -> BoxBodySubscriber<()>
where
    S: Subscriber<Bytes> + 'static,
{
    from_subscriber_mapped(subscriber, |_| ())
}

/// Wraps a plain subscriber; `finisher` computes the body value from it
/// after successful completion.
pub fn from_subscriber_mapped<S, T, F>(subscriber: S, finisher: F) -> BoxBodySubscriber<T>
where
    S: Subscriber<Bytes> + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> T + Send + 'static,
{
    Box::new(Mapped { inner: subscriber, finisher: Some(finisher), promise: Promise::new() })
}

struct Mapped<S, F, T> {
    inner: S,
    finisher: Option<F>,
    promise: Promise<T>,
}

impl<S, T, F> Subscriber<Bytes> for Mapped<S, F, T>
where
    S: Subscriber<Bytes>,
    T: Send + 'static,
    F: FnOnce(&mut S) -> T + Send,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: Bytes) {
        self.inner.on_next(item);
    }

    fn on_error(&mut self, error: NetError) {
        self.inner.on_error(error.clone());
        self.promise.complete(Err(error));
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
        if let Some(finisher) = self.finisher.take() {
            let value = finisher(&mut self.inner);
            self.promise.complete(Ok(value));
        }
    }
}

impl<S, T, F> BodySubscriber<T> for Mapped<S, F, T>
where
    S: Subscriber<Bytes>,
    T: Send + 'static,
    F: FnOnce(&mut S) -> T + Send,
{
    fn body(&mut self) -> BodyFuture<T> {
        self.promise.future()
    }
}

/// Fails with [`NetError::ResponseBodyTooLarge`] once more than
/// `max_bytes` arrive; otherwise behaves like `downstream`.
pub fn limited<T: Send + 'static>(
    downstream: BoxBodySubscriber<T>,
    max_bytes: u64,
) -> BoxBodySubscriber<T> {
    Box::new(Limited { downstream, upstream: None, seen: 0, max_bytes, failed: false })
}

struct Limited<T> {
    downstream: BoxBodySubscriber<T>,
    upstream: Option<Arc<dyn Subscription>>,
    seen: u64,
    max_bytes: u64,
    failed: bool,
}

impl<T: Send + 'static> Subscriber<Bytes> for Limited<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.upstream.is_some() {
            subscription.cancel();
            return;
        }
        self.upstream = Some(Arc::clone(&subscription));
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: Bytes) {
        if self.failed {
            return;
        }
        self.seen += item.len() as u64;
        if self.seen > self.max_bytes {
            self.failed = true;
            if let Some(up) = self.upstream.take() {
                up.cancel();
            }
            self.downstream.on_error(NetError::ResponseBodyTooLarge { limit: self.max_bytes });
            return;
        }
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: NetError) {
        if !self.failed {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.failed {
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> BodySubscriber<T> for Limited<T> {
    fn body(&mut self) -> BodyFuture<T> {
        self.downstream.body()
    }
}

/// Re-chunks the body so `downstream` sees chunks of at least `size` bytes,
/// except possibly the last. Demand from `downstream` counts in re-chunked
/// buffers.
pub fn buffering<T: Send + 'static>(
    downstream: BoxBodySubscriber<T>,
    size: usize,
) -> BoxBodySubscriber<T> {
    Box::new(Buffering {
        downstream: Some(downstream),
        size: size.max(1),
        buf: BytesMut::new(),
        upstream: None,
        outstanding: Arc::new(AtomicBool::new(false)),
        drain: None,
    })
}

struct Buffering<T> {
    downstream: Option<BoxBodySubscriber<T>>,
    size: usize,
    buf: BytesMut,
    upstream: Option<Arc<dyn Subscription>>,
    outstanding: Arc<AtomicBool>,
    drain: Option<Arc<DrainSubscription<Bytes>>>,
}

fn pull_upstream(upstream: &Arc<dyn Subscription>, outstanding: &AtomicBool) {
    if !outstanding.swap(true, Ordering::AcqRel) {
        upstream.request(1);
    }
}

impl<T: Send + 'static> Subscriber<Bytes> for Buffering<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let Some(downstream) = self.downstream.take() else {
            subscription.cancel();
            return;
        };
        self.upstream = Some(Arc::clone(&subscription));
        let outstanding = Arc::clone(&self.outstanding);
        let starved = Box::new(move || pull_upstream(&subscription, &outstanding));
        self.drain = Some(DrainSubscription::with_queue(Box::new(downstream), starved));
    }

    fn on_next(&mut self, item: Bytes) {
        self.outstanding.store(false, Ordering::Release);
        let (Some(drain), Some(upstream)) = (&self.drain, &self.upstream) else {
            return;
        };
        if drain.is_cancelled() {
            upstream.cancel();
            return;
        }
        self.buf.extend_from_slice(&item);
        if self.buf.len() >= self.size {
            drain.push(self.buf.split().freeze());
        } else if drain.has_demand() {
            pull_upstream(upstream, &self.outstanding);
        }
    }

    fn on_error(&mut self, error: NetError) {
        if let Some(drain) = &self.drain {
            drain.finish(Err(error));
        }
    }

    fn on_complete(&mut self) {
        if let Some(drain) = &self.drain {
            if !self.buf.is_empty() {
                drain.push(self.buf.split().freeze());
            }
            drain.finish(Ok(()));
        }
    }
}

impl<T: Send + 'static> BodySubscriber<T> for Buffering<T> {
    fn body(&mut self) -> BodyFuture<T> {
        match self.downstream.as_mut() {
            Some(d) => d.body(),
            None => futures::future::ready(Err(NetError::InvalidArgument {
                reason: "buffering subscriber already subscribed".to_string(),
            }))
            .boxed(),
        }
    }
}

// Pull-driven adapters. The consumer side asks for one chunk whenever its
// queue runs dry, so unread data stays on the wire.

struct PullState {
    queue: VecDeque<Bytes>,
    end: Option<Result<(), NetError>>,
    subscription: Option<Arc<dyn Subscription>>,
    requested: bool,
    waker: Option<Waker>,
}

struct PullShared {
    state: Mutex<PullState>,
    ready: Condvar,
}

impl PullShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PullState {
                queue: VecDeque::new(),
                end: None,
                subscription: None,
                requested: false,
                waker: None,
            }),
            ready: Condvar::new(),
        })
    }

    fn notify(&self, mut state: MutexGuard<'_, PullState>) {
        let waker = state.waker.take();
        drop(state);
        self.ready.notify_all();
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Ask for one more chunk unless one is already on its way.
    fn request_more(&self) {
        let subscription = {
            let mut st = lock(&self.state);
            if st.requested || st.end.is_some() {
                return;
            }
            st.requested = true;
            st.subscription.clone()
        };
        if let Some(s) = subscription {
            s.request(1);
        }
    }

    fn cancel(&self) {
        let subscription = {
            let mut st = lock(&self.state);
            st.queue.clear();
            if st.end.is_none() {
                st.end = Some(Err(NetError::Cancelled));
            }
            st.subscription.take()
        };
        if let Some(s) = subscription {
            s.cancel();
        }
    }
}

/// Feeds a [`PullShared`] queue and resolves its body at subscribe time.
struct PullFeeder<T> {
    shared: Arc<PullShared>,
    output: Option<T>,
    promise: Promise<T>,
}

impl<T: Send + 'static> Subscriber<Bytes> for PullFeeder<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut st = lock(&self.shared.state);
            if st.subscription.is_some() || self.promise.is_complete() {
                drop(st);
                subscription.cancel();
                return;
            }
            st.subscription = Some(subscription);
        }
        if let Some(output) = self.output.take() {
            self.promise.complete(Ok(output));
        }
    }

    fn on_next(&mut self, item: Bytes) {
        let mut st = lock(&self.shared.state);
        st.requested = false;
        if st.end.is_none() {
            st.queue.push_back(item);
        }
        self.shared.notify(st);
    }

    fn on_error(&mut self, error: NetError) {
        let mut st = lock(&self.shared.state);
        st.subscription = None;
        if st.end.is_none() {
            st.end = Some(Err(error.clone()));
        }
        self.shared.notify(st);
        self.promise.complete(Err(error));
    }

    fn on_complete(&mut self) {
        let mut st = lock(&self.shared.state);
        st.subscription = None;
        if st.end.is_none() {
            st.end = Some(Ok(()));
        }
        self.shared.notify(st);
    }
}

impl<T: Send + 'static> BodySubscriber<T> for PullFeeder<T> {
    fn body(&mut self) -> BodyFuture<T> {
        self.promise.future()
    }
}

/// Async stream of body chunks. Dropping it cancels the body.
pub struct ByteStream {
    shared: Arc<PullShared>,
    finished: bool,
}

impl Stream for ByteStream {
    type Item = Result<Bytes, NetError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        loop {
            {
                let mut st = lock(&self.shared.state);
                if let Some(chunk) = st.queue.pop_front() {
                    return Poll::Ready(Some(Ok(chunk)));
                }
                match st.end.take() {
                    Some(Ok(())) => {
                        st.end = Some(Ok(()));
                        drop(st);
                        self.finished = true;
                        return Poll::Ready(None);
                    }
                    Some(Err(e)) => {
                        st.end = Some(Err(e.clone()));
                        drop(st);
                        self.finished = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    None => {}
                }
                if st.requested || st.subscription.is_none() {
                    st.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
            self.shared.request_more();
        }
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.cancel();
        }
    }
}

/// Body as an async stream of chunks, requested as the stream is polled.
pub fn of_byte_stream() -> BoxBodySubscriber<ByteStream> {
    let shared = PullShared::new();
    let stream = ByteStream { shared: Arc::clone(&shared), finished: false };
    Box::new(PullFeeder { shared, output: Some(stream), promise: Promise::new() })
}

/// Body as a stream of lines decoded with `encoding`. Line terminators
/// (`\n`, `\r\n`, lone `\r`) are stripped.
pub fn of_lines(
    encoding: &'static Encoding,
) -> BoxBodySubscriber<futures::stream::BoxStream<'static, Result<String, NetError>>> {
    let shared = PullShared::new();
    let bytes = ByteStream { shared: Arc::clone(&shared), finished: false };
    let lines = lines_from(bytes, encoding);
    Box::new(PullFeeder { shared, output: Some(lines), promise: Promise::new() })
}

struct LineSplitter {
    decoder: encoding_rs::Decoder,
    pending: String,
    ready: VecDeque<String>,
    last_was_cr: bool,
}

impl LineSplitter {
    fn new(encoding: &'static Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
            pending: String::new(),
            ready: VecDeque::new(),
            last_was_cr: false,
        }
    }

    fn feed(&mut self, bytes: &[u8], last: bool) {
        let mut text = String::with_capacity(
            self.decoder.max_utf8_buffer_length(bytes.len()).unwrap_or(bytes.len() * 3),
        );
        let _ = self.decoder.decode_to_string(bytes, &mut text, last);
        for ch in text.chars() {
            match ch {
                '\n' if self.last_was_cr => {}
                '\n' | '\r' => self.ready.push_back(std::mem::take(&mut self.pending)),
                c => self.pending.push(c),
            }
            self.last_was_cr = ch == '\r';
        }
        if last && !self.pending.is_empty() {
            self.ready.push_back(std::mem::take(&mut self.pending));
        }
    }
}

fn lines_from(
    bytes: ByteStream,
    encoding: &'static Encoding,
) -> futures::stream::BoxStream<'static, Result<String, NetError>> {
    use futures::StreamExt;
    let state = (bytes, LineSplitter::new(encoding), false);
    futures::stream::unfold(state, |(mut bytes, mut split, mut done)| async move {
        loop {
            if let Some(line) = split.ready.pop_front() {
                return Some((Ok(line), (bytes, split, done)));
            }
            if done {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => split.feed(&chunk, false),
                Some(Err(e)) => {
                    done = true;
                    split.ready.clear();
                    return Some((Err(e), (bytes, split, done)));
                }
                None => {
                    done = true;
                    split.feed(&[], true);
                }
            }
        }
    })
    .boxed()
}

/// Blocking reader over the body. Reads must happen outside async code
/// (e.g. in `spawn_blocking` or a plain thread). Dropping it cancels the
/// body.
pub struct BodyReader {
    shared: Arc<PullShared>,
    current: Bytes,
    finished: bool,
}

impl Read for BodyReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            if self.finished {
                return Ok(0);
            }
            let mut st = lock(&self.shared.state);
            loop {
                if let Some(chunk) = st.queue.pop_front() {
                    self.current = chunk;
                    break;
                }
                match &st.end {
                    Some(Ok(())) => {
                        self.finished = true;
                        return Ok(0);
                    }
                    Some(Err(e)) => {
                        self.finished = true;
                        return Err(io::Error::new(io::ErrorKind::Other, e.clone()));
                    }
                    None => {}
                }
                if !st.requested && st.subscription.is_some() {
                    drop(st);
                    self.shared.request_more();
                    st = lock(&self.shared.state);
                    continue;
                }
                st = self.shared.ready.wait(st).unwrap_or_else(|e| e.into_inner());
            }
        }
        let n = out.len().min(self.current.len());
        out[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.cancel();
        }
    }
}

/// Body as a blocking [`Read`].
pub fn of_reader() -> BoxBodySubscriber<BodyReader> {
    let shared = PullShared::new();
    let reader = BodyReader { shared: Arc::clone(&shared), current: Bytes::new(), finished: false };
    Box::new(PullFeeder { shared, output: Some(reader), promise: Promise::new() })
}

/// Default charset for text bodies without a `charset` parameter.
pub fn default_charset() -> &'static Encoding {
    UTF_8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body::BodyPublisher;
    use futures::StreamExt;

    async fn run<T: Send + 'static>(
        publisher: &BodyPublisher,
        mut subscriber: BoxBodySubscriber<T>,
    ) -> Result<T, NetError> {
        let body = subscriber.body();
        publisher.subscribe(Box::new(subscriber));
        body.await
    }

    #[tokio::test]
    async fn test_of_bytes_and_string() {
        let publisher = BodyPublisher::from_chunks(vec![Bytes::from("hel"), Bytes::from("lo")]);
        assert_eq!(run(&publisher, of_bytes()).await.unwrap(), Bytes::from("hello"));
        assert_eq!(run(&publisher, of_string(UTF_8)).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_of_string_decodes_charset() {
        let publisher = BodyPublisher::from_bytes(vec![0x63, 0x61, 0x66, 0xE9]);
        let text = run(&publisher, of_string(encoding_rs::WINDOWS_1252)).await.unwrap();
        assert_eq!(text, "café");
    }

    #[tokio::test]
    async fn test_replacing_and_discarding() {
        let publisher = BodyPublisher::from("ignored");
        assert_eq!(run(&publisher, replacing(7u8)).await.unwrap(), 7);
        run(&publisher, discarding()).await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_sees_end_marker() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let publisher = BodyPublisher::from_chunks(vec![Bytes::from("a"), Bytes::from("b")]);
        run(&publisher, of_consumer(move |c| s.lock().unwrap().push(c))).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(Bytes::from("a")), Some(Bytes::from("b")), None]
        );
    }

    #[tokio::test]
    async fn test_limited_fails_beyond_max() {
        let publisher = BodyPublisher::from_chunks(vec![Bytes::from("1234"), Bytes::from("5678")]);
        let err = run(&publisher, limited(of_bytes(), 6)).await.unwrap_err();
        assert!(matches!(err, NetError::ResponseBodyTooLarge { limit: 6 }));
        let ok = run(&publisher, limited(of_bytes(), 8)).await.unwrap();
        assert_eq!(ok.len(), 8);
    }

    #[tokio::test]
    async fn test_buffering_rechunks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let chunks = (0..10).map(|i| Bytes::from(vec![b'a' + i as u8; 3])).collect::<Vec<_>>();
        let publisher = BodyPublisher::from_chunks(chunks);
        let consumer = of_consumer(move |c| {
            if let Some(c) = c {
                s.lock().unwrap().push(c.len());
            }
        });
        run(&publisher, buffering(consumer, 8)).await.unwrap();
        let sizes = seen.lock().unwrap().clone();
        assert_eq!(sizes.iter().sum::<usize>(), 30);
        let (last, rest) = sizes.split_last().unwrap();
        assert!(rest.iter().all(|&n| n >= 8));
        assert!(*last > 0);
    }

    #[tokio::test]
    async fn test_lines() {
        let publisher = BodyPublisher::from_chunks(vec![
            Bytes::from("first\r"),
            Bytes::from("\nsecond\nthi"),
            Bytes::from("rd"),
        ]);
        let lines = run(&publisher, of_lines(UTF_8)).await.unwrap();
        let lines: Vec<String> = lines.map(|l| l.unwrap()).collect().await;
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_byte_stream_is_pull_driven() {
        let publisher = BodyPublisher::from_chunks(vec![Bytes::from("x"), Bytes::from("y")]);
        let mut stream = run(&publisher, of_byte_stream()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("x"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("y"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_reads_whole_body() {
        let publisher = BodyPublisher::from_chunks(vec![Bytes::from("abc"), Bytes::from("def")]);
        let mut reader = run(&publisher, of_reader()).await.unwrap();
        let text = tokio::task::spawn_blocking(move || {
            let mut s = String::new();
            reader.read_to_string(&mut s).map(|_| s)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(text, "abcdef");
    }

    #[tokio::test]
    async fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let publisher = BodyPublisher::from("payload");
        let path = run(&publisher, of_file(&target)).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_file_sink_keeps_chunk_order() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ordered.bin");
        let chunks: Vec<Bytes> = (0..64u8).map(|i| Bytes::from(vec![i; 1024])).collect();
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        let publisher = BodyPublisher::from_chunks(chunks);
        let path = run(&publisher, of_file(&target)).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_file_sink_reports_create_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("out.bin");
        let publisher = BodyPublisher::from("payload");
        assert!(run(&publisher, of_file(&target)).await.is_err());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_from_subscriber_mapped() {
        struct Count {
            n: usize,
        }
        impl Subscriber<Bytes> for Count {
            fn on_subscribe(&mut self, s: Arc<dyn Subscription>) {
                s.request(u64::MAX);
            }
            fn on_next(&mut self, item: Bytes) {
                self.n += item.len();
            }
            fn on_error(&mut self, _error: NetError) {}
            fn on_complete(&mut self) {}
        }
        let publisher = BodyPublisher::from("12345");
        let n = run(&publisher, from_subscriber_mapped(Count { n: 0 }, |c| c.n)).await.unwrap();
        assert_eq!(n, 5);
    }

    #[tokio::test]
    async fn test_failed_body_propagates_error() {
        let publisher = BodyPublisher::from_file("/no/such/file");
        let err = run(&publisher, of_bytes()).await.unwrap_err();
        assert!(matches!(err, NetError::FileNotFound { .. }));
    }
}
