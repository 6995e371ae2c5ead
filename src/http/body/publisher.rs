//! Request body publishers.

use super::drain::{ChunkSource, DrainSubscription};
use super::wire::{Demand, DemandSubscription};
use super::{NoopSubscription, Subscriber};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const READ_CHUNK: usize = 16 * 1024;

type ReaderSupplier = Arc<dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync>;
type StreamSlot = Arc<Mutex<Option<BoxStream<'static, Result<Bytes, NetError>>>>>;

/// User supplied request body producer.
pub trait Subscribe: Send + Sync {
    /// Start a new subscription. Called once per transmission, so
    /// redirects and retries subscribe again.
    fn subscribe(&self, subscriber: Box<dyn Subscriber<Bytes>>);

    /// Declared body length, if known up front.
    fn content_length(&self) -> Option<u64> {
        None
    }
}

/// Request body for methods that send data.
///
/// Every variant except [`from_stream`](Self::from_stream) can be subscribed
/// any number of times.
#[derive(Clone, Default)]
pub struct BodyPublisher {
    kind: PublisherKind,
}

#[derive(Clone, Default)]
enum PublisherKind {
    #[default]
    Empty,
    Bytes(Bytes),
    Chunks(Arc<[Bytes]>),
    File { path: Arc<PathBuf>, length: Option<u64> },
    Reader(ReaderSupplier),
    Stream { slot: StreamSlot, length: Option<u64> },
    Custom(Arc<dyn Subscribe>),
}

impl BodyPublisher {
    /// No body (GET, HEAD, DELETE).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self { kind: PublisherKind::Bytes(bytes.into()) }
    }

    /// Encode `text` with `encoding`.
    pub fn from_string(text: &str, encoding: &'static Encoding) -> Self {
        let (encoded, _, _) = encoding.encode(text);
        Self::from_bytes(Bytes::copy_from_slice(&encoded))
    }

    /// UTF-8 text body.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_bytes(Bytes::from(text.into()))
    }

    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        Self { kind: PublisherKind::Chunks(chunks.into_iter().collect()) }
    }

    /// File contents, opened on each subscription. A missing file is
    /// reported to the subscriber as [`NetError::FileNotFound`]. The
    /// declared length is the file size at construction.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let length = std::fs::metadata(&path).ok().map(|m| m.len());
        Self { kind: PublisherKind::File { path: Arc::new(path), length } }
    }

    /// Reader obtained from `supplier` on each subscription. The reader is
    /// dropped exactly once, whether the body completes, fails or is
    /// cancelled.
    pub fn from_reader<F, R>(supplier: F) -> Self
    where
        F: Fn() -> io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        let supplier: ReaderSupplier =
            Arc::new(move || supplier().map(|r| Box::new(r) as Box<dyn Read + Send>));
        Self { kind: PublisherKind::Reader(supplier) }
    }

    /// Single-use async stream of chunks. A second subscription fails.
    pub fn from_stream<S>(stream: S, length: Option<u64>) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, NetError>> + Send + 'static,
    {
        Self {
            kind: PublisherKind::Stream { slot: Arc::new(Mutex::new(Some(stream.boxed()))), length },
        }
    }

    pub fn from_publisher(publisher: impl Subscribe + 'static) -> Self {
        Self { kind: PublisherKind::Custom(Arc::new(publisher)) }
    }

    /// Known body length in bytes, `None` when it must be sent chunked.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            PublisherKind::Empty => Some(0),
            PublisherKind::Bytes(b) => Some(b.len() as u64),
            PublisherKind::Chunks(chunks) => Some(chunks.iter().map(|c| c.len() as u64).sum()),
            PublisherKind::File { length, .. } => *length,
            PublisherKind::Reader(_) => None,
            PublisherKind::Stream { length, .. } => *length,
            PublisherKind::Custom(p) => p.content_length(),
        }
    }

    /// True when the body is known to carry no bytes.
    pub fn is_empty(&self) -> bool {
        self.content_length() == Some(0)
    }

    pub fn subscribe(&self, subscriber: Box<dyn Subscriber<Bytes>>) {
        match &self.kind {
            PublisherKind::Empty => {
                DrainSubscription::with_source(subscriber, Box::new(BytesSource(None)));
            }
            PublisherKind::Bytes(b) => {
                let first = (!b.is_empty()).then(|| b.clone());
                DrainSubscription::with_source(subscriber, Box::new(BytesSource(first)));
            }
            PublisherKind::Chunks(chunks) => {
                let source = ChunksSource { chunks: Arc::clone(chunks), next: 0 };
                DrainSubscription::with_source(subscriber, Box::new(source));
            }
            PublisherKind::File { path, .. } => {
                let source = FileSource { path: Arc::clone(path), file: None };
                subscribe_blocking(Box::new(source), subscriber);
            }
            PublisherKind::Reader(supplier) => {
                let source = ReaderSource { supplier: Arc::clone(supplier), reader: None };
                subscribe_blocking(Box::new(source), subscriber);
            }
            PublisherKind::Stream { slot, .. } => subscribe_stream(slot, subscriber),
            PublisherKind::Custom(p) => p.subscribe(subscriber),
        }
    }
}

impl fmt::Debug for BodyPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            PublisherKind::Empty => "empty",
            PublisherKind::Bytes(_) => "bytes",
            PublisherKind::Chunks(_) => "chunks",
            PublisherKind::File { .. } => "file",
            PublisherKind::Reader(_) => "reader",
            PublisherKind::Stream { .. } => "stream",
            PublisherKind::Custom(_) => "custom",
        };
        f.debug_struct("BodyPublisher")
            .field("kind", &kind)
            .field("content_length", &self.content_length())
            .finish()
    }
}

impl From<String> for BodyPublisher {
    fn from(s: String) -> Self {
        Self::from_bytes(Bytes::from(s))
    }
}

impl From<&str> for BodyPublisher {
    fn from(s: &str) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for BodyPublisher {
    fn from(v: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(v))
    }
}

impl From<Bytes> for BodyPublisher {
    fn from(b: Bytes) -> Self {
        Self::from_bytes(b)
    }
}

struct BytesSource(Option<Bytes>);

impl ChunkSource<Bytes> for BytesSource {
    fn pull(&mut self) -> Option<Result<Bytes, NetError>> {
        self.0.take().map(Ok)
    }
}

struct ChunksSource {
    chunks: Arc<[Bytes]>,
    next: usize,
}

impl ChunkSource<Bytes> for ChunksSource {
    fn pull(&mut self) -> Option<Result<Bytes, NetError>> {
        while let Some(chunk) = self.chunks.get(self.next) {
            self.next += 1;
            if !chunk.is_empty() {
                return Some(Ok(chunk.clone()));
            }
        }
        None
    }
}

fn read_chunk(reader: &mut dyn Read) -> Option<Result<Bytes, NetError>> {
    let mut buf = BytesMut::zeroed(READ_CHUNK);
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => {
                buf.truncate(n);
                return Some(Ok(buf.freeze()));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Some(Err(NetError::from_io(e))),
        }
    }
}

struct FileSource {
    path: Arc<PathBuf>,
    file: Option<File>,
}

impl ChunkSource<Bytes> for FileSource {
    fn pull(&mut self) -> Option<Result<Bytes, NetError>> {
        if self.file.is_none() {
            match File::open(self.path.as_path()).file_context(self.path.as_path()) {
                Ok(file) => self.file = Some(file),
                Err(e) => return Some(Err(e)),
            }
        }
        self.file.as_mut().and_then(|f| read_chunk(f))
    }
}

struct ReaderSource {
    supplier: ReaderSupplier,
    reader: Option<Box<dyn Read + Send>>,
}

impl ChunkSource<Bytes> for ReaderSource {
    fn pull(&mut self) -> Option<Result<Bytes, NetError>> {
        if self.reader.is_none() {
            match (self.supplier)() {
                Ok(reader) => self.reader = Some(reader),
                Err(e) => return Some(Err(NetError::from_io(e))),
            }
        }
        let next = self.reader.as_mut().and_then(|r| read_chunk(r.as_mut()));
        if !matches!(next, Some(Ok(_))) {
            // close as soon as the body ends
            self.reader = None;
        }
        next
    }
}

/// Feed `subscriber` from a source whose pulls block. Each pull runs on
/// the blocking pool; outside a runtime the source is drained inline.
fn subscribe_blocking(source: Box<dyn ChunkSource<Bytes>>, mut subscriber: Box<dyn Subscriber<Bytes>>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        DrainSubscription::with_source(subscriber, source);
        return;
    };

    let subscription = DemandSubscription::new();
    subscriber.on_subscribe(subscription.clone());
    handle.spawn(async move {
        let mut source = source;
        loop {
            match subscription.ready().await {
                Demand::Ready => {}
                Demand::Cancelled => return,
                Demand::Violation(e) => {
                    subscriber.on_error(e);
                    return;
                }
            }
            let pull = tokio::task::spawn_blocking(move || {
                let next = source.pull();
                (source, next)
            });
            // a cancelled pull finishes on its own and drops the source there
            let joined = tokio::select! {
                biased;
                _ = subscription.cancelled() => return,
                joined = pull => joined,
            };
            let (back, next) = match joined {
                Ok(pulled) => pulled,
                Err(e) => {
                    subscriber.on_error(NetError::from_io(io::Error::new(io::ErrorKind::Other, e)));
                    return;
                }
            };
            source = back;
            match next {
                Some(Ok(chunk)) => subscriber.on_next(chunk),
                Some(Err(e)) => {
                    subscriber.on_error(e);
                    return;
                }
                None => {
                    subscriber.on_complete();
                    return;
                }
            }
        }
    });
}

fn subscribe_stream(slot: &StreamSlot, mut subscriber: Box<dyn Subscriber<Bytes>>) {
    let stream = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    let Some(mut stream) = stream else {
        subscriber.on_subscribe(Arc::new(NoopSubscription));
        subscriber.on_error(NetError::InvalidArgument {
            reason: "stream body can only be sent once".to_string(),
        });
        return;
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        subscriber.on_subscribe(Arc::new(NoopSubscription));
        subscriber.on_error(NetError::InvalidArgument {
            reason: "stream body requires a tokio runtime".to_string(),
        });
        return;
    };

    let subscription = DemandSubscription::new();
    subscriber.on_subscribe(subscription.clone());
    handle.spawn(async move {
        loop {
            match subscription.ready().await {
                Demand::Ready => {}
                Demand::Cancelled => return,
                Demand::Violation(e) => {
                    subscriber.on_error(e);
                    return;
                }
            }
            let next = tokio::select! {
                biased;
                _ = subscription.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => subscriber.on_next(chunk),
                Some(Err(e)) => {
                    subscriber.on_error(e);
                    return;
                }
                None => {
                    subscriber.on_complete();
                    return;
                }
            }
        }
    });
}
