//! Glue between the body contract and the protocol engines.
//!
//! Outgoing: [`RequestBodyStream`] subscribes to a [`BodyPublisher`] and lets
//! an engine pull one chunk at a time. Incoming: [`spawn_delivery`] drives a
//! response subscriber from a [`WireBody`], delivering only against demand.

use super::{zero_demand_error, BodyPublisher, Subscriber, Subscription};
use crate::base::neterror::NetError;
use crate::base::tracker::TrackedOp;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

enum Signal {
    Subscribed(Arc<dyn Subscription>),
    Next(Bytes),
    Error(NetError),
    Complete,
}

struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Subscriber<Bytes> for ChannelSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let _ = self.tx.send(Signal::Subscribed(subscription));
    }

    fn on_next(&mut self, item: Bytes) {
        let _ = self.tx.send(Signal::Next(item));
    }

    fn on_error(&mut self, error: NetError) {
        let _ = self.tx.send(Signal::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(Signal::Complete);
    }
}

/// Pull-side view of a request body publisher.
///
/// The publisher is subscribed on [`open`](Self::open); each
/// [`next_chunk`](Self::next_chunk) requests exactly one chunk. Dropping an
/// unfinished stream cancels the subscription.
pub(crate) struct RequestBodyStream {
    rx: mpsc::UnboundedReceiver<Signal>,
    subscription: Option<Arc<dyn Subscription>>,
    requested: bool,
    done: bool,
}

impl RequestBodyStream {
    pub(crate) fn open(publisher: &BodyPublisher) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        publisher.subscribe(Box::new(ChannelSubscriber { tx }));
        Self { rx, subscription: None, requested: false, done: false }
    }

    /// Next non-empty chunk, `Ok(None)` at the end of the body.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.done {
            return Ok(None);
        }
        loop {
            if !self.requested {
                if let Some(sub) = &self.subscription {
                    self.requested = true;
                    sub.request(1);
                }
            }
            match self.rx.recv().await {
                Some(Signal::Subscribed(sub)) => {
                    if self.subscription.is_some() {
                        sub.cancel();
                    } else {
                        self.subscription = Some(sub);
                    }
                }
                Some(Signal::Next(chunk)) => {
                    self.requested = false;
                    if !chunk.is_empty() {
                        return Ok(Some(chunk));
                    }
                }
                Some(Signal::Error(e)) => {
                    self.finish();
                    return Err(e);
                }
                Some(Signal::Complete) => {
                    self.finish();
                    return Ok(None);
                }
                None => {
                    self.finish();
                    return Err(NetError::InvalidArgument {
                        reason: "request body publisher dropped its subscriber".to_string(),
                    });
                }
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.subscription = None;
    }
}

impl Drop for RequestBodyStream {
    fn drop(&mut self) {
        if let Some(sub) = self.subscription.take() {
            sub.cancel();
        }
    }
}

pub(crate) enum Demand {
    Ready,
    Cancelled,
    Violation(NetError),
}

/// Subscription handed to subscribers fed from an async task.
#[derive(Default)]
pub(crate) struct DemandSubscription {
    demand: AtomicU64,
    cancelled: AtomicBool,
    violation: Mutex<Option<NetError>>,
    wake: Notify,
    cancel_wake: Notify,
}

impl DemandSubscription {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Wait until one unit of demand can be taken.
    pub(crate) async fn ready(&self) -> Demand {
        loop {
            if self.is_cancelled() {
                return Demand::Cancelled;
            }
            if let Some(err) = self.violation.lock().unwrap_or_else(|e| e.into_inner()).take() {
                return Demand::Violation(err);
            }
            let taken = self
                .demand
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
                .is_ok();
            if taken {
                return Demand::Ready;
            }
            self.wake.notified().await;
        }
    }

    pub(crate) async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.cancel_wake.notified().await;
        }
    }
}

impl Subscription for DemandSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            self.violation
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_or_insert_with(zero_demand_error);
        } else {
            let _ = self.demand.fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(n))
            });
        }
        self.wake.notify_one();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_one();
        self.cancel_wake.notify_one();
    }
}

/// How a response body delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyEnd {
    /// Every byte was read and delivered.
    Complete,
    /// The wire failed or the subscriber broke the contract.
    Failed,
    /// The subscriber cancelled before the end of the body.
    Cancelled,
}

/// Response body as read off a connection or stream.
pub(crate) trait WireBody: Send + 'static {
    /// Next chunk from the wire, `Ok(None)` at the end.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>, NetError>> + Send;

    /// A chunk of `len` bytes reached the subscriber.
    fn delivered(&mut self, _len: usize) {}

    /// Release the underlying connection or stream.
    fn finish(self, end: BodyEnd);
}

/// Drive `subscriber` from `body` on a background task.
///
/// At most one chunk is read ahead of demand, so an empty body completes
/// without any request from the subscriber.
pub(crate) fn spawn_delivery<B: WireBody>(
    body: B,
    subscriber: Box<dyn Subscriber<Bytes>>,
    guard: Option<TrackedOp>,
) {
    tokio::spawn(async move {
        let _guard = guard;
        let mut body = body;
        let end = deliver(&mut body, subscriber).await;
        body.finish(end);
    });
}

pub(crate) async fn deliver<B: WireBody>(
    body: &mut B,
    mut subscriber: Box<dyn Subscriber<Bytes>>,
) -> BodyEnd {
    let subscription = DemandSubscription::new();
    subscriber.on_subscribe(subscription.clone());
    loop {
        let next = tokio::select! {
            biased;
            _ = subscription.cancelled() => return BodyEnd::Cancelled,
            next = body.next_chunk() => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                if subscription.is_cancelled() {
                    return BodyEnd::Cancelled;
                }
                subscriber.on_complete();
                return BodyEnd::Complete;
            }
            Err(e) => {
                if !subscription.is_cancelled() {
                    subscriber.on_error(e);
                }
                return BodyEnd::Failed;
            }
        };
        match subscription.ready().await {
            Demand::Ready => {}
            Demand::Cancelled => return BodyEnd::Cancelled,
            Demand::Violation(e) => {
                subscriber.on_error(e);
                return BodyEnd::Failed;
            }
        }
        body.delivered(chunk.len());
        subscriber.on_next(chunk);
    }
}

/// Read and drop the rest of `body`, up to `limit` bytes; anything larger
/// is abandoned.
pub(crate) async fn drain<B: WireBody>(mut body: B, limit: u64) {
    let mut seen: u64 = 0;
    let end = loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => {
                seen += chunk.len() as u64;
                body.delivered(chunk.len());
                if seen > limit {
                    break BodyEnd::Cancelled;
                }
            }
            Ok(None) => break BodyEnd::Complete,
            Err(_) => break BodyEnd::Failed,
        }
    };
    body.finish(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Chunks {
        items: VecDeque<Result<Bytes, NetError>>,
        delivered: usize,
        end: Arc<Mutex<Option<BodyEnd>>>,
    }

    impl WireBody for Chunks {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
            self.items.pop_front().transpose()
        }

        fn delivered(&mut self, len: usize) {
            self.delivered += len;
        }

        fn finish(self, end: BodyEnd) {
            *self.end.lock().unwrap() = Some(end);
        }
    }

    struct Recorder {
        sub: Option<Arc<dyn Subscription>>,
        tx: mpsc::UnboundedSender<String>,
        request_on_subscribe: u64,
    }

    impl Subscriber<Bytes> for Recorder {
        fn on_subscribe(&mut self, s: Arc<dyn Subscription>) {
            if self.request_on_subscribe > 0 {
                s.request(self.request_on_subscribe);
            }
            self.sub = Some(s);
        }
        fn on_next(&mut self, item: Bytes) {
            let _ = self.tx.send(format!("next:{}", String::from_utf8_lossy(&item)));
        }
        fn on_error(&mut self, _error: NetError) {
            let _ = self.tx.send("error".to_string());
        }
        fn on_complete(&mut self) {
            let _ = self.tx.send("complete".to_string());
        }
    }

    fn source(items: Vec<Result<Bytes, NetError>>) -> (Chunks, Arc<Mutex<Option<BodyEnd>>>) {
        let end = Arc::new(Mutex::new(None));
        (Chunks { items: items.into(), delivered: 0, end: Arc::clone(&end) }, end)
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_completes() {
        let (mut body, _end) =
            source(vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"bc"))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let end = deliver(&mut body, Box::new(Recorder { sub: None, tx, request_on_subscribe: 10 }))
            .await;

        assert_eq!(end, BodyEnd::Complete);
        assert_eq!(body.delivered, 3);
        assert_eq!(rx.recv().await.unwrap(), "next:a");
        assert_eq!(rx.recv().await.unwrap(), "next:bc");
        assert_eq!(rx.recv().await.unwrap(), "complete");
    }

    #[tokio::test]
    async fn test_empty_body_completes_without_demand() {
        let (mut body, _end) = source(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let end =
            deliver(&mut body, Box::new(Recorder { sub: None, tx, request_on_subscribe: 0 })).await;
        assert_eq!(end, BodyEnd::Complete);
        assert_eq!(rx.recv().await.unwrap(), "complete");
    }

    #[tokio::test]
    async fn test_zero_request_fails_delivery() {
        let (body, end) = source(vec![Ok(Bytes::from_static(b"a"))]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        struct ZeroRequest(mpsc::UnboundedSender<String>);
        impl Subscriber<Bytes> for ZeroRequest {
            fn on_subscribe(&mut self, s: Arc<dyn Subscription>) {
                s.request(0);
            }
            fn on_next(&mut self, _item: Bytes) {
                let _ = self.0.send("next".to_string());
            }
            fn on_error(&mut self, _error: NetError) {
                let _ = self.0.send("error".to_string());
            }
            fn on_complete(&mut self) {}
        }

        spawn_delivery(body, Box::new(ZeroRequest(tx)), None);
        assert_eq!(rx.recv().await.unwrap(), "error");
        assert!(rx.recv().await.is_none());
        assert_eq!(*end.lock().unwrap(), Some(BodyEnd::Failed));
    }

    #[tokio::test]
    async fn test_drain_stops_at_limit() {
        let (body, end) = source(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"def"))]);
        drain(body, 4).await;
        assert_eq!(*end.lock().unwrap(), Some(BodyEnd::Cancelled));

        let (body, end) = source(vec![Ok(Bytes::from_static(b"abc"))]);
        drain(body, 4).await;
        assert_eq!(*end.lock().unwrap(), Some(BodyEnd::Complete));
    }

    #[tokio::test]
    async fn test_request_stream_pulls_one_chunk_at_a_time() {
        let publisher = BodyPublisher::from_chunks(vec![
            Bytes::from_static(b"one"),
            Bytes::new(),
            Bytes::from_static(b"two"),
        ]);
        let mut stream = RequestBodyStream::open(&publisher);
        assert_eq!(stream.next_chunk().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(stream.next_chunk().await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(stream.next_chunk().await.unwrap(), None);
        assert_eq!(stream.next_chunk().await.unwrap(), None);
    }
}
