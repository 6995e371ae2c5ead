use crate::base::neterror::NetError;
use crate::base::tracker::{OperationTracker, TrackedKind, TrackedOp};
use crate::http::h2::H2Connection;
use crate::socket::client::{SocketType, StreamSocket, WrappedSocket};
use crate::socket::connectjob::{AlpnOffer, ConnectJob, ConnectRequest, Connector};
use crate::socket::proxy::ProxySettings;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};
use url::Url;

/// Request priority (matches Chromium's RequestPriority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RequestPriority {
    Throttled = 0,
    Idle = 1,
    Lowest = 2,
    Low = 3,
    #[default]
    Medium = 4,
    Highest = 5,
}

/// Identifies a connection group: connections in one group are
/// interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub alpn: AlpnOffer,
    /// [`ProxySettings::identity`] of the proxy, `None` for DIRECT.
    pub proxy: Option<String>,
}

impl PoolKey {
    pub fn new(url: &Url, alpn: AlpnOffer, proxy: Option<&ProxySettings>) -> Result<Self, NetError> {
        Ok(PoolKey {
            scheme: url.scheme().to_string(),
            host: url.host_str().ok_or(NetError::InvalidUrl)?.to_ascii_lowercase(),
            port: url.port_or_known_default().ok_or(NetError::InvalidUrl)?,
            alpn,
            proxy: proxy.map(ProxySettings::identity),
        })
    }
}

/// Pool limits and idle timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_host: usize,
    pub max_connections_total: usize,
    /// Idle timeout for connections that carried at least one exchange.
    pub idle_timeout: Duration,
    /// Idle timeout for connections that were never used.
    pub unused_idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 6,
            max_connections_total: 256,
            idle_timeout: Duration::from_secs(300),
            unused_idle_timeout: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// What a queued request receives once it may proceed.
enum Grant {
    Reuse(WrappedSocket),
    /// A slot was reserved; the waiter connects itself.
    Connect,
}

/// A pending socket request waiting in queue.
struct PendingRequest {
    priority: RequestPriority,
    seq: u64,
    sender: oneshot::Sender<Grant>,
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingRequest {}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, older requests first (FIFO within priority)
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Idle socket with metadata for timeout tracking.
struct IdleSocket {
    socket: WrappedSocket,
    /// When this socket was returned to the pool
    start_time: Instant,
}

/// Per-group state tracking.
#[derive(Default)]
struct Group {
    idle_sockets: VecDeque<IdleSocket>,
    active_count: usize,
    pending_requests: Vec<PendingRequest>,
}

impl Group {
    fn total_slots(&self) -> usize {
        self.active_count + self.idle_sockets.len()
    }

    fn has_available_slot(&self, max_per_group: usize) -> bool {
        self.total_slots() < max_per_group
    }

    fn pop_highest_priority_request(&mut self) -> Option<PendingRequest> {
        let max_idx = self
            .pending_requests
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i)?;
        Some(self.pending_requests.swap_remove(max_idx))
    }

    fn is_unused(&self) -> bool {
        self.idle_sockets.is_empty() && self.active_count == 0 && self.pending_requests.is_empty()
    }
}

/// A queued request. Dropped while waiting, it hands back whatever it was
/// granted in the meantime.
struct QueuedGrant<'a> {
    pool: &'a ClientSocketPool,
    key: &'a PoolKey,
    rx: oneshot::Receiver<Grant>,
}

impl Drop for QueuedGrant<'_> {
    fn drop(&mut self) {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Grant::Reuse(socket)) => self.pool.release_socket(self.key, socket),
            Ok(Grant::Connect) => self.pool.free_slot(self.key),
            Err(_) => {}
        }
    }
}

/// A reserved slot that has no connection yet.
struct SlotGuard<'a> {
    pool: &'a ClientSocketPool,
    key: &'a PoolKey,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot(self.key);
        }
    }
}

/// Outcome of [`ClientSocketPool::checkout_h2`].
pub(crate) enum H2Checkout {
    /// A live session with room for another stream.
    Reuse(H2Connection),
    /// The caller opens the session; other callers wait on the guard.
    Open(H2Opening),
    /// The destination speaks HTTP/1.1 only.
    Direct,
}

/// Marks a key whose first HTTP/2 connection is being set up. Waiters in
/// [`ClientSocketPool::checkout_h2`] wake when it drops.
pub(crate) struct H2Opening {
    pool: ClientSocketPool,
    key: PoolKey,
    notify: Arc<Notify>,
}

impl Drop for H2Opening {
    fn drop(&mut self) {
        self.pool.inner.h2_opening.remove_if(&self.key, |_, n| Arc::ptr_eq(n, &self.notify));
        self.notify.notify_waiters();
    }
}

/// One socket request.
#[derive(Debug, Clone, Copy)]
pub struct SocketRequest<'a> {
    pub key: &'a PoolKey,
    pub target: &'a Url,
    pub proxy: Option<&'a ProxySettings>,
    pub proxy_authorization: Option<&'a str>,
    pub priority: RequestPriority,
}

struct PoolInner {
    config: PoolConfig,
    connector: Connector,
    groups: DashMap<PoolKey, Group>,
    total_active: AtomicUsize,
    total_idle: AtomicUsize,
    next_seq: AtomicU64,
    h2_sessions: DashMap<PoolKey, H2Connection>,
    h2c_declined: DashMap<PoolKey, ()>,
    /// Keys whose first HTTP/2 connection is still being set up.
    h2_opening: DashMap<PoolKey, Arc<Notify>>,
    /// TLS keys where ALPN settled on HTTP/1.1.
    alpn_http11: DashMap<PoolKey, ()>,
    tracker: Option<Arc<OperationTracker>>,
}

/// Owns physical connections: HTTP/1.1 sockets handed out exclusively
/// through [`PoolLease`], and shared HTTP/2 sessions.
#[derive(Clone)]
pub struct ClientSocketPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ClientSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("config", &self.inner.config)
            .field("total_active", &self.total_active_count())
            .field("idle", &self.idle_socket_count())
            .field("h2_sessions", &self.h2_session_count())
            .finish()
    }
}

impl ClientSocketPool {
    pub fn new(
        config: PoolConfig,
        connector: Connector,
        tracker: Option<Arc<OperationTracker>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                groups: DashMap::new(),
                total_active: AtomicUsize::new(0),
                total_idle: AtomicUsize::new(0),
                next_seq: AtomicU64::new(0),
                h2_sessions: DashMap::new(),
                h2c_declined: DashMap::new(),
                h2_opening: DashMap::new(),
                alpn_http11: DashMap::new(),
                tracker,
            }),
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    pub(crate) fn tracker(&self) -> Option<&Arc<OperationTracker>> {
        self.inner.tracker.as_ref()
    }

    /// Lease a connection for one HTTP/1.1 exchange (or for negotiating a
    /// new session). Waits in the group queue while limits are reached.
    pub async fn acquire(&self, req: SocketRequest<'_>) -> Result<PoolLease, NetError> {
        if self.at_total_limit() && !self.has_idle(req.key) {
            self.close_one_idle_socket(req.key);
        }
        let rx = {
            let mut group = self.inner.groups.entry(req.key.clone()).or_default();

            while let Some(idle) = group.idle_sockets.pop_back() {
                self.inner.total_idle.fetch_sub(1, Ordering::AcqRel);
                match idle.socket.is_usable() {
                    Ok(()) => {
                        group.active_count += 1;
                        self.inner.total_active.fetch_add(1, Ordering::AcqRel);
                        trace!(host = %req.key.host, "reusing idle connection");
                        return Ok(self.lease(req.key, idle.socket, true));
                    }
                    Err(e) => debug!(host = %req.key.host, error = %e, "discarding stale idle connection"),
                }
            }

            if group.has_available_slot(self.inner.config.max_connections_per_host) && !self.at_total_limit() {
                group.active_count += 1;
                self.inner.total_active.fetch_add(1, Ordering::AcqRel);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                group.pending_requests.push(PendingRequest {
                    priority: req.priority,
                    seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    sender: tx,
                });
                trace!(host = %req.key.host, "connection limit reached, queued");
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let mut queued = QueuedGrant { pool: self, key: req.key, rx };
            match (&mut queued.rx).await.map_err(|_| NetError::ConnectionAborted)? {
                Grant::Reuse(socket) => return Ok(self.lease(req.key, socket, true)),
                Grant::Connect => {}
            }
        }

        // the reserved slot is freed if connecting fails or is abandoned
        let mut slot = SlotGuard { pool: self, key: req.key, armed: true };
        let connect = ConnectRequest {
            target: req.target,
            proxy: req.proxy,
            proxy_authorization: req.proxy_authorization,
            alpn: req.key.alpn,
        };
        let socket = ConnectJob::connect(&self.inner.connector, connect).await?;
        slot.armed = false;
        let op = self.inner.tracker.as_ref().map(|t| t.track(TrackedKind::Connection));
        Ok(self.lease(req.key, WrappedSocket::new(socket, op), false))
    }

    fn lease(&self, key: &PoolKey, socket: WrappedSocket, reused: bool) -> PoolLease {
        PoolLease { pool: self.clone(), key: key.clone(), socket: Some(socket), reused }
    }

    /// Return a socket after a clean exchange.
    fn release_socket(&self, key: &PoolKey, mut socket: WrappedSocket) {
        socket.mark_used();
        if !socket.inner().is_connected() {
            debug!(host = %key.host, "released connection already closed");
            self.free_slot(key);
            return;
        }
        loop {
            let waiter = {
                let mut group = self.inner.groups.entry(key.clone()).or_default();
                match group.pop_highest_priority_request() {
                    Some(waiter) => waiter,
                    None => {
                        group.active_count = group.active_count.saturating_sub(1);
                        self.inner.total_active.fetch_sub(1, Ordering::AcqRel);
                        group.idle_sockets.push_back(IdleSocket { socket, start_time: Instant::now() });
                        self.inner.total_idle.fetch_add(1, Ordering::AcqRel);
                        break;
                    }
                }
            };
            // the slot moves to the waiter unchanged
            match waiter.sender.send(Grant::Reuse(socket)) {
                Ok(()) => return,
                Err(Grant::Reuse(back)) => socket = back,
                Err(Grant::Connect) => return,
            }
        }
        // the freed total capacity may unblock another group
        self.grant_waiting(key);
    }

    /// A leased slot ends without returning a socket.
    fn free_slot(&self, key: &PoolKey) {
        {
            let mut group = self.inner.groups.entry(key.clone()).or_default();
            group.active_count = group.active_count.saturating_sub(1);
            self.inner.total_active.fetch_sub(1, Ordering::AcqRel);
        }
        self.grant_waiting(key);
    }

    /// Hand a free slot to the best waiter, preferring `key`'s own group.
    fn grant_waiting(&self, key: &PoolKey) {
        loop {
            let Some((waiter_key, waiter)) = self.pop_grantable(key) else {
                return;
            };
            if waiter.sender.send(Grant::Connect).is_ok() {
                return;
            }
            // the waiter gave up; undo and try the next one
            if let Some(mut group) = self.inner.groups.get_mut(&waiter_key) {
                group.active_count = group.active_count.saturating_sub(1);
            }
            self.inner.total_active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn pop_grantable(&self, key: &PoolKey) -> Option<(PoolKey, PendingRequest)> {
        let max_per = self.inner.config.max_connections_per_host;
        if self.at_total_limit() {
            // an idle socket elsewhere gives way to a queued request
            let waiting = self
                .inner
                .groups
                .iter()
                .find(|g| !g.pending_requests.is_empty() && g.has_available_slot(max_per))
                .map(|g| g.key().clone());
            match waiting {
                Some(waiting) if self.close_one_idle_socket(&waiting) => {}
                _ => return None,
            }
        }
        let reserve = |group: &mut Group| {
            if !group.has_available_slot(max_per) {
                return None;
            }
            let waiter = group.pop_highest_priority_request()?;
            group.active_count += 1;
            self.inner.total_active.fetch_add(1, Ordering::AcqRel);
            Some(waiter)
        };
        if let Some(mut group) = self.inner.groups.get_mut(key) {
            if let Some(waiter) = reserve(&mut group) {
                return Some((key.clone(), waiter));
            }
        }
        for mut entry in self.inner.groups.iter_mut() {
            if let Some(waiter) = reserve(entry.value_mut()) {
                return Some((entry.key().clone(), waiter));
            }
        }
        None
    }

    /// Leased and idle sockets together fill `max_connections_total`.
    fn at_total_limit(&self) -> bool {
        let used = self.inner.total_active.load(Ordering::Acquire) + self.inner.total_idle.load(Ordering::Acquire);
        used >= self.inner.config.max_connections_total
    }

    fn has_idle(&self, key: &PoolKey) -> bool {
        self.inner.groups.get(key).is_some_and(|g| !g.idle_sockets.is_empty())
    }

    /// Close the oldest idle socket outside `except`'s group. Returns false
    /// when there is none.
    fn close_one_idle_socket(&self, except: &PoolKey) -> bool {
        for mut entry in self.inner.groups.iter_mut() {
            if entry.key() == except {
                continue;
            }
            if let Some(idle) = entry.value_mut().idle_sockets.pop_front() {
                self.inner.total_idle.fetch_sub(1, Ordering::AcqRel);
                debug!(host = %entry.key().host, "closing idle connection to make room");
                drop(idle);
                return true;
            }
        }
        false
    }

    /// A live session for `key` that can take another stream. Closed
    /// sessions are pruned on the way.
    pub fn h2_session(&self, key: &PoolKey) -> Option<H2Connection> {
        let session = self.inner.h2_sessions.get(key).map(|s| s.clone())?;
        if session.is_closed() {
            self.inner.h2_sessions.remove_if(key, |_, s| s.is_closed());
            return None;
        }
        session.has_capacity().then_some(session)
    }

    /// A session for `key`, or the right to open one. While another caller
    /// is opening the key's first connection this waits for its outcome
    /// instead of dialing in parallel.
    pub(crate) async fn checkout_h2(&self, key: &PoolKey) -> H2Checkout {
        loop {
            if let Some(session) = self.h2_session(key) {
                return H2Checkout::Reuse(session);
            }
            if self.inner.alpn_http11.contains_key(key) {
                return H2Checkout::Direct;
            }
            let notify = match self.inner.h2_opening.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    let notify = Arc::new(Notify::new());
                    vacant.insert(Arc::clone(&notify));
                    return H2Checkout::Open(H2Opening { pool: self.clone(), key: key.clone(), notify });
                }
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let still_opening =
                self.inner.h2_opening.get(key).is_some_and(|n| Arc::ptr_eq(n.value(), &notify));
            if still_opening {
                trace!(host = %key.host, "waiting for h2 session being opened");
                notified.await;
            }
        }
    }

    /// ALPN on a TLS connection to `key` picked HTTP/1.1.
    pub(crate) fn mark_http11(&self, key: &PoolKey) {
        self.inner.alpn_http11.insert(key.clone(), ());
    }

    /// Register a session. A live session already registered for the key
    /// stays in place.
    pub fn insert_h2_session(&self, key: &PoolKey, session: H2Connection) {
        let mut entry = self.inner.h2_sessions.entry(key.clone()).or_insert_with(|| session.clone());
        if entry.is_closed() {
            *entry = session;
        }
    }

    pub fn mark_h2c_declined(&self, key: &PoolKey) {
        debug!(host = %key.host, port = key.port, "h2c upgrade declined");
        self.inner.h2c_declined.insert(key.clone(), ());
    }

    pub fn h2c_declined(&self, key: &PoolKey) -> bool {
        self.inner.h2c_declined.contains_key(key)
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.groups.iter().map(|g| g.pending_requests.len()).sum()
    }

    /// Leased HTTP/1.1 connections, including ones still connecting.
    pub fn total_active_count(&self) -> usize {
        self.inner.total_active.load(Ordering::Acquire)
    }

    pub fn idle_socket_count(&self) -> usize {
        self.inner.groups.iter().map(|g| g.idle_sockets.len()).sum()
    }

    pub fn h2_session_count(&self) -> usize {
        self.inner.h2_sessions.iter().filter(|s| !s.is_closed()).count()
    }

    /// Drop expired or dead idle sockets, closed sessions and empty groups.
    pub fn cleanup_idle_sockets(&self) {
        let now = Instant::now();
        let config = &self.inner.config;
        let mut removed = 0;
        for mut entry in self.inner.groups.iter_mut() {
            let before = entry.idle_sockets.len();
            entry.value_mut().idle_sockets.retain(|idle| {
                let timeout = if idle.socket.was_ever_used() {
                    config.idle_timeout
                } else {
                    config.unused_idle_timeout
                };
                now.duration_since(idle.start_time) < timeout && idle.socket.inner().is_connected()
            });
            removed += before - entry.idle_sockets.len();
        }
        self.inner.total_idle.fetch_sub(removed, Ordering::AcqRel);
        self.inner.groups.retain(|_, g| !g.is_unused());
        self.inner.h2_sessions.retain(|_, s| !s.is_closed());
    }

    /// Run [`cleanup_idle_sockets`](Self::cleanup_idle_sockets) periodically
    /// until the pool is dropped.
    pub fn start_cleanup_task(&self, handle: &tokio::runtime::Handle) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.cleanup_interval;
        handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                ClientSocketPool { inner }.cleanup_idle_sockets();
            }
        });
    }
}

/// Exclusive use of one pooled connection.
///
/// [`release`](Self::release) returns it for reuse; anything else,
/// including dropping the lease, closes the connection and frees its slot.
pub struct PoolLease {
    pool: ClientSocketPool,
    key: PoolKey,
    socket: Option<WrappedSocket>,
    reused: bool,
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("key", &self.key)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

impl PoolLease {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// True when the connection came from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn socket(&self) -> Option<&SocketType> {
        self.socket.as_ref().map(WrappedSocket::inner)
    }

    pub fn socket_mut(&mut self) -> Result<&mut SocketType, NetError> {
        self.socket.as_mut().map(WrappedSocket::inner_mut).ok_or(NetError::SocketNotConnected)
    }

    pub fn pool(&self) -> &ClientSocketPool {
        &self.pool
    }

    pub fn release(mut self) {
        if let Some(socket) = self.socket.take() {
            trace!(host = %self.key.host, "connection released to pool");
            self.pool.release_socket(&self.key, socket);
        }
    }

    pub fn discard(mut self) {
        if self.socket.take().is_some() {
            warn!(host = %self.key.host, "connection discarded");
            self.pool.free_slot(&self.key);
        }
    }

    /// Take the transport out of the pool, e.g. for an HTTP/2 session.
    /// The slot is freed; the connection count moves with the socket.
    pub fn detach(mut self) -> Result<(SocketType, Option<TrackedOp>), NetError> {
        let socket = self.socket.take().ok_or(NetError::SocketNotConnected)?;
        self.pool.free_slot(&self.key);
        Ok(socket.into_parts())
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            debug!(host = %self.key.host, "lease dropped mid-exchange, closing connection");
            self.pool.free_slot(&self.key);
        }
    }
}
