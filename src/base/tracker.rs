//! Per-client bookkeeping of outstanding operations.
//!
//! Every exchange, stream, async send and open connection holds a
//! [`TrackedOp`] guard for its lifetime. Once all work has finished and the
//! client has been dropped, every counter is back to zero; a non-zero
//! snapshot at that point is a leak.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Kinds of operations counted by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedKind {
    Http1Exchange,
    Http2Stream,
    PendingOperation,
    Connection,
}

#[derive(Default)]
pub struct OperationTracker {
    http1_exchanges: AtomicUsize,
    http2_streams: AtomicUsize,
    pending_operations: AtomicUsize,
    open_connections: AtomicUsize,
}

/// Point-in-time copy of the tracker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerSnapshot {
    pub http1_exchanges: usize,
    pub http2_streams: usize,
    pub pending_operations: usize,
    pub open_connections: usize,
}

impl TrackerSnapshot {
    /// Exchanges, streams and async operations still in flight.
    pub fn outstanding_operations(&self) -> usize {
        self.http1_exchanges + self.http2_streams + self.pending_operations
    }

    /// True when nothing at all is outstanding, connections included.
    pub fn is_idle(&self) -> bool {
        self.outstanding_operations() == 0 && self.open_connections == 0
    }
}

impl OperationTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self, kind: TrackedKind) -> &AtomicUsize {
        match kind {
            TrackedKind::Http1Exchange => &self.http1_exchanges,
            TrackedKind::Http2Stream => &self.http2_streams,
            TrackedKind::PendingOperation => &self.pending_operations,
            TrackedKind::Connection => &self.open_connections,
        }
    }

    /// Count one operation of `kind` until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, kind: TrackedKind) -> TrackedOp {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
        TrackedOp { tracker: Arc::clone(self), kind }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            http1_exchanges: self.http1_exchanges.load(Ordering::Acquire),
            http2_streams: self.http2_streams.load(Ordering::Acquire),
            pending_operations: self.pending_operations.load(Ordering::Acquire),
            open_connections: self.open_connections.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// RAII guard decrementing its counter on drop.
pub struct TrackedOp {
    tracker: Arc<OperationTracker>,
    kind: TrackedKind,
}

impl TrackedOp {
    pub fn kind(&self) -> TrackedKind {
        self.kind
    }
}

impl fmt::Debug for TrackedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedOp").field("kind", &self.kind).finish()
    }
}

impl Drop for TrackedOp {
    fn drop(&mut self) {
        self.tracker.counter(self.kind).fetch_sub(1, Ordering::AcqRel);
    }
}
