//! Shared deadline timer.
//!
//! One driver task per client holds every pending deadline in a binary heap
//! and runs expiry actions strictly in absolute deadline order (ties in
//! registration order). Actions run on the driver task itself, so observers
//! notified from an action see expirations in that same order.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

type Action = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earlier deadline first, then registration order
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct DeadlineTimer {
    shared: Arc<Shared>,
}

impl DeadlineTimer {
    /// Start the driver task on `handle`.
    pub fn spawn(handle: &tokio::runtime::Handle) -> Self {
        let shared = Arc::new(Shared::default());
        handle.spawn(drive(Arc::clone(&shared)));
        Self { shared }
    }

    /// Run `action` at `deadline` unless the returned guard is disarmed or
    /// dropped first.
    pub fn register<F>(&self, deadline: Instant, action: F) -> TimerGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.shared.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(Entry {
                deadline,
                seq,
                cancelled: Arc::clone(&cancelled),
                action: Box::new(action),
            }));
        }
        self.shared.wake.notify_waiters();
        TimerGuard { cancelled }
    }

    /// Number of armed deadlines still waiting to fire.
    pub fn pending(&self) -> usize {
        self.shared
            .lock()
            .heap
            .iter()
            .filter(|e| !e.0.cancelled.load(Ordering::Acquire))
            .count()
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.wake.notify_waiters();
    }
}

impl fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineTimer").field("pending", &self.pending()).finish()
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (due, next) = {
            let mut state = shared.lock();
            if state.closed {
                state.heap.clear();
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while state.heap.peek().is_some_and(|top| top.0.deadline <= now) {
                if let Some(Reverse(entry)) = state.heap.pop() {
                    due.push(entry);
                }
            }
            (due, state.heap.peek().map(|top| top.0.deadline))
        };

        if !due.is_empty() {
            for entry in due {
                if !entry.cancelled.swap(true, Ordering::AcqRel) {
                    (entry.action)();
                }
            }
            continue;
        }

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut notified => {}
                }
            }
            None => notified.await,
        }
    }
}

/// Disarms its deadline when dropped.
#[derive(Debug)]
pub struct TimerGuard {
    cancelled: Arc<AtomicBool>,
}

impl TimerGuard {
    pub fn disarm(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}
