//! Single-emitter delivery loop shared by the synchronous publishers and the
//! buffering adapter.
//!
//! Signals reach the subscriber only from the thread currently "draining".
//! A `request` or `cancel` issued from inside a callback only updates state;
//! the active drainer picks the change up on its next iteration, so
//! callbacks never re-enter the subscriber.

use super::{zero_demand_error, Subscriber, Subscription};
use crate::base::neterror::NetError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Lazily produces items when the subscriber has demand.
pub(crate) trait ChunkSource<T>: Send {
    /// `None` means the source is exhausted.
    fn pull(&mut self) -> Option<Result<T, NetError>>;
}

type StarvedHook = Box<dyn Fn() + Send + Sync>;

struct DrainState<T> {
    demand: u64,
    draining: bool,
    cancelled: bool,
    terminated: bool,
    queue: VecDeque<T>,
    end: Option<Result<(), NetError>>,
    violation: Option<NetError>,
    source: Option<Box<dyn ChunkSource<T>>>,
}

enum Step<T> {
    Next(T),
    Error(NetError),
    Complete,
    Starved,
    Idle,
}

pub(crate) struct DrainSubscription<T> {
    state: Mutex<DrainState<T>>,
    subscriber: Mutex<Option<Box<dyn Subscriber<T>>>>,
    starved: Option<StarvedHook>,
    this: Weak<DrainSubscription<T>>,
}

impl<T: Send + 'static> DrainSubscription<T> {
    /// Subscribe `subscriber`, pulling from `source` on demand.
    pub(crate) fn with_source(
        subscriber: Box<dyn Subscriber<T>>,
        source: Box<dyn ChunkSource<T>>,
    ) -> Arc<Self> {
        Self::start(subscriber, Some(source), None)
    }

    /// Subscribe `subscriber` to items fed through [`push`](Self::push).
    /// `starved` runs whenever the subscriber has demand and nothing is queued.
    pub(crate) fn with_queue(subscriber: Box<dyn Subscriber<T>>, starved: StarvedHook) -> Arc<Self> {
        Self::start(subscriber, None, Some(starved))
    }

    fn start(
        subscriber: Box<dyn Subscriber<T>>,
        source: Option<Box<dyn ChunkSource<T>>>,
        starved: Option<StarvedHook>,
    ) -> Arc<Self> {
        let sub = Arc::new_cyclic(|this| Self {
            state: Mutex::new(DrainState {
                demand: 0,
                // on_subscribe below runs as the first drain pass
                draining: true,
                cancelled: false,
                terminated: false,
                queue: VecDeque::new(),
                end: None,
                violation: None,
                source,
            }),
            subscriber: Mutex::new(Some(subscriber)),
            starved,
            this: this.clone(),
        });
        let handle: Arc<dyn Subscription> = sub.clone();
        if let Some(s) = sub.lock_subscriber().as_mut() {
            s.on_subscribe(handle);
        }
        sub.drain();
        sub
    }

    fn lock_state(&self) -> MutexGuard<'_, DrainState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscriber(&self) -> MutexGuard<'_, Option<Box<dyn Subscriber<T>>>> {
        self.subscriber.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, item: T) {
        {
            let mut st = self.lock_state();
            if st.cancelled || st.terminated {
                return;
            }
            st.queue.push_back(item);
        }
        self.try_drain();
    }

    pub(crate) fn finish(&self, result: Result<(), NetError>) {
        {
            let mut st = self.lock_state();
            if st.cancelled || st.terminated || st.end.is_some() {
                return;
            }
            st.end = Some(result);
        }
        self.try_drain();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled
    }

    pub(crate) fn has_demand(&self) -> bool {
        let st = self.lock_state();
        st.demand > 0 && !st.cancelled
    }

    fn try_drain(&self) {
        {
            let mut st = self.lock_state();
            if st.draining {
                return;
            }
            st.draining = true;
        }
        self.drain();
    }

    fn next_step(&self) -> Step<T> {
        let mut st = self.lock_state();
        if st.terminated || st.cancelled {
            st.source = None;
            st.draining = false;
            return Step::Idle;
        }
        if let Some(err) = st.violation.take() {
            st.terminated = true;
            st.source = None;
            return Step::Error(err);
        }
        // Errors overtake queued items; completion waits for the queue.
        if matches!(st.end, Some(Err(_))) {
            st.terminated = true;
            st.source = None;
            return match st.end.take() {
                Some(Err(e)) => Step::Error(e),
                _ => Step::Complete,
            };
        }
        if st.demand > 0 {
            if let Some(item) = st.queue.pop_front() {
                st.demand -= 1;
                return Step::Next(item);
            }
        }
        if st.queue.is_empty() && st.end.is_some() {
            st.terminated = true;
            st.end = None;
            return Step::Complete;
        }
        if st.demand == 0 {
            st.draining = false;
            return Step::Idle;
        }
        match st.source.as_mut().map(|s| s.pull()) {
            Some(Some(Ok(item))) => {
                st.demand -= 1;
                Step::Next(item)
            }
            Some(Some(Err(e))) => {
                st.terminated = true;
                st.source = None;
                Step::Error(e)
            }
            Some(None) => {
                st.terminated = true;
                st.source = None;
                Step::Complete
            }
            None => {
                st.draining = false;
                Step::Starved
            }
        }
    }

    fn drain(&self) {
        loop {
            match self.next_step() {
                Step::Next(item) => {
                    if let Some(s) = self.lock_subscriber().as_mut() {
                        s.on_next(item);
                    }
                }
                Step::Error(err) => {
                    let sub = self.lock_subscriber().take();
                    if let Some(mut s) = sub {
                        s.on_error(err);
                    }
                    return;
                }
                Step::Complete => {
                    let sub = self.lock_subscriber().take();
                    if let Some(mut s) = sub {
                        s.on_complete();
                    }
                    return;
                }
                Step::Starved => {
                    if let Some(hook) = &self.starved {
                        hook();
                    }
                    return;
                }
                Step::Idle => {
                    let cancelled = self.lock_state().cancelled;
                    if cancelled {
                        self.lock_subscriber().take();
                    }
                    return;
                }
            }
        }
    }
}

impl<T: Send + 'static> Subscription for DrainSubscription<T> {
    fn request(&self, n: u64) {
        {
            let mut st = self.lock_state();
            if st.cancelled || st.terminated {
                return;
            }
            if n == 0 {
                st.violation.get_or_insert_with(zero_demand_error);
            } else {
                st.demand = st.demand.saturating_add(n);
            }
        }
        if let Some(this) = self.this.upgrade() {
            this.try_drain();
        }
    }

    fn cancel(&self) {
        let mut st = self.lock_state();
        st.cancelled = true;
        st.queue.clear();
        // Dropping the source releases files and readers.
        st.source = None;
    }
}
