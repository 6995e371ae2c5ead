//! One-shot completion slot shared by an operation and its observers.
//!
//! The first call to [`Completion::complete`] wins; later ones are ignored.
//! The value is handed either to a registered callback (run synchronously
//! by whoever completes the slot) or to a task polling [`Completion::poll_take`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

type Callback<T> = Box<dyn FnOnce(T) + Send>;

enum Slot<T> {
    Pending { waker: Option<Waker>, callback: Option<Callback<T>> },
    Ready(T),
    Consumed,
}

pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
}

impl<T: Send + 'static> Completion<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slot: Mutex::new(Slot::Pending { waker: None, callback: None }) })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Complete the slot. Returns false if it was already completed.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Pending { callback: Some(callback), .. } => {
                drop(slot);
                callback(value);
                true
            }
            Slot::Pending { waker, callback: None } => {
                *slot = Slot::Ready(value);
                drop(slot);
                if let Some(waker) = waker {
                    waker.wake();
                }
                true
            }
            done => {
                *slot = done;
                false
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending { .. })
    }

    /// Run `f` with the value once available; immediately if it already is.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Ready(value) => {
                drop(slot);
                f(value);
            }
            Slot::Pending { waker, .. } => {
                *slot = Slot::Pending { waker, callback: Some(Box::new(f)) };
            }
            Slot::Consumed => {}
        }
    }

    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Ready(value) => Poll::Ready(Some(value)),
            Slot::Pending { callback, .. } => {
                *slot = Slot::Pending { waker: Some(cx.waker().clone()), callback };
                Poll::Pending
            }
            Slot::Consumed => Poll::Ready(None),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.slot.lock().unwrap_or_else(|e| e.into_inner()) {
            Slot::Pending { .. } => "pending",
            Slot::Ready(_) => "ready",
            Slot::Consumed => "consumed",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_completion_wins() {
        let slot = Completion::new();
        assert!(slot.complete(1));
        assert!(!slot.complete(2));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        slot.on_complete(move |v| seen2.store(v, Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_runs_on_completion() {
        let slot = Completion::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        slot.on_complete(move |v| seen2.store(v, Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        slot.complete(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(slot.is_complete());
    }
}
