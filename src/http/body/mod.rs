//! Body streaming contract.
//!
//! Request and response bodies move as chunks of [`Bytes`] through a
//! pull-based publisher/subscriber protocol:
//!
//! - a [`Subscriber`] receives `on_subscribe` exactly once, then at most as
//!   many `on_next` calls as it has requested through its [`Subscription`],
//!   then at most one terminal `on_error` or `on_complete`;
//! - `request(0)` is a contract violation reported through `on_error`;
//! - after `cancel` no further signals are delivered and the producer's
//!   resources are released;
//! - a subscriber already holding an active subscription cancels any later
//!   one immediately without requesting from it ([`SubscriptionSlot`]).
//!
//! [`BodyPublisher`] covers the request side, [`BodyHandler`] and the
//! [`subscribers`] adapters the response side. The [`wire`] module connects
//! both to the protocol engines.

use crate::base::neterror::NetError;
use std::sync::Arc;

pub(crate) mod drain;
pub mod handler;
pub mod publisher;
pub mod subscribers;
pub(crate) mod wire;

pub use bytes::Bytes;
pub use handler::{BodyHandler, ResponseInfo};
pub use publisher::{BodyPublisher, Subscribe};
pub use subscribers::{BodyFuture, BodySubscriber};

/// Demand and cancellation handle given to a subscriber.
pub trait Subscription: Send + Sync {
    /// Allow up to `n` more `on_next` signals. `n == 0` is a violation.
    fn request(&self, n: u64);
    /// Stop production; no further signals follow.
    fn cancel(&self);
}

/// Consumer side of the contract.
pub trait Subscriber<T>: Send {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);
    fn on_next(&mut self, item: T);
    fn on_error(&mut self, error: NetError);
    fn on_complete(&mut self);
}

impl<T, S: Subscriber<T> + ?Sized> Subscriber<T> for Box<S> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        (**self).on_subscribe(subscription)
    }

    fn on_next(&mut self, item: T) {
        (**self).on_next(item)
    }

    fn on_error(&mut self, error: NetError) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }
}

/// Holds a subscriber's single active subscription.
#[derive(Default)]
pub struct SubscriptionSlot {
    current: Option<Arc<dyn Subscription>>,
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `incoming` unless a subscription is already active, in which
    /// case `incoming` is cancelled and `false` is returned.
    pub fn accept(&mut self, incoming: Arc<dyn Subscription>) -> bool {
        if self.current.is_some() {
            incoming.cancel();
            return false;
        }
        self.current = Some(incoming);
        true
    }

    pub fn request(&self, n: u64) {
        if let Some(s) = &self.current {
            s.request(n);
        }
    }

    pub fn cancel(&mut self) {
        if let Some(s) = self.current.take() {
            s.cancel();
        }
    }

    /// Forget the subscription after a terminal signal.
    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn get(&self) -> Option<&Arc<dyn Subscription>> {
        self.current.as_ref()
    }
}

/// A subscription that ignores demand. Handed out when a publisher cannot
/// produce anything and reports why through `on_error`.
pub(crate) struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

pub(crate) fn zero_demand_error() -> NetError {
    NetError::InvalidArgument { reason: "subscription request must be positive".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        requested: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl Subscription for Counting {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n as usize, Ordering::SeqCst);
        }
        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_second_subscription_is_cancelled() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let mut slot = SubscriptionSlot::new();

        assert!(slot.accept(first.clone()));
        assert!(!slot.accept(second.clone()));
        slot.request(3);

        assert_eq!(first.requested.load(Ordering::SeqCst), 3);
        assert_eq!(first.cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(second.requested.load(Ordering::SeqCst), 0);
        assert_eq!(second.cancelled.load(Ordering::SeqCst), 1);
    }
}
