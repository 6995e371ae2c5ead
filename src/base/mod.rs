//! Base types and error handling.
//!
//! Foundational types shared by every layer:
//! - [`NetError`](neterror::NetError): network error codes and categories
//! - [`LoadState`](loadstate::LoadState): request progress states
//! - [`OperationTracker`](tracker::OperationTracker): per-client outstanding work
//! - [`DeadlineTimer`](timer::DeadlineTimer): shared timeout facility
//! - [`CancelToken`](cancel::CancelToken): caller-driven interruption

pub mod cancel;
pub mod completion;
pub mod context;
pub mod loadstate;
pub mod neterror;
pub mod timer;
pub mod tracker;
