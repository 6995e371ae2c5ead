//! Request orchestration: the shared client context and the per-send job.

pub mod context;
pub(crate) mod job;

pub use context::{ClientConfig, URLRequestContext};
