//! HTTP/2 client: framing, HPACK and the multiplexed session.

pub(crate) mod connection;
pub mod error;
pub mod flow;
pub mod frame;
pub mod hpack;
mod huffman;
pub mod settings;
pub(crate) mod stream;

pub use connection::{H2Config, H2Connection};
pub use error::{ErrorCode, H2Error};
pub use settings::Settings;
