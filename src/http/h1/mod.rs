//! HTTP/1.1 exchange engine.
//!
//! One request and one response at a time per connection. [`codec`] holds
//! the wire format; [`connection`] drives an exchange on a pooled socket and
//! hands the response body to the body contract as a [`WireBody`].
//!
//! [`WireBody`]: crate::http::body::wire::WireBody

pub(crate) mod codec;
pub(crate) mod connection;

pub(crate) use connection::{H1Body, H1Connection, H1Options, H1Outcome};
