//! # pulsenet
//!
//! An asynchronous HTTP/1.1 and HTTP/2 client modelled on Chromium's
//! network stack.
//!
//! ## Features
//!
//! - **Connection Pooling**: per-destination limits (6 per host, 256 total),
//!   idle reuse and priority-ordered waiters
//! - **HTTP/1.1 & HTTP/2**: ALPN, `h2c` upgrade and prior knowledge, with
//!   stream multiplexing over one connection
//! - **Body Streaming**: demand-driven publishers and subscribers for request
//!   and response bodies
//! - **Redirects, Authentication and Retry**: Basic and Digest, cached
//!   credentials, one safe resend after a connection failure
//! - **Proxy Support**: HTTP CONNECT tunnels, forward proxies, fallback
//!   between proxies
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulsenet::{BodyHandler, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pulsenet::NetError> {
//!     let client = Client::new()?;
//!     let request = client.get("https://example.com").build()?;
//!     let response = client.send(request, BodyHandler::string()).await?;
//!     println!("Status: {}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors, cancellation, timers and operation tracking
//! - [`dns`] - Name resolution
//! - [`http`] - Requests, responses, protocol engines and policies
//! - [`socket`] - Connection pooling, proxies, TLS and auth cache
//! - [`urlrequest`] - Client configuration and request orchestration

pub mod base;
pub mod client;
pub mod dns;
pub mod http;
pub mod socket;
pub mod urlrequest;

pub use base::cancel::CancelToken;
pub use base::neterror::{ErrorCategory, NetError};
pub use client::{Client, ClientBuilder, ResponseFuture};
pub use http::auth::{Authenticator, Credentials};
pub use http::body::{BodyHandler, BodyPublisher};
pub use http::redirect::RedirectPolicy;
pub use http::{HttpHeaders, HttpRequest, HttpResponse};
pub use urlrequest::context::ClientConfig;
