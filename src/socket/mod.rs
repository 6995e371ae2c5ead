//! Socket and connection management.
//!
//! Mirrors Chromium's `net/socket/`:
//! - [`pool`]: connection pooling (6 per host, 256 total) and HTTP/2 sessions
//! - [`connectjob`]: DNS → TCP → proxy tunnel → TLS
//! - [`proxy`]: proxy settings and selectors
//! - [`tls`]: TLS configuration with BoringSSL

pub mod authcache;
pub mod client;
pub mod connectjob;
pub mod matcher;
pub mod pool;
pub mod proxy;
pub mod tls;
