//! DNS resolution.
//!
//! [`Resolve`] is the seam the connect job resolves through. The client
//! defaults to [`GaiResolver`] (system `getaddrinfo` on the blocking pool);
//! [`DnsResolverWithOverrides`] pins chosen hostnames to fixed addresses,
//! which is how tests reach local fixture servers under real names.
//!
//! ```rust,ignore
//! use pulsenet::dns::{DnsResolverWithOverrides, GaiResolver, Name, Resolve};
//!
//! let resolver = GaiResolver::new();
//! let addrs = resolver.resolve(Name::new("example.com")).await?;
//! ```

mod gai;
mod resolve;

pub use gai::{AddressList, GaiResolver};
pub use resolve::{Addrs, DnsResolverWithOverrides, Name, Resolve, Resolving};
