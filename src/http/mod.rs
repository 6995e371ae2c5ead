//! HTTP semantics on top of the socket layer: requests and responses, the
//! HTTP/1.1 and HTTP/2 engines, and the policies the job applies between
//! exchanges.

pub mod auth;
pub mod body;
pub(crate) mod h1;
pub mod h2;
pub mod headers;
pub mod negotiate;
pub mod redirect;
pub mod request;
pub mod response;
pub mod retry;
pub(crate) mod transaction;

pub use body::{BodyHandler, BodyPublisher};
pub use headers::HttpHeaders;
pub use request::{HttpRequest, HttpRequestBuilder};
pub use response::HttpResponse;
