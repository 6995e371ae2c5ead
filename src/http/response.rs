//! HTTP response with its decoded body.

use crate::http::headers::HttpHeaders;
use crate::socket::tls::TlsInfo;
use http::{StatusCode, Version};
use url::Url;

/// Status and headers of a response that was followed by another request
/// (a redirect or an authentication round trip).
#[derive(Debug, Clone)]
pub struct PreviousResponse {
    pub status: StatusCode,
    pub headers: HttpHeaders,
    pub url: Url,
}

/// The final response of a send, with the body produced by the chosen
/// [`BodyHandler`](crate::http::body::BodyHandler).
#[derive(Debug)]
pub struct HttpResponse<T> {
    status: StatusCode,
    version: Version,
    headers: HttpHeaders,
    url: Url,
    body: T,
    tls_info: Option<TlsInfo>,
    previous: Vec<PreviousResponse>,
}

impl<T> HttpResponse<T> {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HttpHeaders,
        url: Url,
        body: T,
        tls_info: Option<TlsInfo>,
        previous: Vec<PreviousResponse>,
    ) -> Self {
        Self { status, version, headers, url, body, tls_info, previous }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Protocol version the exchange actually used.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    /// URL of the final request, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    /// TLS session details, `None` for plaintext exchanges.
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls_info.as_ref()
    }

    /// Earlier responses of this send, oldest first.
    pub fn previous(&self) -> &[PreviousResponse] {
        &self.previous
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> HttpResponse<U> {
        HttpResponse {
            status: self.status,
            version: self.version,
            headers: self.headers,
            url: self.url,
            body: f(self.body),
            tls_info: self.tls_info,
            previous: self.previous,
        }
    }
}
