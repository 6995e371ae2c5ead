//! Immutable request values and their builder.

use crate::base::neterror::NetError;
use crate::http::body::BodyPublisher;
use crate::http::headers::{parse_pair, HeaderPolicy, HttpHeaders};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use std::time::Duration;
use url::Url;

/// A request ready to be sent, possibly more than once.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    url: Url,
    headers: HttpHeaders,
    body: Option<BodyPublisher>,
    timeout: Option<Duration>,
    expect_continue: bool,
    version: Option<Version>,
}

impl HttpRequest {
    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::new()
    }

    /// Shorthand for a GET request to `url`.
    pub fn get(url: &str) -> Result<Self, NetError> {
        Self::builder().uri(url).build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&BodyPublisher> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    /// Protocol version requested for this exchange, if any.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Copy of this request aimed at a different target, as produced by a
    /// redirect.
    pub(crate) fn redirected(
        &self,
        url: Url,
        method: Method,
        headers: HttpHeaders,
        body: Option<BodyPublisher>,
    ) -> Self {
        Self { method, url, headers, body, ..self.clone() }
    }

    /// Rejects `Proxy-Authorization` unless `policy` allows it. Called once
    /// the request is known to go through a proxy.
    pub(crate) fn check_proxied(&self, policy: &HeaderPolicy) -> Result<(), NetError> {
        if self.headers.contains(header::PROXY_AUTHORIZATION.as_str())
            && !policy.is_allowed(&header::PROXY_AUTHORIZATION)
        {
            return Err(NetError::RestrictedHeader {
                name: header::PROXY_AUTHORIZATION.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Builds an [`HttpRequest`].
///
/// Setters never fail; the first problem is kept and returned by
/// [`build`](Self::build).
#[derive(Debug)]
pub struct HttpRequestBuilder {
    method: Method,
    url: Option<Url>,
    headers: HeaderMap,
    body: Option<BodyPublisher>,
    timeout: Option<Duration>,
    expect_continue: bool,
    version: Option<Version>,
    policy: HeaderPolicy,
    error: Option<NetError>,
}

impl Default for HttpRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestBuilder {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            expect_continue: false,
            version: None,
            policy: HeaderPolicy::default(),
            error: None,
        }
    }

    fn fail(&mut self, err: NetError) {
        self.error.get_or_insert(err);
    }

    pub fn uri(mut self, url: &str) -> Self {
        match parse_target(url) {
            Ok(url) => self.url = Some(url),
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn url(mut self, url: Url) -> Self {
        match check_scheme(&url) {
            Ok(()) => self.url = Some(url),
            Err(e) => self.fail(e),
        }
        self
    }

    /// Restricted headers this builder accepts.
    pub fn header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Append a header value; earlier values for the same name are kept.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match parse_pair(name, value) {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => self.fail(e),
        }
        self
    }

    /// Replace every value of `name` with `value`.
    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        match parse_pair(name, value) {
            Ok((name, value)) => {
                self.headers.insert(name, value);
            }
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn headers<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in pairs {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// Deadline for receiving the response headers. Must be positive.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self.fail(NetError::InvalidArgument { reason: "timeout must be positive".into() });
        } else {
            self.timeout = Some(timeout);
        }
        self
    }

    pub fn expect_continue(mut self, enable: bool) -> Self {
        self.expect_continue = enable;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        if version == Version::HTTP_11 || version == Version::HTTP_2 {
            self.version = Some(version);
        } else {
            self.fail(NetError::InvalidArgument {
                reason: format!("unsupported protocol version {version:?}"),
            });
        }
        self
    }

    /// Set the method by name. Names must be HTTP tokens.
    pub fn method(mut self, method: &str, body: Option<BodyPublisher>) -> Self {
        match Method::from_bytes(method.as_bytes()) {
            Ok(m) => {
                self.method = m;
                self.body = body;
            }
            Err(_) => self.fail(NetError::InvalidMethod { method: method.to_string() }),
        }
        self
    }

    pub fn get(mut self) -> Self {
        self.method = Method::GET;
        self.body = None;
        self
    }

    pub fn delete(mut self) -> Self {
        self.method = Method::DELETE;
        self.body = None;
        self
    }

    pub fn post(mut self, body: BodyPublisher) -> Self {
        self.method = Method::POST;
        self.body = Some(body);
        self
    }

    pub fn put(mut self, body: BodyPublisher) -> Self {
        self.method = Method::PUT;
        self.body = Some(body);
        self
    }

    pub fn build(self) -> Result<HttpRequest, NetError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let url = self.url.ok_or(NetError::InvalidUrl)?;
        for name in self.headers.keys() {
            self.policy.check(name)?;
        }
        Ok(HttpRequest {
            method: self.method,
            url,
            headers: HttpHeaders::from_map(self.headers),
            body: self.body,
            timeout: self.timeout,
            expect_continue: self.expect_continue,
            version: self.version,
        })
    }
}

fn parse_target(raw: &str) -> Result<Url, NetError> {
    let url = Url::parse(raw).map_err(|_| NetError::InvalidUrl)?;
    check_scheme(&url)?;
    Ok(url)
}

fn check_scheme(url: &Url) -> Result<(), NetError> {
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(NetError::UnknownUrlScheme),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(NetError::InvalidUrl);
    }
    Ok(())
}

/// The wire-level head of one exchange: method, target and the final header
/// set in the order it is written.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// `host[:port]`, the port only when it is not the scheme default.
    pub fn authority(&self) -> String {
        authority_of(&self.url)
    }

    /// Path and query, never empty.
    pub fn origin_form(&self) -> String {
        let mut target = self.url.path().to_string();
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// The URL without its fragment, for requests to a forward proxy.
    pub fn absolute_form(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.to_string()
    }

    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }
}

pub(crate) fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
