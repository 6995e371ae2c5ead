//! Redirect following.
//!
//! Mirrors Chromium's `RedirectInfo`: how a 3xx response turns into the
//! next request, which headers survive, and when a chain must stop.

use crate::base::neterror::NetError;
use crate::http::headers::HttpHeaders;
use crate::http::request::HttpRequest;
use http::header::{self, HeaderMap};
use http::{Method, StatusCode};
use std::collections::HashSet;
use url::Url;

/// Default maximum number of redirects per send (Chromium uses 20).
pub const DEFAULT_MAX_REDIRECTS: usize = 20;

/// Which redirects are followed automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPolicy {
    /// Return every 3xx response to the caller.
    Never,
    Always,
    /// Follow everything except a downgrade from `https` to `http`.
    #[default]
    Normal,
}

fn is_followed_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// The request to send for a redirect response, or `None` when the
/// response is final for this policy.
pub(crate) fn next_request(
    current: &HttpRequest,
    status: StatusCode,
    headers: &HttpHeaders,
    policy: RedirectPolicy,
) -> Result<Option<HttpRequest>, NetError> {
    if policy == RedirectPolicy::Never || !is_followed_status(status) {
        return Ok(None);
    }
    let Some(location) = headers.first_value("location") else {
        return Ok(None);
    };
    let mut target = current.url().join(location.trim()).map_err(|_| NetError::InvalidRedirect)?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(NetError::UnsafeRedirect);
    }
    if target.host_str().map_or(true, str::is_empty) {
        return Err(NetError::InvalidRedirect);
    }
    if policy == RedirectPolicy::Normal
        && current.url().scheme() == "https"
        && target.scheme() == "http"
    {
        return Ok(None);
    }
    if target.fragment().is_none() {
        target.set_fragment(current.url().fragment());
    }

    let method = current.method();
    let to_get = match status.as_u16() {
        303 => *method != Method::HEAD,
        301 | 302 => *method == Method::POST,
        _ => false,
    };
    let (method, body) = if to_get {
        (Method::GET, None)
    } else {
        (method.clone(), current.body().cloned())
    };

    let headers = carried_headers(current, &target, body.is_none());
    Ok(Some(current.redirected(target, method, headers, body)))
}

/// Headers copied to the redirected request.
fn carried_headers(current: &HttpRequest, target: &Url, body_dropped: bool) -> HttpHeaders {
    let same_origin = current.url().origin() == target.origin();
    let mut map = HeaderMap::with_capacity(current.headers().len());
    for (name, value) in current.headers().iter() {
        let framing = *name == header::CONTENT_LENGTH
            || *name == header::TRANSFER_ENCODING
            || *name == header::HOST
            || (body_dropped && *name == header::CONTENT_TYPE);
        let credential = *name == header::AUTHORIZATION || *name == header::COOKIE;
        if framing || (credential && !same_origin) {
            continue;
        }
        map.append(name.clone(), value.clone());
    }
    HttpHeaders::from_map(map)
}

/// Bookkeeping for one redirect chain.
#[derive(Debug)]
pub(crate) struct RedirectChain {
    seen: HashSet<(Method, String)>,
    followed: usize,
    max: usize,
}

impl RedirectChain {
    pub fn new(first: &HttpRequest, max: usize) -> Self {
        let mut seen = HashSet::new();
        seen.insert(chain_key(first));
        Self { seen, followed: 0, max }
    }

    /// Account for following a redirect to `next`.
    pub fn follow(&mut self, next: &HttpRequest) -> Result<(), NetError> {
        self.followed += 1;
        if self.followed > self.max {
            return Err(NetError::TooManyRedirects);
        }
        if !self.seen.insert(chain_key(next)) {
            return Err(NetError::RedirectCycleDetected);
        }
        Ok(())
    }
}

fn chain_key(request: &HttpRequest) -> (Method, String) {
    let mut url = request.url().clone();
    url.set_fragment(None);
    (request.method().clone(), url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body::BodyPublisher;

    fn location(value: &str) -> HttpHeaders {
        HttpHeaders::from_pairs([("location", value)]).unwrap()
    }

    fn post(url: &str) -> HttpRequest {
        HttpRequest::builder()
            .uri(url)
            .post(BodyPublisher::from_text("data"))
            .header("content-type", "text/plain")
            .header("authorization", "Basic eA==")
            .header("x-keep", "1")
            .build()
            .unwrap()
    }

    #[test]
    fn test_post_303_becomes_get() {
        let req = post("http://a.example/form");
        let next = next_request(&req, StatusCode::SEE_OTHER, &location("/done"), RedirectPolicy::Normal)
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), &Method::GET);
        assert!(next.body().is_none());
        assert_eq!(next.url().as_str(), "http://a.example/done");
        assert!(!next.headers().contains("content-type"));
        assert_eq!(next.headers().first_value("authorization"), Some("Basic eA=="));
    }

    #[test]
    fn test_307_keeps_method_and_body() {
        let req = post("http://a.example/form");
        let next = next_request(
            &req,
            StatusCode::TEMPORARY_REDIRECT,
            &location("http://b.example/x"),
            RedirectPolicy::Normal,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.method(), &Method::POST);
        assert!(next.body().is_some());
        assert!(!next.headers().contains("authorization"));
        assert_eq!(next.headers().first_value("x-keep"), Some("1"));
    }

    #[test]
    fn test_head_303_stays_head() {
        let req = HttpRequest::builder().uri("http://a.example/").method("HEAD", None).build().unwrap();
        let next = next_request(&req, StatusCode::SEE_OTHER, &location("/b"), RedirectPolicy::Always)
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), &Method::HEAD);
    }

    #[test]
    fn test_policies() {
        let req = HttpRequest::get("https://a.example/").unwrap();
        let downgrade = location("http://a.example/");
        assert!(next_request(&req, StatusCode::FOUND, &downgrade, RedirectPolicy::Normal)
            .unwrap()
            .is_none());
        assert!(next_request(&req, StatusCode::FOUND, &downgrade, RedirectPolicy::Always)
            .unwrap()
            .is_some());
        assert!(next_request(&req, StatusCode::FOUND, &downgrade, RedirectPolicy::Never)
            .unwrap()
            .is_none());
        assert!(next_request(&req, StatusCode::USE_PROXY, &downgrade, RedirectPolicy::Always)
            .unwrap()
            .is_none());
        assert!(matches!(
            next_request(&req, StatusCode::FOUND, &location("ftp://x/"), RedirectPolicy::Always),
            Err(NetError::UnsafeRedirect)
        ));
    }

    #[test]
    fn test_chain_limits() {
        let first = HttpRequest::get("http://a.example/0").unwrap();
        let mut chain = RedirectChain::new(&first, 2);
        chain.follow(&HttpRequest::get("http://a.example/1").unwrap()).unwrap();
        assert!(matches!(chain.follow(&first), Err(NetError::RedirectCycleDetected)));

        let mut chain = RedirectChain::new(&first, 1);
        chain.follow(&HttpRequest::get("http://a.example/1").unwrap()).unwrap();
        assert!(matches!(
            chain.follow(&HttpRequest::get("http://a.example/2").unwrap()),
            Err(NetError::TooManyRedirects)
        ));
    }
}
