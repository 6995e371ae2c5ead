//! Per-response choice of body subscriber.

use super::subscribers::{self, BodyReader, BoxBodySubscriber, ByteStream};
use super::Subscriber;
use crate::http::headers::HttpHeaders;
use bytes::Bytes;
use encoding_rs::Encoding;
use futures::stream::BoxStream;
use http::{StatusCode, Version};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Status line and headers of a response, seen by a [`BodyHandler`] before
/// any body byte is read.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HttpHeaders,
    pub version: Version,
}

impl ResponseInfo {
    /// Charset named by `Content-Type`, UTF-8 when absent or unknown.
    pub fn charset(&self) -> &'static Encoding {
        self.headers
            .first_value("content-type")
            .and_then(charset_param)
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or_else(subscribers::default_charset)
    }
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

type MakeSubscriber<T> = dyn Fn(&ResponseInfo) -> BoxBodySubscriber<T> + Send + Sync;

/// Chooses the subscriber for each response.
pub struct BodyHandler<T> {
    make: Arc<MakeSubscriber<T>>,
}

impl<T> Clone for BodyHandler<T> {
    fn clone(&self) -> Self {
        Self { make: Arc::clone(&self.make) }
    }
}

impl<T> fmt::Debug for BodyHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyHandler").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> BodyHandler<T> {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn(&ResponseInfo) -> BoxBodySubscriber<T> + Send + Sync + 'static,
    {
        Self { make: Arc::new(make) }
    }

    pub(crate) fn apply(&self, info: &ResponseInfo) -> BoxBodySubscriber<T> {
        (self.make)(info)
    }

    /// Discard the body and produce `value` for every response.
    pub fn replacing(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |_| subscribers::replacing(value.clone()))
    }

    /// Wrap the handler's subscriber so it sees chunks of at least `size`.
    pub fn buffering(inner: BodyHandler<T>, size: usize) -> Self {
        Self::new(move |info| subscribers::buffering(inner.apply(info), size))
    }

    /// Fail with `ResponseBodyTooLarge` beyond `max_bytes`.
    pub fn limited(inner: BodyHandler<T>, max_bytes: u64) -> Self {
        Self::new(move |info| subscribers::limited(inner.apply(info), max_bytes))
    }

    /// Apply `finisher` to a fresh `make()` subscriber after it completes.
    pub fn from_subscriber_mapped<S, M, F>(make: M, finisher: F) -> Self
    where
        S: Subscriber<Bytes> + 'static,
        M: Fn() -> S + Send + Sync + 'static,
        F: Fn(&mut S) -> T + Clone + Send + Sync + 'static,
    {
        Self::new(move |_| subscribers::from_subscriber_mapped(make(), finisher.clone()))
    }
}

impl BodyHandler<Bytes> {
    pub fn bytes() -> Self {
        Self::new(|_| subscribers::of_bytes())
    }
}

impl BodyHandler<String> {
    /// Decode with the response's charset.
    pub fn string() -> Self {
        Self::new(|info| subscribers::of_string(info.charset()))
    }

    pub fn string_with_charset(encoding: &'static Encoding) -> Self {
        Self::new(move |_| subscribers::of_string(encoding))
    }
}

impl BodyHandler<()> {
    pub fn discarding() -> Self {
        Self::new(|_| subscribers::discarding())
    }

    pub fn consumer<F>(consumer: F) -> Self
    where
        F: Fn(Option<Bytes>) + Clone + Send + Sync + 'static,
    {
        Self::new(move |_| subscribers::of_consumer(consumer.clone()))
    }

    pub fn from_subscriber<S, M>(make: M) -> Self
    where
        S: Subscriber<Bytes> + 'static,
        M: Fn() -> S + Send + Sync + 'static,
    {
        Self::new(move |_| subscribers::from_subscriber(make()))
    }
}

impl BodyHandler<PathBuf> {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(move |_| subscribers::of_file(path.clone()))
    }
}

impl BodyHandler<ByteStream> {
    pub fn byte_stream() -> Self {
        Self::new(|_| subscribers::of_byte_stream())
    }
}

impl BodyHandler<BodyReader> {
    pub fn reader() -> Self {
        Self::new(|_| subscribers::of_reader())
    }
}

impl BodyHandler<BoxStream<'static, Result<String, crate::base::neterror::NetError>>> {
    /// Lines decoded with the response's charset.
    pub fn lines() -> Self {
        Self::new(|info| subscribers::of_lines(info.charset()))
    }
}

#[cfg(feature = "json")]
impl<T> BodyHandler<T>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    pub fn json() -> Self {
        Self::new(|_| subscribers::of_json())
    }
}
