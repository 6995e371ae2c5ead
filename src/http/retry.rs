//! Automatic resend of a request after a connection failure.
//!
//! Based on Chromium's `HttpNetworkTransaction::ShouldResendRequest` and its
//! RetryReason enum. A request is resent at most once, on a fresh
//! connection, and only when the server cannot have acted on it.

use crate::base::neterror::NetError;
use http::Method;

/// Reasons for retrying a request (mirrors Chromium's RetryReason enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Server closed connection unexpectedly
    ConnectionReset,
    /// Connection was closed during request
    ConnectionClosed,
    ConnectionAborted,
    SocketNotConnected,
    EmptyResponse,
    /// HTTP/2 server refused stream
    Http2ServerRefusedStream,
    /// Stream above the peer's GOAWAY last stream id
    Http2GoAway,
}

impl RetryReason {
    /// Map a NetError to a RetryReason, if the error is retryable.
    pub fn from_error(error: &NetError) -> Option<Self> {
        match error {
            NetError::ConnectionReset => Some(Self::ConnectionReset),
            NetError::ConnectionClosed | NetError::SocketRemoteClosed => {
                Some(Self::ConnectionClosed)
            }
            NetError::ConnectionAborted => Some(Self::ConnectionAborted),
            NetError::SocketNotConnected => Some(Self::SocketNotConnected),
            NetError::EmptyResponse => Some(Self::EmptyResponse),
            NetError::Http2ServerRefusedStream => Some(Self::Http2ServerRefusedStream),
            NetError::Http2GoAway { .. } => Some(Self::Http2GoAway),
            _ => None,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Resends per logical request (default: 1)
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { enabled: true, max_attempts: 1 }
    }
}

impl RetryConfig {
    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self { enabled: false, max_attempts: 0 }
    }
}

/// How far one attempt got before it failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    /// A connection or session was obtained.
    pub connected: bool,
    /// The connection came from the idle pool.
    pub reused: bool,
    /// The whole request head reached the socket.
    pub request_sent: bool,
    /// At least one response byte was read.
    pub response_started: bool,
}

/// A failed attempt together with its progress.
#[derive(Debug, Clone)]
pub(crate) struct AttemptError {
    pub error: NetError,
    pub progress: Progress,
}

impl AttemptError {
    pub fn new(error: NetError, progress: Progress) -> Self {
        Self { error, progress }
    }

    /// An error before any connection was involved.
    pub fn early(error: NetError) -> Self {
        Self { error, progress: Progress::default() }
    }
}

/// Methods a server must tolerate receiving twice.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

/// Decide whether `failure` on attempt number `attempt` (0-based) is
/// resent.
pub(crate) fn should_retry(
    attempt: usize,
    method: &Method,
    failure: &AttemptError,
    config: &RetryConfig,
) -> Option<RetryReason> {
    if !config.enabled || attempt >= config.max_attempts {
        return None;
    }
    let reason = RetryReason::from_error(&failure.error)?;
    let progress = failure.progress;
    if progress.response_started {
        return None;
    }
    let stale_reuse = progress.reused && !progress.request_sent;
    if is_idempotent(method) || stale_reuse {
        Some(reason)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(error: NetError, reused: bool, request_sent: bool, response_started: bool) -> AttemptError {
        AttemptError::new(error, Progress { connected: true, reused, request_sent, response_started })
    }

    #[test]
    fn test_idempotent_retry_once() {
        let config = RetryConfig::default();
        let f = failure(NetError::ConnectionReset, false, true, false);
        assert_eq!(should_retry(0, &Method::GET, &f, &config), Some(RetryReason::ConnectionReset));
        assert_eq!(should_retry(1, &Method::GET, &f, &config), None);
    }

    #[test]
    fn test_no_retry_after_response_bytes() {
        let config = RetryConfig::default();
        let f = failure(NetError::ConnectionClosed, true, true, true);
        assert_eq!(should_retry(0, &Method::GET, &f, &config), None);
    }

    #[test]
    fn test_post_only_retries_stale_reuse() {
        let config = RetryConfig::default();
        let sent = failure(NetError::EmptyResponse, true, true, false);
        assert_eq!(should_retry(0, &Method::POST, &sent, &config), None);
        let stale = failure(NetError::ConnectionReset, true, false, false);
        assert!(should_retry(0, &Method::POST, &stale, &config).is_some());
        let fresh = failure(NetError::ConnectionReset, false, false, false);
        assert_eq!(should_retry(0, &Method::POST, &fresh, &config), None);
    }

    #[test]
    fn test_non_retryable_errors() {
        let config = RetryConfig::default();
        let f = failure(NetError::InvalidHttpResponse, false, true, false);
        assert_eq!(should_retry(0, &Method::GET, &f, &config), None);
        let refused = failure(NetError::Http2ServerRefusedStream, false, true, false);
        assert!(should_retry(0, &Method::POST, &refused, &config).is_none());
        assert!(should_retry(0, &Method::PUT, &refused, &config).is_some());
    }

    #[test]
    fn test_disabled() {
        let f = failure(NetError::ConnectionReset, true, false, false);
        assert_eq!(should_retry(0, &Method::GET, &f, &RetryConfig::no_retry()), None);
    }
}
