use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Coarse grouping of [`NetError`] values.
///
/// Callers use this to tell "host unreachable" from "handshake problem" and
/// "timed out" from "interrupted" without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// TCP connect, DNS, tunnel and proxy establishment failures.
    Connect,
    /// TLS handshake, certificate and ALPN failures.
    Tls,
    /// Connect, read or request deadline expired.
    Timeout,
    /// The call was cancelled by its caller.
    Interrupted,
    /// Rejected before anything was sent: bad URL, method, header, argument.
    Validation,
    /// The peer violated HTTP/1.1 framing or HTTP/2 connection rules.
    Protocol,
    /// A single HTTP/2 stream failed; the connection survives.
    Stream,
    Redirect,
    Auth,
    /// Request or response body production/consumption failed.
    Body,
    /// Transport I/O failure after the connection was established.
    Io,
}

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Generic
    #[error("I/O error: {source}")]
    Io {
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Operation interrupted")]
    Interrupted,
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },
    #[error("Request timed out")]
    TimedOut,
    #[error("Response body exceeds {limit} bytes")]
    ResponseBodyTooLarge { limit: u64 },
    #[error("Body subscription cancelled")]
    Cancelled,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name not resolved: {domain}: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Proxy auth requested")]
    ProxyAuthRequested { challenges: Vec<String> },
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("Preconnect max socket limit")]
    PreconnectMaxSocketLimit,
    #[error("Socket closed by remote")]
    SocketRemoteClosed,
    #[error("Data received unexpectedly on idle socket")]
    DataReceivedUnexpectedly,

    // TLS Errors
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("SSL handshake with {host} failed: {reason}")]
    SslHandshakeFailed { host: String, reason: String },
    #[error("SSL version or cipher mismatch")]
    SslVersionOrCipherMismatch,
    #[error("ALPN negotiation failed")]
    AlpnNegotiationFailed,
    #[error("Certificate invalid: {reason}")]
    CertificateInvalid { reason: String },

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid method: {method:?}")]
    InvalidMethod { method: String },
    #[error("Invalid header: {name:?}")]
    InvalidHeader { name: String },
    #[error("Restricted header name: {name:?}")]
    RestrictedHeader { name: String },
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Unsafe redirect")]
    UnsafeRedirect,
    #[error("Redirect cycle detected")]
    RedirectCycleDetected,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Unexpected proxy auth")]
    UnexpectedProxyAuth,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Content decoding failed")]
    ContentDecodingFailed,
    #[error("Invalid auth credentials")]
    InvalidAuthCredentials,
    #[error("Unsupported auth scheme")]
    UnsupportedAuthScheme,
    #[error("Missing auth credentials")]
    MissingAuthCredentials,
    #[error("Response headers multiple Content-Length")]
    ResponseHeadersMultipleContentLength,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("Response headers truncated")]
    ResponseHeadersTruncated,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,

    // HTTP/2 Errors
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,
    #[error("HTTP/2 server refused stream")]
    Http2ServerRefusedStream,
    #[error("HTTP/2 flow control error")]
    Http2FlowControlError,
    #[error("HTTP/2 frame size error")]
    Http2FrameSizeError,
    #[error("HTTP/2 compression error")]
    Http2CompressionError,
    #[error("HTTP/2 stream {stream_id} reset with error code {code:#x}")]
    Http2StreamReset { stream_id: u32, code: u32 },
    #[error("HTTP/2 GOAWAY received (last stream {last_stream_id}, error code {code:#x})")]
    Http2GoAway { last_stream_id: u32, code: u32 },
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Io { .. } => -2,
            NetError::Interrupted => -3,
            NetError::InvalidArgument { .. } => -4,
            NetError::FileNotFound { .. } => -6,
            NetError::TimedOut => -7,
            NetError::ResponseBodyTooLarge { .. } => -8,
            NetError::Cancelled => -20,
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::SslProtocolError | NetError::SslHandshakeFailed { .. } => -107,
            NetError::AddressUnreachable => -109,
            NetError::TunnelConnectionFailed => -111,
            NetError::SocketNotConnected => -112,
            NetError::SslVersionOrCipherMismatch => -113,
            NetError::ConnectionTimedOut => -118,
            NetError::AlpnNegotiationFailed => -122,
            NetError::ProxyAuthRequested { .. } => -127,
            NetError::ProxyConnectionFailed => -130,
            NetError::PreconnectMaxSocketLimit => -133,
            NetError::CertificateInvalid { .. } => -207,
            NetError::InvalidUrl => -300,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::UnsafeRedirect => -311,
            NetError::InvalidResponse => -320,
            NetError::InvalidChunkedEncoding => -321,
            NetError::InvalidMethod { .. } => -322,
            NetError::UnexpectedProxyAuth => -323,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ContentDecodingFailed => -330,
            NetError::Http2ProtocolError => -337,
            NetError::InvalidAuthCredentials => -338,
            NetError::UnsupportedAuthScheme => -339,
            NetError::MissingAuthCredentials => -341,
            NetError::ResponseHeadersMultipleContentLength => -346,
            NetError::Http2ServerRefusedStream => -351,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::ResponseHeadersTruncated => -357,
            NetError::Http2FlowControlError => -361,
            NetError::Http2FrameSizeError => -362,
            NetError::Http2CompressionError => -363,
            NetError::InvalidHttpResponse => -370,
            NetError::Http2StreamReset { .. } => -376,
            // Codes below -10000 have no Chromium counterpart.
            NetError::RedirectCycleDetected => -10000,
            NetError::InvalidHeader { .. } => -10001,
            NetError::RestrictedHeader { .. } => -10002,
            NetError::Http2GoAway { .. } => -10003,
            NetError::SocketRemoteClosed => -10004,
            NetError::DataReceivedUnexpectedly => -10005,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        use ErrorCategory::*;
        match self {
            NetError::Io { .. }
            | NetError::ConnectionClosed
            | NetError::ConnectionReset
            | NetError::ConnectionAborted
            | NetError::SocketNotConnected
            | NetError::SocketRemoteClosed
            | NetError::DataReceivedUnexpectedly
            | NetError::EmptyResponse => Io,
            NetError::Interrupted => Interrupted,
            NetError::TimedOut | NetError::ConnectionTimedOut => Timeout,
            NetError::InvalidArgument { .. }
            | NetError::InvalidUrl
            | NetError::UnknownUrlScheme
            | NetError::InvalidMethod { .. }
            | NetError::InvalidHeader { .. }
            | NetError::RestrictedHeader { .. } => Validation,
            NetError::FileNotFound { .. }
            | NetError::ResponseBodyTooLarge { .. }
            | NetError::Cancelled
            | NetError::ContentDecodingFailed => Body,
            NetError::ConnectionRefused
            | NetError::ConnectionFailed
            | NetError::ConnectionFailedTo { .. }
            | NetError::NameNotResolved
            | NetError::NameNotResolvedFor { .. }
            | NetError::AddressUnreachable
            | NetError::TunnelConnectionFailed
            | NetError::ProxyConnectionFailed
            | NetError::PreconnectMaxSocketLimit => Connect,
            NetError::SslProtocolError
            | NetError::SslHandshakeFailed { .. }
            | NetError::SslVersionOrCipherMismatch
            | NetError::AlpnNegotiationFailed
            | NetError::CertificateInvalid { .. } => Tls,
            NetError::InvalidRedirect
            | NetError::TooManyRedirects
            | NetError::UnsafeRedirect
            | NetError::RedirectCycleDetected => Redirect,
            NetError::ProxyAuthRequested { .. }
            | NetError::UnexpectedProxyAuth
            | NetError::InvalidAuthCredentials
            | NetError::UnsupportedAuthScheme
            | NetError::MissingAuthCredentials => Auth,
            NetError::InvalidResponse
            | NetError::InvalidChunkedEncoding
            | NetError::ResponseHeadersTooBig
            | NetError::ResponseHeadersMultipleContentLength
            | NetError::ContentLengthMismatch
            | NetError::IncompleteChunkedEncoding
            | NetError::ResponseHeadersTruncated
            | NetError::InvalidHttpResponse
            | NetError::Http2ProtocolError
            | NetError::Http2FlowControlError
            | NetError::Http2FrameSizeError
            | NetError::Http2CompressionError
            | NetError::Http2GoAway { .. } => Protocol,
            NetError::Http2StreamReset { .. } | NetError::Http2ServerRefusedStream => Stream,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.category() == ErrorCategory::Connect
    }

    pub fn is_tls(&self) -> bool {
        self.category() == ErrorCategory::Tls
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    pub fn is_interrupted(&self) -> bool {
        self.category() == ErrorCategory::Interrupted
    }

    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// True for failures confined to one HTTP/2 stream.
    pub fn is_stream_error(&self) -> bool {
        self.category() == ErrorCategory::Stream
    }

    /// True for failures that take the whole connection down with them.
    pub fn is_connection_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Protocol | ErrorCategory::Io)
    }

    pub fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            _ => NetError::ConnectionFailedTo {
                host: host.to_string(),
                port,
                source: Arc::new(source),
            },
        }
    }

    pub fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor { domain: domain.to_string(), source: Arc::new(source) }
    }

    /// Maps an I/O error on an established connection.
    pub fn from_io(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
                NetError::ConnectionClosed
            }
            io::ErrorKind::NotConnected => NetError::SocketNotConnected,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            _ => NetError::Io { source: Arc::new(source) },
        }
    }
}

impl From<io::Error> for NetError {
    fn from(source: io::Error) -> Self {
        NetError::from_io(source)
    }
}
