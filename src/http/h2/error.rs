use crate::base::neterror::NetError;
use thiserror::Error;

/// RST_STREAM / GOAWAY error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes are treated as `INTERNAL_ERROR`.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Failures of the framing layer.
///
/// Everything except [`H2Error::Stream`] is a connection error: the session
/// sends GOAWAY with [`code`](H2Error::code) and fails every open stream.
#[derive(Debug, Clone, Error)]
pub enum H2Error {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("frame size error")]
    FrameSize,
    #[error("HPACK compression error")]
    Compression,
    #[error("flow control error")]
    FlowControl,
    #[error("stream {stream_id} error: {code:?}")]
    Stream { stream_id: u32, code: ErrorCode },
}

impl H2Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            H2Error::Protocol(_) => ErrorCode::ProtocolError,
            H2Error::FrameSize => ErrorCode::FrameSizeError,
            H2Error::Compression => ErrorCode::CompressionError,
            H2Error::FlowControl => ErrorCode::FlowControlError,
            H2Error::Stream { code, .. } => *code,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        !matches!(self, H2Error::Stream { .. })
    }
}

impl From<H2Error> for NetError {
    fn from(err: H2Error) -> Self {
        match err {
            H2Error::Protocol(_) => NetError::Http2ProtocolError,
            H2Error::FrameSize => NetError::Http2FrameSizeError,
            H2Error::Compression => NetError::Http2CompressionError,
            H2Error::FlowControl => NetError::Http2FlowControlError,
            H2Error::Stream { stream_id, code } => stream_reset_error(stream_id, code),
        }
    }
}

/// The error a stream fails with after the peer reset it.
pub(crate) fn stream_reset_error(stream_id: u32, code: ErrorCode) -> NetError {
    match code {
        ErrorCode::RefusedStream => NetError::Http2ServerRefusedStream,
        code => NetError::Http2StreamReset { stream_id, code: code.as_u32() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_code_is_internal() {
        assert_eq!(ErrorCode::from_u32(0x2), ErrorCode::InternalError);
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
        assert_eq!(ErrorCode::from_u32(0x7), ErrorCode::RefusedStream);
    }

    #[test]
    fn test_refused_stream_maps_to_retryable_error() {
        let err: NetError = H2Error::Stream { stream_id: 5, code: ErrorCode::RefusedStream }.into();
        assert!(matches!(err, NetError::Http2ServerRefusedStream));
        let err: NetError = H2Error::Stream { stream_id: 5, code: ErrorCode::Cancel }.into();
        assert!(matches!(err, NetError::Http2StreamReset { stream_id: 5, code: 0x8 }));
        assert!(err.is_stream_error());
    }

    #[test]
    fn test_connection_errors_keep_their_category() {
        let err: NetError = H2Error::Compression.into();
        assert!(err.is_connection_error());
        assert_eq!(H2Error::Compression.code(), ErrorCode::CompressionError);
    }
}
