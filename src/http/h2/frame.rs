//! Frame codec.
//!
//! Every frame starts with a 9-byte header: 24-bit payload length, 8-bit
//! type, 8-bit flags, 1 reserved bit and a 31-bit stream id. Decoding splits
//! complete frames off the front of a read buffer without copying payloads.

use super::error::{ErrorCode, H2Error};
use super::settings::Settings;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 9;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const PRIORITY: u8 = 0x2;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PUSH_PROMISE: u8 = 0x5;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// Client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// Length counted against flow control, padding included.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    /// Priority information is parsed for validity and otherwise ignored.
    Priority { stream_id: u32 },
    RstStream { stream_id: u32, code: ErrorCode },
    Settings { ack: bool, payload: Bytes },
    PushPromise { stream_id: u32, promised_id: u32, block: Bytes, end_headers: bool },
    Ping { ack: bool, data: [u8; 8] },
    GoAway { last_stream_id: u32, code: ErrorCode, debug: Bytes },
    WindowUpdate { stream_id: u32, increment: u32 },
    Continuation { stream_id: u32, block: Bytes, end_headers: bool },
    /// Unknown types are skipped.
    Unknown { kind: u8, stream_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut b = &buf[..HEADER_LEN];
        let length = (u32::from(b.get_u16()) << 8) | u32::from(b.get_u8());
        let kind = b.get_u8();
        let flags = b.get_u8();
        let stream_id = b.get_u32() & 0x7fff_ffff;
        Some(Self { length, kind, flags, stream_id })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u16(self.length as u16);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

fn put_header(dst: &mut BytesMut, length: usize, kind: u8, flags: u8, stream_id: u32) {
    FrameHeader { length: length as u32, kind, flags, stream_id }.encode(dst);
}

fn flag(set: bool, bit: u8) -> u8 {
    if set {
        bit
    } else {
        0
    }
}

impl Frame {
    pub fn settings(settings: &Settings) -> Self {
        let mut payload = BytesMut::with_capacity(settings.encoded_len());
        settings.encode(&mut payload);
        Frame::Settings { ack: false, payload: payload.freeze() }
    }

    pub fn settings_ack() -> Self {
        Frame::Settings { ack: true, payload: Bytes::new() }
    }

    pub fn data(stream_id: u32, payload: Bytes, end_stream: bool) -> Self {
        let flow_len = payload.len() as u32;
        Frame::Data { stream_id, payload, end_stream, flow_len }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Data { stream_id, payload, end_stream, .. } => {
                put_header(dst, payload.len(), DATA, flag(*end_stream, FLAG_END_STREAM), *stream_id);
                dst.extend_from_slice(payload);
            }
            Frame::Headers { stream_id, block, end_stream, end_headers } => {
                let flags =
                    flag(*end_stream, FLAG_END_STREAM) | flag(*end_headers, FLAG_END_HEADERS);
                put_header(dst, block.len(), HEADERS, flags, *stream_id);
                dst.extend_from_slice(block);
            }
            Frame::Priority { stream_id } => {
                put_header(dst, 5, PRIORITY, 0, *stream_id);
                dst.put_u32(0);
                dst.put_u8(15);
            }
            Frame::RstStream { stream_id, code } => {
                put_header(dst, 4, RST_STREAM, 0, *stream_id);
                dst.put_u32(code.as_u32());
            }
            Frame::Settings { ack, payload } => {
                put_header(dst, payload.len(), SETTINGS, flag(*ack, FLAG_ACK), 0);
                dst.extend_from_slice(payload);
            }
            Frame::PushPromise { stream_id, promised_id, block, end_headers } => {
                let flags = flag(*end_headers, FLAG_END_HEADERS);
                put_header(dst, 4 + block.len(), PUSH_PROMISE, flags, *stream_id);
                dst.put_u32(*promised_id & 0x7fff_ffff);
                dst.extend_from_slice(block);
            }
            Frame::Ping { ack, data } => {
                put_header(dst, 8, PING, flag(*ack, FLAG_ACK), 0);
                dst.extend_from_slice(data);
            }
            Frame::GoAway { last_stream_id, code, debug } => {
                put_header(dst, 8 + debug.len(), GOAWAY, 0, 0);
                dst.put_u32(*last_stream_id & 0x7fff_ffff);
                dst.put_u32(code.as_u32());
                dst.extend_from_slice(debug);
            }
            Frame::WindowUpdate { stream_id, increment } => {
                put_header(dst, 4, WINDOW_UPDATE, 0, *stream_id);
                dst.put_u32(*increment & 0x7fff_ffff);
            }
            Frame::Continuation { stream_id, block, end_headers } => {
                put_header(
                    dst,
                    block.len(),
                    CONTINUATION,
                    flag(*end_headers, FLAG_END_HEADERS),
                    *stream_id,
                );
                dst.extend_from_slice(block);
            }
            Frame::Unknown { kind, stream_id } => put_header(dst, 0, *kind, 0, *stream_id),
        }
    }
}

/// Split one complete frame off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; `buf` is left untouched.
pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, H2Error> {
    let Some(header) = FrameHeader::parse(buf) else {
        return Ok(None);
    };
    if header.length > max_frame_size {
        return Err(H2Error::FrameSize);
    }
    let total = HEADER_LEN + header.length as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let mut frame = buf.split_to(total);
    frame.advance(HEADER_LEN);
    parse_payload(header, frame.freeze()).map(Some)
}

fn require_stream(stream_id: u32, what: &'static str) -> Result<(), H2Error> {
    if stream_id == 0 {
        return Err(H2Error::Protocol(what));
    }
    Ok(())
}

fn require_connection(stream_id: u32, what: &'static str) -> Result<(), H2Error> {
    if stream_id != 0 {
        return Err(H2Error::Protocol(what));
    }
    Ok(())
}

fn parse_payload(header: FrameHeader, mut payload: Bytes) -> Result<Frame, H2Error> {
    let FrameHeader { length, kind, flags, stream_id } = header;
    let frame = match kind {
        DATA => {
            require_stream(stream_id, "DATA on stream 0")?;
            let payload = strip_padding(payload, flags)?;
            Frame::Data {
                stream_id,
                payload,
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_len: length,
            }
        }
        HEADERS => {
            require_stream(stream_id, "HEADERS on stream 0")?;
            let mut block = strip_padding(payload, flags)?;
            if flags & FLAG_PRIORITY != 0 {
                if block.len() < 5 {
                    return Err(H2Error::FrameSize);
                }
                block.advance(5);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        PRIORITY => {
            require_stream(stream_id, "PRIORITY on stream 0")?;
            if payload.len() != 5 {
                return Err(H2Error::FrameSize);
            }
            Frame::Priority { stream_id }
        }
        RST_STREAM => {
            require_stream(stream_id, "RST_STREAM on stream 0")?;
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            Frame::RstStream { stream_id, code: ErrorCode::from_u32(payload.get_u32()) }
        }
        SETTINGS => {
            require_connection(stream_id, "SETTINGS on a stream")?;
            let ack = flags & FLAG_ACK != 0;
            if (ack && !payload.is_empty()) || payload.len() % 6 != 0 {
                return Err(H2Error::FrameSize);
            }
            Frame::Settings { ack, payload }
        }
        PUSH_PROMISE => {
            require_stream(stream_id, "PUSH_PROMISE on stream 0")?;
            let mut block = strip_padding(payload, flags)?;
            if block.len() < 4 {
                return Err(H2Error::FrameSize);
            }
            let promised_id = block.get_u32() & 0x7fff_ffff;
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        PING => {
            require_connection(stream_id, "PING on a stream")?;
            if payload.len() != 8 {
                return Err(H2Error::FrameSize);
            }
            let mut data = [0u8; 8];
            payload.copy_to_slice(&mut data);
            Frame::Ping { ack: flags & FLAG_ACK != 0, data }
        }
        GOAWAY => {
            require_connection(stream_id, "GOAWAY on a stream")?;
            if payload.len() < 8 {
                return Err(H2Error::FrameSize);
            }
            let last_stream_id = payload.get_u32() & 0x7fff_ffff;
            let code = ErrorCode::from_u32(payload.get_u32());
            Frame::GoAway { last_stream_id, code, debug: payload }
        }
        WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::FrameSize);
            }
            let increment = payload.get_u32() & 0x7fff_ffff;
            if increment == 0 {
                if stream_id == 0 {
                    return Err(H2Error::Protocol("WINDOW_UPDATE with zero increment"));
                }
                return Err(H2Error::Stream { stream_id, code: ErrorCode::ProtocolError });
            }
            Frame::WindowUpdate { stream_id, increment }
        }
        CONTINUATION => {
            require_stream(stream_id, "CONTINUATION on stream 0")?;
            Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        kind => Frame::Unknown { kind, stream_id },
    };
    Ok(frame)
}

fn strip_padding(mut payload: Bytes, flags: u8) -> Result<Bytes, H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::FrameSize);
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(H2Error::Protocol("padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encoded(&Frame::data(1, Bytes::from_static(b"hello"), true));
        assert_eq!(&buf[..9], &[0, 0, 5, DATA, FLAG_END_STREAM, 0, 0, 0, 1]);
        let header = FrameHeader::parse(&buf).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.stream_id, 1);
    }

    #[test]
    fn test_decode_consumes_exactly_one_frame() {
        let mut buf = encoded(&Frame::data(1, Bytes::from_static(b"abc"), false));
        buf.extend_from_slice(&encoded(&Frame::Ping { ack: false, data: [7; 8] }));
        let first = decode(&mut buf, 16_384).unwrap().unwrap();
        assert_eq!(first, Frame::data(1, Bytes::from_static(b"abc"), false));
        let second = decode(&mut buf, 16_384).unwrap().unwrap();
        assert_eq!(second, Frame::Ping { ack: false, data: [7; 8] });
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_frame_waits() {
        let full = encoded(&Frame::GoAway {
            last_stream_id: 3,
            code: ErrorCode::NoError,
            debug: Bytes::from_static(b"bye"),
        });
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(decode(&mut partial, 16_384).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 1);
    }

    #[test]
    fn test_padded_data_counts_padding_for_flow_control() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 1 + 2 + 3, DATA, FLAG_PADDED, 5);
        buf.put_u8(3);
        buf.extend_from_slice(b"hi");
        buf.extend_from_slice(&[0, 0, 0]);
        match decode(&mut buf, 16_384).unwrap().unwrap() {
            Frame::Data { payload, flow_len, .. } => {
                assert_eq!(&payload[..], b"hi");
                assert_eq!(flow_len, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_headers_priority_fields_skipped() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 5 + 2, HEADERS, FLAG_PRIORITY | FLAG_END_HEADERS, 3);
        buf.put_u32(0x8000_0001);
        buf.put_u8(200);
        buf.extend_from_slice(&[0x82, 0x84]);
        match decode(&mut buf, 16_384).unwrap().unwrap() {
            Frame::Headers { block, end_headers, .. } => {
                assert_eq!(&block[..], &[0x82, 0x84]);
                assert!(end_headers);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = encoded(&Frame::data(1, Bytes::from(vec![0u8; 20_000]), false));
        assert!(matches!(decode(&mut buf, 16_384), Err(H2Error::FrameSize)));
    }

    #[test]
    fn test_stream_zero_rules() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 0, DATA, 0, 0);
        assert!(matches!(decode(&mut buf, 16_384), Err(H2Error::Protocol(_))));

        let mut buf = BytesMut::new();
        put_header(&mut buf, 8, PING, 0, 1);
        buf.put_u64(0);
        assert!(matches!(decode(&mut buf, 16_384), Err(H2Error::Protocol(_))));
    }

    #[test]
    fn test_zero_window_increment() {
        let mut buf = encoded(&Frame::WindowUpdate { stream_id: 3, increment: 0 });
        assert!(matches!(decode(&mut buf, 16_384), Err(H2Error::Stream { stream_id: 3, .. })));
        let mut buf = encoded(&Frame::WindowUpdate { stream_id: 0, increment: 0 });
        assert!(matches!(decode(&mut buf, 16_384), Err(H2Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_frame_skipped() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 3, 0xee, 0, 1);
        buf.extend_from_slice(b"xyz");
        assert_eq!(
            decode(&mut buf, 16_384).unwrap().unwrap(),
            Frame::Unknown { kind: 0xee, stream_id: 1 }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_settings_ack_must_be_empty() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 6, SETTINGS, FLAG_ACK, 0);
        buf.extend_from_slice(&[0; 6]);
        assert!(matches!(decode(&mut buf, 16_384), Err(H2Error::FrameSize)));
    }
}
