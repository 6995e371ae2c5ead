//! HTTP/1.1 wire format: request heads, response heads, body framing and
//! the chunked transfer coding.

use crate::base::neterror::NetError;
use crate::http::headers::HttpHeaders;
use crate::http::request::RequestHead;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use std::fmt::Write;

/// Largest response head accepted.
pub(crate) const MAX_HEAD_SIZE: usize = 256 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestFraming {
    None,
    Length(u64),
    Chunked,
}

impl RequestFraming {
    /// Framing for a body of `length` (`None` when unknown). Explicit
    /// framing headers in `headers` win.
    pub fn choose(method: &Method, headers: &HeaderMap, body: Option<Option<u64>>) -> Self {
        if header_has_token(headers, &header::TRANSFER_ENCODING, "chunked") {
            return RequestFraming::Chunked;
        }
        if let Some(len) = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
        {
            return RequestFraming::Length(len);
        }
        match body {
            Some(Some(len)) => RequestFraming::Length(len),
            Some(None) => RequestFraming::Chunked,
            None if matches!(*method, Method::POST | Method::PUT | Method::PATCH) => {
                RequestFraming::Length(0)
            }
            None => RequestFraming::None,
        }
    }
}

/// Serialize a request head. `absolute_form` is used when talking to a plain
/// HTTP proxy.
pub(crate) fn encode_head(
    head: &RequestHead,
    framing: RequestFraming,
    absolute_form: bool,
    dst: &mut BytesMut,
) {
    let target = if absolute_form { head.absolute_form() } else { head.origin_form() };
    let _ = write!(dst, "{} {} HTTP/1.1\r\n", head.method, target);
    if !head.headers.contains_key(header::HOST) {
        let _ = write!(dst, "host: {}\r\n", head.authority());
    }
    for (name, value) in head.headers.iter() {
        put_header(dst, name, value);
    }
    match framing {
        RequestFraming::Length(len) if !head.headers.contains_key(header::CONTENT_LENGTH) => {
            let _ = write!(dst, "content-length: {len}\r\n");
        }
        RequestFraming::Chunked if !head.headers.contains_key(header::TRANSFER_ENCODING) => {
            dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        _ => {}
    }
    dst.extend_from_slice(b"\r\n");
}

fn put_header(dst: &mut BytesMut, name: &HeaderName, value: &HeaderValue) {
    dst.extend_from_slice(name.as_str().as_bytes());
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value.as_bytes());
    dst.extend_from_slice(b"\r\n");
}

/// Frame one chunk of a chunked request body.
pub(crate) fn encode_chunk(chunk: &[u8], dst: &mut BytesMut) {
    let _ = write!(dst, "{:x}\r\n", chunk.len());
    dst.extend_from_slice(chunk);
    dst.extend_from_slice(b"\r\n");
}

pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// A parsed status line and header block.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HttpHeaders,
}

impl ResponseHead {
    /// HTTP/1.1 unless `Connection: close`; HTTP/1.0 only with
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        if self.version == Version::HTTP_10 {
            self.headers.has_token("connection", "keep-alive")
        } else {
            !self.headers.has_token("connection", "close")
        }
    }
}

/// Parse a response head off the front of `buf`. `Ok(None)` means more
/// bytes are needed.
pub(crate) fn parse_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>, NetError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(NetError::ResponseHeadersTooBig);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(NetError::ResponseHeadersTooBig),
        Err(_) => return Err(NetError::InvalidHttpResponse),
    };
    if consumed > MAX_HEAD_SIZE {
        return Err(NetError::ResponseHeadersTooBig);
    }

    let status = response
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or(NetError::InvalidHttpResponse)?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name =
            HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| NetError::InvalidHttpResponse)?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| NetError::InvalidHttpResponse)?;
        headers.append(name, value);
    }
    buf.advance(consumed);
    Ok(Some(ResponseHead { status, version, headers: HttpHeaders::from_map(headers) }))
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Chunked,
    Length(u64),
    CloseDelimited,
}

pub(crate) fn response_framing(method: &Method, head: &ResponseHead) -> Result<BodyFraming, NetError> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }
    let codings = head.headers.all_values("transfer-encoding");
    if !codings.is_empty() {
        let last = codings.iter().flat_map(|v| v.split(',')).map(str::trim).last();
        return Ok(match last {
            Some(c) if c.eq_ignore_ascii_case("chunked") => BodyFraming::Chunked,
            _ => BodyFraming::CloseDelimited,
        });
    }
    let mut length: Option<u64> = None;
    for value in head.headers.all_values("content-length").iter().flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NetError::InvalidHttpResponse);
        }
        let parsed: u64 = value.parse().map_err(|_| NetError::InvalidHttpResponse)?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(NetError::ResponseHeadersMultipleContentLength)
            }
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(0) => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::CloseDelimited,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Result of one decoding step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    Data(Bytes),
    NeedMore,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`. Chunk extensions
/// are ignored and trailers consumed, up to [`MAX_HEAD_SIZE`] bytes of them.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
    trailer_bytes: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self { state: ChunkState::Size, trailer_bytes: 0 }
    }
}

impl ChunkedDecoder {
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, NetError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(size)
                        .ok()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .and_then(|s| u64::from_str_radix(s, 16).ok())
                        .ok_or(NetError::InvalidChunkedEncoding)?;
                    self.state = if size == 0 { ChunkState::Trailers } else { ChunkState::Data(size) };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let n = remaining.min(buf.len() as u64) as usize;
                    let chunk = buf.split_to(n).freeze();
                    let left = remaining - n as u64;
                    self.state = if left == 0 { ChunkState::DataEnd } else { ChunkState::Data(left) };
                    return Ok(Decoded::Data(chunk));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(NetError::InvalidChunkedEncoding);
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                        continue;
                    }
                    self.trailer_bytes += line.len() + 2;
                    if self.trailer_bytes > MAX_HEAD_SIZE {
                        return Err(NetError::ResponseHeadersTooBig);
                    }
                }
                ChunkState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// Next CRLF-terminated line, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(NetError::InvalidChunkedEncoding),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn head(raw: &str) -> ResponseHead {
        parse_head(&mut BytesMut::from(raw)).unwrap().unwrap()
    }

    #[test]
    fn test_encode_head_keeps_value_order() {
        let mut headers = HeaderMap::new();
        headers.append("x-bar", HeaderValue::from_static("foo1"));
        headers.append("accept", HeaderValue::from_static("*/*"));
        headers.append("x-bar", HeaderValue::from_static("foo2"));
        let head = RequestHead {
            method: Method::POST,
            url: Url::parse("http://example.com:8080/p?q=1").unwrap(),
            headers,
        };
        let mut out = BytesMut::new();
        encode_head(&head, RequestFraming::Length(3), false, &mut out);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("POST /p?q=1 HTTP/1.1\r\nhost: example.com:8080\r\n"));
        let foo1 = text.find("x-bar: foo1").unwrap();
        let foo2 = text.find("x-bar: foo2").unwrap();
        assert!(foo1 < foo2);
        assert!(text.ends_with("content-length: 3\r\n\r\n"));
    }

    #[test]
    fn test_request_framing() {
        let empty = HeaderMap::new();
        assert_eq!(RequestFraming::choose(&Method::GET, &empty, None), RequestFraming::None);
        assert_eq!(RequestFraming::choose(&Method::POST, &empty, None), RequestFraming::Length(0));
        assert_eq!(RequestFraming::choose(&Method::PUT, &empty, Some(None)), RequestFraming::Chunked);
        assert_eq!(
            RequestFraming::choose(&Method::PUT, &empty, Some(Some(7))),
            RequestFraming::Length(7)
        );
    }

    #[test]
    fn test_parse_head_partial_then_complete() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Le");
        assert!(parse_head(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ngth: 2\r\n\r\nhi");
        let parsed = parse_head(&mut buf).unwrap().unwrap();
        assert_eq!(parsed.status, StatusCode::OK);
        assert_eq!(&buf[..], b"hi");
    }

    #[test]
    fn test_bad_status_line() {
        let mut buf = BytesMut::from("HTTP/1.1 abc OK\r\n\r\n");
        assert!(matches!(parse_head(&mut buf), Err(NetError::InvalidHttpResponse)));
    }

    #[test]
    fn test_oversized_head() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nX-Big: ");
        buf.extend_from_slice(&vec![b'a'; MAX_HEAD_SIZE + 1]);
        assert!(matches!(parse_head(&mut buf), Err(NetError::ResponseHeadersTooBig)));
    }

    #[test]
    fn test_framing_rules() {
        let get = Method::GET;
        let no_content = head("HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(response_framing(&get, &no_content).unwrap(), BodyFraming::Empty);

        let ok = head("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(response_framing(&Method::HEAD, &ok).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing(&get, &ok).unwrap(), BodyFraming::Length(10));

        let chunked =
            head("HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 3\r\n\r\n");
        assert_eq!(response_framing(&get, &chunked).unwrap(), BodyFraming::Chunked);

        let agreeing = head("HTTP/1.1 200 OK\r\nContent-Length: 4\r\nContent-Length: 4\r\n\r\n");
        assert_eq!(response_framing(&get, &agreeing).unwrap(), BodyFraming::Length(4));

        let conflicting = head("HTTP/1.1 200 OK\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n");
        assert!(matches!(
            response_framing(&get, &conflicting),
            Err(NetError::ResponseHeadersMultipleContentLength)
        ));

        let close = head("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(response_framing(&get, &close).unwrap(), BodyFraming::CloseDelimited);
    }

    #[test]
    fn test_keep_alive() {
        assert!(head("HTTP/1.1 200 OK\r\n\r\n").is_keep_alive());
        assert!(!head("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").is_keep_alive());
        assert!(!head("HTTP/1.0 200 OK\r\n\r\n").is_keep_alive());
        assert!(head("HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\n\r\n").is_keep_alive());
    }

    #[test]
    fn test_chunked_decoding_across_reads() {
        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from("5;ext=1\r\nhel");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::Data(Bytes::from_static(b"hel")));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::NeedMore);
        buf.extend_from_slice(b"lo\r\n0\r\nX-Trailer: t\r\n\r\nrest");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::Data(Bytes::from_static(b"lo")));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::Done);
        assert!(decoder.is_done());
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn test_trailer_section_is_bounded() {
        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from("0\r\n");
        let line = format!("X-Pad: {}\r\n", "p".repeat(1000));
        let mut result = Ok(Decoded::NeedMore);
        for _ in 0..(MAX_HEAD_SIZE / line.len() + 2) {
            buf.extend_from_slice(line.as_bytes());
            result = decoder.decode(&mut buf);
            if result.is_err() {
                break;
            }
            assert!(matches!(result, Ok(Decoded::NeedMore)));
        }
        assert!(matches!(result, Err(NetError::ResponseHeadersTooBig)));
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_too_many_headers() {
        let mut raw = String::from("HTTP/1.1 200 OK\r\n");
        for i in 0..=MAX_HEADERS {
            raw.push_str(&format!("X-H{i}: v\r\n"));
        }
        raw.push_str("\r\n");
        let mut buf = BytesMut::from(raw.as_str());
        assert!(matches!(parse_head(&mut buf), Err(NetError::ResponseHeadersTooBig)));
    }

    #[test]
    fn test_bad_chunk_size() {
        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from("zz\r\n");
        assert!(matches!(decoder.decode(&mut buf), Err(NetError::InvalidChunkedEncoding)));

        let mut decoder = ChunkedDecoder::default();
        let mut buf = BytesMut::from("2\r\nabXX");
        assert!(matches!(decoder.decode(&mut buf), Ok(Decoded::Data(_))));
        assert!(matches!(decoder.decode(&mut buf), Err(NetError::InvalidChunkedEncoding)));
    }
}
