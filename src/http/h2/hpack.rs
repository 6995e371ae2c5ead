//! HPACK header compression.
//!
//! One [`Encoder`] per connection compresses request header blocks, one
//! [`Decoder`] decompresses response blocks. Each owns a dynamic table that
//! evicts oldest entries first once the size budget is exceeded.

use super::error::H2Error;
use super::huffman;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Per-entry overhead counted against the table size.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Header names whose values never enter a dynamic table.
const SENSITIVE: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    /// Name and value found at this index.
    Full(usize),
    /// Only the name found at this index.
    Name(usize),
}

#[derive(Debug)]
struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self { entries: VecDeque::new(), size: 0, max_size }
    }

    /// `index` is the full HPACK index (static entries come first).
    fn get(&self, index: usize) -> Option<HeaderField> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Some(HeaderField::new(name, value));
        }
        self.entries.get(index - STATIC_TABLE.len() - 1).cloned()
    }

    fn insert(&mut self, field: HeaderField) {
        let size = field.size();
        self.evict_to(self.max_size.saturating_sub(size));
        // an entry larger than the table empties it and is not added
        if size <= self.max_size {
            self.size += size;
            self.entries.push_front(field);
        }
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, budget: usize) {
        while self.size > budget {
            match self.entries.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }

    fn find(&self, name: &[u8], value: &[u8]) -> Option<Match> {
        let mut name_hit = None;
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if n.as_bytes() == name {
                if v.as_bytes() == value {
                    return Some(Match::Full(i + 1));
                }
                name_hit.get_or_insert(i + 1);
            }
        }
        for (i, field) in self.entries.iter().enumerate() {
            if field.name == name {
                let index = STATIC_TABLE.len() + 1 + i;
                if field.value == value {
                    return Some(Match::Full(index));
                }
                name_hit.get_or_insert(index);
            }
        }
        name_hit.map(Match::Name)
    }
}

pub(crate) fn encode_int(dst: &mut BytesMut, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

/// Returns the value and the number of bytes it occupied.
pub(crate) fn decode_int(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), H2Error> {
    let first = *buf.first().ok_or(H2Error::Compression)?;
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        if shift > 28 {
            return Err(H2Error::Compression);
        }
        value += usize::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
    }
    Err(H2Error::Compression)
}

fn encode_string(dst: &mut BytesMut, data: &[u8]) {
    let packed = huffman::encoded_len(data);
    if packed < data.len() {
        encode_int(dst, packed, 7, 0x80);
        huffman::encode(data, dst);
    } else {
        encode_int(dst, data.len(), 7, 0);
        dst.extend_from_slice(data);
    }
}

fn decode_string(buf: &[u8]) -> Result<(Bytes, usize), H2Error> {
    let huffman_coded = buf.first().is_some_and(|b| b & 0x80 != 0);
    let (len, n) = decode_int(buf, 7)?;
    let end = n.checked_add(len).ok_or(H2Error::Compression)?;
    let raw = buf.get(n..end).ok_or(H2Error::Compression)?;
    let value = if huffman_coded {
        Bytes::from(huffman::decode(raw)?)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((value, end))
}

pub struct Encoder {
    table: DynamicTable,
    pending_resize: Option<usize>,
}

impl Encoder {
    pub fn new(max_table_size: usize) -> Self {
        Self { table: DynamicTable::new(max_table_size), pending_resize: None }
    }

    /// The peer changed SETTINGS_HEADER_TABLE_SIZE. The size update is
    /// emitted at the start of the next header block.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size != self.table.max_size {
            self.table.resize(size);
            self.pending_resize = Some(size);
        }
    }

    pub fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        if let Some(size) = self.pending_resize.take() {
            encode_int(dst, size, 5, 0x20);
        }
        for (name, value) in fields {
            self.encode_field(name, value, dst);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut BytesMut) {
        let sensitive = SENSITIVE.iter().any(|s| s.as_bytes() == name);
        let found = self.table.find(name, value);

        if sensitive {
            // literal never indexed
            match found {
                Some(Match::Full(index)) | Some(Match::Name(index)) => {
                    encode_int(dst, index, 4, 0x10)
                }
                None => {
                    dst.put_u8(0x10);
                    encode_string(dst, name);
                }
            }
            encode_string(dst, value);
            return;
        }

        match found {
            Some(Match::Full(index)) => encode_int(dst, index, 7, 0x80),
            Some(Match::Name(index)) => {
                encode_int(dst, index, 6, 0x40);
                encode_string(dst, value);
                self.table.insert(HeaderField::new(
                    Bytes::copy_from_slice(name),
                    Bytes::copy_from_slice(value),
                ));
            }
            None => {
                dst.put_u8(0x40);
                encode_string(dst, name);
                encode_string(dst, value);
                self.table.insert(HeaderField::new(
                    Bytes::copy_from_slice(name),
                    Bytes::copy_from_slice(value),
                ));
            }
        }
    }
}

pub struct Decoder {
    table: DynamicTable,
    /// Upper bound for size updates, from our own SETTINGS.
    max_allowed: usize,
    max_list_size: usize,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            max_allowed: max_table_size,
            max_list_size: usize::MAX,
        }
    }

    /// Fail blocks whose decoded size (as counted for SETTINGS_MAX_HEADER_LIST_SIZE)
    /// exceeds `max`.
    pub fn with_max_header_list_size(mut self, max: usize) -> Self {
        self.max_list_size = max;
        self
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, H2Error> {
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0;
        while pos < block.len() {
            let rest = &block[pos..];
            let first = rest[0];
            let (field, used) = if first & 0x80 != 0 {
                let (index, n) = decode_int(rest, 7)?;
                (self.table.get(index).ok_or(H2Error::Compression)?, n)
            } else if first & 0x40 != 0 {
                let (field, n) = self.literal(rest, 6)?;
                self.table.insert(field.clone());
                (field, n)
            } else if first & 0x20 != 0 {
                // size updates are only valid before the first field
                if !fields.is_empty() {
                    return Err(H2Error::Compression);
                }
                let (size, n) = decode_int(rest, 5)?;
                if size > self.max_allowed {
                    return Err(H2Error::Compression);
                }
                self.table.resize(size);
                pos += n;
                continue;
            } else {
                // without indexing (0000) and never indexed (0001)
                self.literal(rest, 4)?
            };
            list_size += field.size();
            if list_size > self.max_list_size {
                return Err(H2Error::Compression);
            }
            fields.push(field);
            pos += used;
        }
        Ok(fields)
    }

    fn literal(&self, buf: &[u8], prefix_bits: u8) -> Result<(HeaderField, usize), H2Error> {
        let (index, mut pos) = decode_int(buf, prefix_bits)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&buf[pos..])?;
            pos += n;
            name
        } else {
            self.table.get(index).ok_or(H2Error::Compression)?.name
        };
        let (value, n) = decode_string(&buf[pos..])?;
        Ok((HeaderField { name, value }, pos + n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&'static str, &'static str)]) -> Vec<HeaderField> {
        pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
    }

    fn encode_pairs(encoder: &mut Encoder, pairs: &[(&str, &str)]) -> BytesMut {
        let mut buf = BytesMut::new();
        encoder.encode(pairs.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut buf);
        buf
    }

    #[test]
    fn test_integer_examples() {
        // RFC 7541 C.1
        let mut buf = BytesMut::new();
        encode_int(&mut buf, 10, 5, 0);
        assert_eq!(&buf[..], &[0x0a]);
        let mut buf = BytesMut::new();
        encode_int(&mut buf, 1337, 5, 0);
        assert_eq!(&buf[..], &[0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_int(&buf, 5).unwrap(), (1337, 3));
    }

    #[test]
    fn test_truncated_integer() {
        assert!(decode_int(&[0x1f, 0x9a], 5).is_err());
        assert!(decode_int(&[], 5).is_err());
    }

    #[test]
    fn test_decode_rfc_request_sequence() {
        // RFC 7541 C.3: three requests without Huffman coding
        let mut decoder = Decoder::new(4096);
        let first = [
            0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', b'.', b'c', b'o', b'm',
        ];
        assert_eq!(
            decoder.decode(&first).unwrap(),
            fields(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );
        let second =
            [0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, b'n', b'o', b'-', b'c', b'a', b'c', b'h', b'e'];
        assert_eq!(
            decoder.decode(&second).unwrap(),
            fields(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
                ("cache-control", "no-cache"),
            ])
        );
    }

    #[test]
    fn test_roundtrip_reuses_dynamic_entries() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096);
        let pairs = [(":method", "GET"), (":path", "/items"), ("x-request-id", "abc123")];
        let first = encode_pairs(&mut encoder, &pairs);
        let second = encode_pairs(&mut encoder, &pairs);
        assert!(second.len() < first.len());
        assert_eq!(decoder.decode(&first).unwrap(), fields(&pairs));
        assert_eq!(decoder.decode(&second).unwrap(), fields(&pairs));
    }

    #[test]
    fn test_sensitive_headers_never_indexed() {
        let mut encoder = Encoder::new(4096);
        let buf = encode_pairs(&mut encoder, &[("authorization", "Basic dXNlcjpwYXNz")]);
        // 0001xxxx with the static name index 23
        assert_eq!(buf[0], 0x1f);
        assert!(encoder.table.entries.is_empty());
        let mut decoder = Decoder::new(4096);
        assert_eq!(
            decoder.decode(&buf).unwrap(),
            fields(&[("authorization", "Basic dXNlcjpwYXNz")])
        );
        assert!(decoder.table.entries.is_empty());
    }

    #[test]
    fn test_eviction_keeps_size_within_budget() {
        let mut encoder = Encoder::new(100);
        let mut decoder = Decoder::new(100);
        for i in 0..10 {
            let value = format!("value-{i}");
            let buf = encode_pairs(&mut encoder, &[("x-long-header", value.as_str())]);
            let decoded = decoder.decode(&buf).unwrap();
            assert_eq!(&decoded[0].value[..], value.as_bytes());
            assert!(encoder.table.size <= 100);
            assert_eq!(encoder.table.size, decoder.table.size);
        }
    }

    #[test]
    fn test_size_update_emitted_first() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_table_size(256);
        let buf = encode_pairs(&mut encoder, &[(":method", "GET")]);
        assert_eq!(buf[0] & 0xe0, 0x20);
        let mut decoder = Decoder::new(4096);
        assert_eq!(decoder.decode(&buf).unwrap(), fields(&[(":method", "GET")]));
        assert_eq!(decoder.table.max_size, 256);
    }

    #[test]
    fn test_size_update_after_field_rejected() {
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&[0x82, 0x3f, 0xe1, 0x1f]).is_err());
    }

    #[test]
    fn test_size_update_beyond_setting_rejected() {
        let mut decoder = Decoder::new(4096);
        let mut buf = BytesMut::new();
        encode_int(&mut buf, 8192, 5, 0x20);
        assert!(decoder.decode(&buf).is_err());
    }

    #[test]
    fn test_invalid_index_rejected() {
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&[0x80]).is_err());
        assert!(decoder.decode(&[0xbe]).is_err());
    }

    #[test]
    fn test_header_list_limit() {
        let mut encoder = Encoder::new(4096);
        let buf = encode_pairs(&mut encoder, &[("x-a", "1"), ("x-b", "2")]);
        let mut decoder = Decoder::new(4096).with_max_header_list_size(40);
        assert!(decoder.decode(&buf).is_err());
    }
}
