//! HPACK (RFC 7541) with caller-controlled pseudo-header order.
//!
//! The encoder writes the four request pseudo-headers in the order of the
//! connection's [`PseudoHeaderOrder`], then the regular headers in the order
//! given. Fields are indexed the way browsers do it: exact static or dynamic
//! matches become indexed fields, everything else a literal with incremental
//! indexing, Huffman-coded when that is shorter.

use std::collections::VecDeque;

use super::huffman;
use crate::fingerprint::{PseudoHeader, PseudoHeaderOrder};

/// Dynamic table size both sides start from.
pub const DEFAULT_TABLE_SIZE: usize = 4096;

const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    #[error("header block truncated")]
    Truncated,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("invalid Huffman sequence")]
    Huffman,
    #[error("dynamic table size update to {0} exceeds the advertised limit")]
    TableSizeUpdate(usize),
}

#[rustfmt::skip]
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""), (":method", "GET"), (":method", "POST"), (":path", "/"),
    (":path", "/index.html"), (":scheme", "http"), (":scheme", "https"), (":status", "200"),
    (":status", "204"), (":status", "206"), (":status", "304"), (":status", "400"),
    (":status", "404"), (":status", "500"), ("accept-charset", ""), ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""), ("accept-ranges", ""), ("accept", ""), ("access-control-allow-origin", ""),
    ("age", ""), ("allow", ""), ("authorization", ""), ("cache-control", ""),
    ("content-disposition", ""), ("content-encoding", ""), ("content-language", ""), ("content-length", ""),
    ("content-location", ""), ("content-range", ""), ("content-type", ""), ("cookie", ""),
    ("date", ""), ("etag", ""), ("expect", ""), ("expires", ""),
    ("from", ""), ("host", ""), ("if-match", ""), ("if-modified-since", ""),
    ("if-none-match", ""), ("if-range", ""), ("if-unmodified-since", ""), ("last-modified", ""),
    ("link", ""), ("location", ""), ("max-forwards", ""), ("proxy-authenticate", ""),
    ("proxy-authorization", ""), ("range", ""), ("referer", ""), ("refresh", ""),
    ("retry-after", ""), ("server", ""), ("set-cookie", ""), ("strict-transport-security", ""),
    ("transfer-encoding", ""), ("user-agent", ""), ("vary", ""), ("via", ""),
    ("www-authenticate", ""),
];

/// Encode `value` with an N-bit prefix; `first` holds the representation bits.
fn encode_int(value: usize, prefix_bits: u8, first: u8, out: &mut Vec<u8>) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        out.push(first | value as u8);
        return;
    }
    out.push(first | max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        out.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.push(rest as u8);
}

/// Returns the value and the bytes consumed.
fn decode_int(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        let chunk = usize::from(b & 0x7f)
            .checked_shl(shift)
            .filter(|_| shift < 28)
            .ok_or(HpackError::IntegerOverflow)?;
        value = value.checked_add(chunk).ok_or(HpackError::IntegerOverflow)?;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
    }
    Err(HpackError::Truncated)
}

fn encode_string(input: &[u8], out: &mut Vec<u8>) {
    let huffman_len = huffman::encoded_len(input);
    if huffman_len < input.len() {
        encode_int(huffman_len, 7, 0x80, out);
        huffman::encode(input, out);
    } else {
        encode_int(input.len(), 7, 0x00, out);
        out.extend_from_slice(input);
    }
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    let huffman = buf.first().ok_or(HpackError::Truncated)? & 0x80 != 0;
    let (len, used) = decode_int(buf, 7)?;
    let end = used.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    let raw = buf.get(used..end).ok_or(HpackError::Truncated)?;
    let value = if huffman { huffman::decode(raw)? } else { raw.to_vec() };
    Ok((value, end))
}

#[derive(Debug, Default)]
struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        while self.size + entry_size > self.max_size {
            self.evict();
        }
        self.size += entry_size;
        self.entries.push_front((name, value));
    }

    fn evict(&mut self) {
        if let Some((n, v)) = self.entries.pop_back() {
            self.size -= n.len() + v.len() + ENTRY_OVERHEAD;
        }
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            self.evict();
        }
    }

    /// 1-based HPACK index across both tables.
    fn get(&self, index: usize) -> Result<(Vec<u8>, Vec<u8>), HpackError> {
        match index {
            0 => Err(HpackError::InvalidIndex(0)),
            1..=61 => {
                let (n, v) = STATIC_TABLE[index - 1];
                Ok((n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            }
            _ => self
                .entries
                .get(index - 62)
                .cloned()
                .ok_or(HpackError::InvalidIndex(index)),
        }
    }

    fn find(&self, name: &[u8], value: &[u8]) -> (Option<usize>, Option<usize>) {
        let mut name_only = None;
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if n.as_bytes() == name {
                if v.as_bytes() == value {
                    return (Some(i + 1), None);
                }
                name_only.get_or_insert(i + 1);
            }
        }
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                if v == value {
                    return (Some(i + 62), None);
                }
                name_only.get_or_insert(i + 62);
            }
        }
        (None, name_only)
    }
}

/// Request header encoder bound to one connection.
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    order: PseudoHeaderOrder,
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub fn new(order: PseudoHeaderOrder) -> Self {
        Self {
            table: DynamicTable::new(DEFAULT_TABLE_SIZE),
            order,
            pending_size_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. Never grows past the default.
    pub fn set_max_table_size(&mut self, size: usize) {
        let size = size.min(DEFAULT_TABLE_SIZE);
        if size != self.table.max_size {
            self.table.set_max_size(size);
            self.pending_size_update = Some(size);
        }
    }

    /// Header block for a request. `headers` must already be lower-case and
    /// free of connection-specific fields.
    pub fn encode_request(
        &mut self,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &[(String, String)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(size) = self.pending_size_update.take() {
            encode_int(size, 5, 0x20, &mut out);
        }
        for pseudo in self.order.iter() {
            let value = match pseudo {
                PseudoHeader::Method => method,
                PseudoHeader::Authority => authority,
                PseudoHeader::Scheme => scheme,
                PseudoHeader::Path => path,
            };
            self.encode_field(pseudo.name().as_bytes(), value.as_bytes(), &mut out);
        }
        for (name, value) in headers {
            self.encode_field(name.as_bytes(), value.as_bytes(), &mut out);
        }
        out
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], out: &mut Vec<u8>) {
        match self.table.find(name, value) {
            (Some(index), _) => encode_int(index, 7, 0x80, out),
            (None, Some(name_index)) => {
                encode_int(name_index, 6, 0x40, out);
                encode_string(value, out);
                self.table.insert(name.to_vec(), value.to_vec());
            }
            (None, None) => {
                out.push(0x40);
                encode_string(name, out);
                encode_string(value, out);
                self.table.insert(name.to_vec(), value.to_vec());
            }
        }
    }
}

/// Response header decoder bound to one connection.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// SETTINGS_HEADER_TABLE_SIZE this side advertised.
    limit: usize,
}

impl Decoder {
    pub fn new(limit: usize) -> Self {
        Self {
            table: DynamicTable::new(limit),
            limit,
        }
    }

    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>, HpackError> {
        let mut fields = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let rest = &block[pos..];
            let b = rest[0];
            if b & 0x80 != 0 {
                let (index, used) = decode_int(rest, 7)?;
                let (n, v) = self.table.get(index)?;
                fields.push((n, v));
                pos += used;
            } else if b & 0xe0 == 0x20 {
                let (size, used) = decode_int(rest, 5)?;
                if size > self.limit {
                    return Err(HpackError::TableSizeUpdate(size));
                }
                self.table.set_max_size(size);
                pos += used;
            } else {
                let (prefix, indexing) = if b & 0x40 != 0 { (6, true) } else { (4, false) };
                let (name_index, mut used) = decode_int(rest, prefix)?;
                let name = if name_index == 0 {
                    let (name, n) = decode_string(&rest[used..])?;
                    used += n;
                    name
                } else {
                    self.table.get(name_index)?.0
                };
                let (value, n) = decode_string(&rest[used..])?;
                used += n;
                if indexing {
                    self.table.insert(name.clone(), value.clone());
                }
                fields.push((name, value));
                pos += used;
            }
        }
        Ok(fields
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[(String, String)]) -> Vec<&str> {
        fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_integer_rfc_examples() {
        // RFC 7541 C.1: 10 with a 5-bit prefix, 1337 with a 5-bit prefix.
        let mut out = Vec::new();
        encode_int(10, 5, 0, &mut out);
        assert_eq!(out, [10]);
        out.clear();
        encode_int(1337, 5, 0, &mut out);
        assert_eq!(out, [31, 154, 10]);
        assert_eq!(decode_int(&out, 5).unwrap(), (1337, 3));
        assert_eq!(decode_int(&[31, 154], 5), Err(HpackError::Truncated));
    }

    #[test]
    fn test_request_follows_pseudo_order() {
        let headers = vec![("user-agent".to_string(), "test".to_string())];
        let mut firefox = Encoder::new(PseudoHeaderOrder::FIREFOX);
        let block = firefox.encode_request("GET", "https", "example.com", "/x", &headers);
        let fields = Decoder::new(DEFAULT_TABLE_SIZE).decode(&block).unwrap();
        assert_eq!(names(&fields), vec![":method", ":path", ":authority", ":scheme", "user-agent"]);
        assert_eq!(fields[1].1, "/x");
        assert_eq!(fields[2].1, "example.com");

        let mut chrome = Encoder::new(PseudoHeaderOrder::CHROME);
        let block = chrome.encode_request("GET", "https", "example.com", "/", &[]);
        let fields = Decoder::new(DEFAULT_TABLE_SIZE).decode(&block).unwrap();
        assert_eq!(names(&fields), vec![":method", ":authority", ":scheme", ":path"]);
    }

    #[test]
    fn test_dynamic_table_shared_across_blocks() {
        let headers = vec![("x-token".to_string(), "abcdef".to_string())];
        let mut encoder = Encoder::new(PseudoHeaderOrder::CHROME);
        let mut decoder = Decoder::new(DEFAULT_TABLE_SIZE);

        let first = encoder.encode_request("GET", "https", "a.test", "/", &headers);
        let second = encoder.encode_request("GET", "https", "a.test", "/", &headers);
        assert!(second.len() < first.len());
        decoder.decode(&first).unwrap();
        let fields = decoder.decode(&second).unwrap();
        assert_eq!(fields[4], ("x-token".to_string(), "abcdef".to_string()));
    }

    #[test]
    fn test_decodes_rfc_response_example() {
        // RFC 7541 C.6.1, response with Huffman coding.
        let block = hex::decode(
            "488264025885aec3771a4b6196d07abe941054d444a8200595040b8166e082a62d1bff\
             6e919d29ad171863c78f0b97c8e9ae82ae43d3",
        )
        .unwrap();
        let fields = Decoder::new(256).decode(&block).unwrap();
        assert_eq!(fields[0], (":status".to_string(), "302".to_string()));
        assert_eq!(fields[1], ("cache-control".to_string(), "private".to_string()));
        assert_eq!(fields[3], ("location".to_string(), "https://www.example.com".to_string()));
    }

    #[test]
    fn test_size_update_is_emitted_once() {
        let mut encoder = Encoder::new(PseudoHeaderOrder::CHROME);
        encoder.set_max_table_size(0);
        let block = encoder.encode_request("GET", "https", "a.test", "/", &[]);
        assert_eq!(block[0], 0x20);
        let block = encoder.encode_request("GET", "https", "a.test", "/", &[]);
        assert_ne!(block[0], 0x20);

        let mut decoder = Decoder::new(0);
        assert_eq!(decoder.decode(&[0x3f, 0xe1, 0x1f]), Err(HpackError::TableSizeUpdate(4096)));
    }

    #[test]
    fn test_rejects_bad_index() {
        assert_eq!(Decoder::new(DEFAULT_TABLE_SIZE).decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
        assert_eq!(Decoder::new(DEFAULT_TABLE_SIZE).decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
    }
}
