//! HTTP/2 frame layout (RFC 9113 section 4 and 6).
//!
//! Only what a client needs: frames the client writes are built here with
//! their wire order fixed by the caller, and frames a server sends are
//! parsed from a complete payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 9;

/// SETTINGS_MAX_FRAME_SIZE before the peer says otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Upper bound for SETTINGS_MAX_FRAME_SIZE.
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest flow-control window.
pub const MAX_WINDOW_SIZE: u32 = i32::MAX as u32;

/// Client connection preface.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    /// SETTINGS and PING.
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// RFC 9113 section 7 error codes the client sends or reports.
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;

    pub fn name(code: u32) -> &'static str {
        match code {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse the 9-byte header. The reserved stream-id bit is ignored on receipt.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let length = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Some(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id,
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

fn frame(buf: &mut BytesMut, frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) {
    FrameHeader {
        length: payload.len() as u32,
        frame_type,
        flags,
        stream_id,
    }
    .write(buf);
    buf.extend_from_slice(payload);
}

/// SETTINGS with the parameters written in the given order.
pub fn write_settings(buf: &mut BytesMut, settings: &[(u16, u32)]) {
    let mut payload = BytesMut::with_capacity(settings.len() * 6);
    for (id, value) in settings {
        payload.put_u16(*id);
        payload.put_u32(*value);
    }
    frame(buf, FrameType::Settings, 0, 0, &payload);
}

pub fn write_settings_ack(buf: &mut BytesMut) {
    frame(buf, FrameType::Settings, flags::ACK, 0, &[]);
}

pub fn write_window_update(buf: &mut BytesMut, stream_id: u32, increment: u32) {
    frame(buf, FrameType::WindowUpdate, 0, stream_id, &(increment & 0x7fff_ffff).to_be_bytes());
}

pub fn write_ping_ack(buf: &mut BytesMut, data: [u8; 8]) {
    frame(buf, FrameType::Ping, flags::ACK, 0, &data);
}

pub fn write_rst_stream(buf: &mut BytesMut, stream_id: u32, code: u32) {
    frame(buf, FrameType::RstStream, 0, stream_id, &code.to_be_bytes());
}

pub fn write_goaway(buf: &mut BytesMut, last_stream_id: u32, code: u32) {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    payload[4..].copy_from_slice(&code.to_be_bytes());
    frame(buf, FrameType::GoAway, 0, 0, &payload);
}

pub fn write_data(buf: &mut BytesMut, stream_id: u32, data: &[u8], end_stream: bool) {
    let flags = if end_stream { flags::END_STREAM } else { 0 };
    frame(buf, FrameType::Data, flags, stream_id, data);
}

/// Priority block carried by a HEADERS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    /// Wire weight (`weight - 1`).
    pub weight: u8,
}

impl Priority {
    fn encode(&self) -> [u8; 5] {
        let mut dep = self.dependency & 0x7fff_ffff;
        if self.exclusive {
            dep |= 0x8000_0000;
        }
        let d = dep.to_be_bytes();
        [d[0], d[1], d[2], d[3], self.weight]
    }
}

/// HEADERS plus as many CONTINUATION frames as `max_frame_size` requires.
pub fn write_headers(
    buf: &mut BytesMut,
    stream_id: u32,
    block: &[u8],
    priority: Option<Priority>,
    end_stream: bool,
    max_frame_size: usize,
) {
    let prefix = priority.map(|p| p.encode());
    let prefix_len = prefix.map_or(0, |p| p.len());
    let first_len = block.len().min(max_frame_size.saturating_sub(prefix_len).max(1));
    let (first, mut rest) = block.split_at(first_len);

    let mut bits = 0;
    if end_stream {
        bits |= flags::END_STREAM;
    }
    if rest.is_empty() {
        bits |= flags::END_HEADERS;
    }
    if prefix.is_some() {
        bits |= flags::PRIORITY;
    }
    let mut payload = BytesMut::with_capacity(prefix_len + first.len());
    if let Some(p) = prefix {
        payload.extend_from_slice(&p);
    }
    payload.extend_from_slice(first);
    frame(buf, FrameType::Headers, bits, stream_id, &payload);

    while !rest.is_empty() {
        let n = rest.len().min(max_frame_size.max(1));
        let (chunk, tail) = rest.split_at(n);
        let bits = if tail.is_empty() { flags::END_HEADERS } else { 0 };
        frame(buf, FrameType::Continuation, bits, stream_id, chunk);
        rest = tail;
    }
}

/// Strip padding (and the priority block for HEADERS) from a payload.
pub fn unpad(header: &FrameHeader, mut payload: Bytes) -> Result<Bytes, &'static str> {
    let pad_len = if header.has(flags::PADDED) {
        if payload.is_empty() {
            return Err("padded frame without pad length");
        }
        usize::from(payload.get_u8())
    } else {
        0
    };
    if header.frame_type == FrameType::Headers && header.has(flags::PRIORITY) {
        if payload.len() < 5 {
            return Err("HEADERS priority block truncated");
        }
        payload.advance(5);
    }
    if pad_len > payload.len() {
        return Err("padding exceeds payload");
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

/// Parse a SETTINGS payload into `(id, value)` pairs.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>, &'static str> {
    if payload.len() % 6 != 0 {
        return Err("SETTINGS length not a multiple of 6");
    }
    Ok(payload
        .chunks_exact(6)
        .map(|c| (u16::from_be_bytes([c[0], c[1]]), u32::from_be_bytes([c[2], c[3], c[4], c[5]])))
        .collect())
}

pub fn parse_u32(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// GOAWAY payload: last stream id and error code.
pub fn parse_goaway(payload: &[u8]) -> Option<(u32, u32)> {
    let last = parse_u32(payload)? & 0x7fff_ffff;
    let code = parse_u32(payload.get(4..)?)?;
    Some((last, code))
}
