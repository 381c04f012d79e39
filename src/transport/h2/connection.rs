//! HTTP/2 connection driver.
//!
//! One background task owns the socket. Requests arrive over a command
//! channel, and each open stream reports back through its own event channel,
//! so any number of callers can multiplex one connection. All frames the
//! client writes are produced here, which is what lets the SETTINGS order,
//! the connection WINDOW_UPDATE, the HEADERS priority block and the
//! pseudo-header order follow the fingerprint exactly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::frame::{self, error_code, flags, FrameHeader, FrameType, Priority};
use super::hpack::{Decoder, Encoder};
use crate::error::Error;
use crate::fingerprint::PseudoHeaderOrder;

const DEFAULT_WINDOW: u32 = 65_535;

/// What a stream reports to the caller waiting on it.
#[derive(Debug)]
pub(super) enum StreamEvent {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Data(Bytes),
    End,
    Failed(Error),
}

/// A request handed to the driver.
#[derive(Debug)]
pub(super) struct StreamRequest {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    /// Lower-case, connection headers removed.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

/// Local side of the connection, fixed at handshake time.
#[derive(Debug, Clone)]
pub(super) struct LocalConfig {
    /// SETTINGS in wire order.
    pub settings: Vec<(u16, u32)>,
    /// Connection WINDOW_UPDATE increment sent after SETTINGS; 0 sends none.
    pub window_increment: u32,
    pub priority: Option<Priority>,
    pub pseudo_order: PseudoHeaderOrder,
    pub header_table_size: usize,
    pub stream_window: u32,
    pub max_frame_size: u32,
}

/// Connection error: reported to every stream and sent to the peer as GOAWAY.
#[derive(Debug)]
struct ConnError {
    code: u32,
    message: String,
}

impl ConnError {
    fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: error_code::PROTOCOL_ERROR,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct PeerSettings {
    max_concurrent_streams: u32,
    initial_window_size: u32,
    max_frame_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_WINDOW,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct Stream {
    events: mpsc::UnboundedSender<StreamEvent>,
    send_window: i64,
    /// Request body not yet written; END_STREAM goes out with its last byte.
    pending_body: Bytes,
    recv_unacked: u32,
    has_head: bool,
}

/// Header block spread over HEADERS/PUSH_PROMISE and CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
    promised: Option<u32>,
}

pub(super) struct Connection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    commands: mpsc::Receiver<StreamRequest>,
    accepting: bool,
    queued: VecDeque<StreamRequest>,
    encoder: Encoder,
    decoder: Decoder,
    local: LocalConfig,
    peer: PeerSettings,
    streams: HashMap<u32, Stream>,
    next_stream_id: u32,
    conn_send_window: i64,
    conn_recv_window: u32,
    conn_recv_unacked: u32,
    pending_block: Option<PendingBlock>,
    closed: Arc<AtomicBool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Write the preface, SETTINGS and WINDOW_UPDATE, then spawn the driver.
    ///
    /// Requests may be submitted right away; the server's SETTINGS are
    /// processed whenever they arrive.
    pub(super) async fn start(
        io: S,
        local: LocalConfig,
    ) -> crate::error::Result<(mpsc::Sender<StreamRequest>, Arc<AtomicBool>)> {
        let (reader, mut writer) = tokio::io::split(io);

        let mut preface = BytesMut::new();
        preface.extend_from_slice(frame::CONNECTION_PREFACE);
        frame::write_settings(&mut preface, &local.settings);
        if local.window_increment > 0 {
            frame::write_window_update(&mut preface, 0, local.window_increment);
        }
        writer
            .write_all(&preface)
            .await
            .map_err(|e| Error::http_protocol(format!("HTTP/2 preface write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::http_protocol(format!("HTTP/2 preface flush failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let conn = Connection {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(16_384),
            write_buf: BytesMut::new(),
            commands: rx,
            accepting: true,
            queued: VecDeque::new(),
            encoder: Encoder::new(local.pseudo_order),
            decoder: Decoder::new(local.header_table_size),
            peer: PeerSettings::default(),
            streams: HashMap::new(),
            next_stream_id: 1,
            conn_send_window: i64::from(DEFAULT_WINDOW),
            conn_recv_window: DEFAULT_WINDOW.saturating_add(local.window_increment),
            conn_recv_unacked: 0,
            pending_block: None,
            closed: closed.clone(),
            local,
        };
        tokio::spawn(conn.run());
        Ok((tx, closed))
    }

    async fn run(mut self) {
        let outcome = self.drive().await;
        self.closed.store(true, Ordering::SeqCst);

        let reason = match outcome {
            Ok(()) => {
                frame::write_goaway(&mut self.write_buf, 0, error_code::NO_ERROR);
                let _ = self.flush().await;
                "HTTP/2 connection finished".to_string()
            }
            Err(DriveError::Io(message)) => message,
            Err(DriveError::Conn(e)) => {
                debug!("HTTP/2 connection error {}: {}", error_code::name(e.code), e.message);
                // The client never accepts pushed streams, so last is always 0.
                frame::write_goaway(&mut self.write_buf, 0, e.code);
                let _ = self.flush().await;
                format!("{} ({})", e.message, error_code::name(e.code))
            }
        };
        trace!("HTTP/2 driver exiting: {}", reason);

        for (_, stream) in self.streams.drain() {
            let _ = stream.events.send(StreamEvent::Failed(Error::ConnectionClosed(reason.clone())));
        }
        self.commands.close();
        while let Ok(request) = self.commands.try_recv() {
            self.queued.push_back(request);
        }
        for request in self.queued.drain(..) {
            let _ = request.events.send(StreamEvent::Failed(Error::ConnectionClosed(reason.clone())));
        }
    }

    async fn drive(&mut self) -> Result<(), DriveError> {
        loop {
            while let Some((header, payload)) = self.next_frame()? {
                self.on_frame(header, payload)?;
            }
            self.open_queued();
            self.write_bodies();
            self.flush().await?;

            if !self.accepting && self.streams.is_empty() && self.queued.is_empty() {
                return Ok(());
            }

            tokio::select! {
                request = self.commands.recv(), if self.accepting => match request {
                    Some(request) => self.queued.push_back(request),
                    None => self.accepting = false,
                },
                read = self.reader.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => return Err(DriveError::Io("peer closed the HTTP/2 connection".into())),
                    Ok(_) => {}
                    Err(e) => return Err(DriveError::Io(format!("HTTP/2 read failed: {}", e))),
                },
            }
        }
    }

    async fn flush(&mut self) -> Result<(), DriveError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let out = self.write_buf.split();
        self.writer
            .write_all(&out)
            .await
            .map_err(|e| DriveError::Io(format!("HTTP/2 write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| DriveError::Io(format!("HTTP/2 flush failed: {}", e)))
    }

    fn next_frame(&mut self) -> Result<Option<(FrameHeader, Bytes)>, ConnError> {
        let Some(header) = FrameHeader::parse(&self.read_buf) else {
            return Ok(None);
        };
        if header.length > self.local.max_frame_size {
            return Err(ConnError {
                code: error_code::FRAME_SIZE_ERROR,
                message: format!("frame of {} bytes exceeds {}", header.length, self.local.max_frame_size),
            });
        }
        let total = frame::FRAME_HEADER_SIZE + header.length as usize;
        if self.read_buf.len() < total {
            return Ok(None);
        }
        let mut raw = self.read_buf.split_to(total);
        let payload = raw.split_off(frame::FRAME_HEADER_SIZE).freeze();
        Ok(Some((header, payload)))
    }

    fn open_queued(&mut self) {
        while self.streams.len() < self.peer.max_concurrent_streams as usize {
            let Some(request) = self.queued.pop_front() else { break };
            if request.events.is_closed() {
                continue;
            }
            if self.next_stream_id > 0x7fff_ffff {
                self.accepting = false;
                let _ = request
                    .events
                    .send(StreamEvent::Failed(Error::ConnectionClosed("HTTP/2 stream ids exhausted".into())));
                continue;
            }
            let id = self.next_stream_id;
            self.next_stream_id += 2;

            let block = self.encoder.encode_request(
                &request.method,
                &request.scheme,
                &request.authority,
                &request.path,
                &request.headers,
            );
            let end_stream = request.body.is_empty();
            frame::write_headers(
                &mut self.write_buf,
                id,
                &block,
                self.local.priority,
                end_stream,
                self.peer.max_frame_size as usize,
            );
            trace!("HTTP/2 stream {} opened: {} {}", id, request.method, request.path);
            self.streams.insert(
                id,
                Stream {
                    events: request.events,
                    send_window: i64::from(self.peer.initial_window_size),
                    pending_body: request.body,
                    recv_unacked: 0,
                    has_head: false,
                },
            );
        }
    }

    /// Write as much pending request body as both windows allow.
    fn write_bodies(&mut self) {
        for (id, stream) in self.streams.iter_mut() {
            while !stream.pending_body.is_empty() {
                let allowed = self
                    .conn_send_window
                    .min(stream.send_window)
                    .min(i64::from(self.peer.max_frame_size));
                if allowed <= 0 {
                    break;
                }
                let n = stream.pending_body.len().min(allowed as usize);
                let chunk = stream.pending_body.split_to(n);
                frame::write_data(&mut self.write_buf, *id, &chunk, stream.pending_body.is_empty());
                self.conn_send_window -= n as i64;
                stream.send_window -= n as i64;
            }
        }
    }

    /// Deliver an event; a caller that went away gets its stream cancelled.
    fn emit(&mut self, id: u32, event: StreamEvent) {
        let Some(stream) = self.streams.get(&id) else { return };
        if stream.events.send(event).is_err() {
            trace!("HTTP/2 stream {} abandoned by caller", id);
            self.streams.remove(&id);
            frame::write_rst_stream(&mut self.write_buf, id, error_code::CANCEL);
        }
    }

    fn finish(&mut self, id: u32) {
        self.emit(id, StreamEvent::End);
        self.streams.remove(&id);
    }

    fn on_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<(), ConnError> {
        trace!("HTTP/2 recv {:?} stream={} len={} flags={:#x}", header.frame_type, header.stream_id, header.length, header.flags);
        if self.pending_block.is_some() && header.frame_type != FrameType::Continuation {
            return Err(ConnError::protocol("expected CONTINUATION"));
        }

        match header.frame_type {
            FrameType::Data => self.on_data(header, payload),
            FrameType::Headers => {
                if header.stream_id == 0 {
                    return Err(ConnError::protocol("HEADERS on stream 0"));
                }
                let block = frame::unpad(&header, payload).map_err(ConnError::protocol)?;
                self.begin_block(header, block, None)
            }
            FrameType::PushPromise => {
                let mut block = frame::unpad(&header, payload).map_err(ConnError::protocol)?;
                let promised = frame::parse_u32(&block).ok_or_else(|| ConnError::protocol("PUSH_PROMISE truncated"))? & 0x7fff_ffff;
                if !self.push_enabled() {
                    return Err(ConnError::protocol("PUSH_PROMISE with push disabled"));
                }
                let block = block.split_off(4);
                self.begin_block(header, block, Some(promised))
            }
            FrameType::Continuation => {
                let Some(pending) = self.pending_block.as_mut() else {
                    return Err(ConnError::protocol("unexpected CONTINUATION"));
                };
                if pending.stream_id != header.stream_id {
                    return Err(ConnError::protocol("CONTINUATION on another stream"));
                }
                pending.block.extend_from_slice(&payload);
                if header.has(flags::END_HEADERS) {
                    if let Some(done) = self.pending_block.take() {
                        self.on_block(done)?;
                    }
                }
                Ok(())
            }
            FrameType::Settings => self.on_settings(header, &payload),
            FrameType::Ping => {
                let data: [u8; 8] = payload[..].try_into().map_err(|_| ConnError {
                    code: error_code::FRAME_SIZE_ERROR,
                    message: "PING payload must be 8 bytes".into(),
                })?;
                if !header.has(flags::ACK) {
                    frame::write_ping_ack(&mut self.write_buf, data);
                }
                Ok(())
            }
            FrameType::GoAway => {
                let (last, code) = frame::parse_goaway(&payload).ok_or_else(|| ConnError::protocol("GOAWAY truncated"))?;
                debug!("HTTP/2 GOAWAY last_stream={} code={}", last, error_code::name(code));
                self.accepting = false;
                self.commands.close();
                let reason = format!("GOAWAY {} received", error_code::name(code));
                let refused: Vec<u32> = self.streams.keys().copied().filter(|id| *id > last).collect();
                for id in refused {
                    if let Some(stream) = self.streams.remove(&id) {
                        let _ = stream.events.send(StreamEvent::Failed(Error::ConnectionClosed(reason.clone())));
                    }
                }
                while let Ok(request) = self.commands.try_recv() {
                    self.queued.push_back(request);
                }
                for request in self.queued.drain(..) {
                    let _ = request.events.send(StreamEvent::Failed(Error::ConnectionClosed(reason.clone())));
                }
                Ok(())
            }
            FrameType::RstStream => {
                let code = frame::parse_u32(&payload).ok_or_else(|| ConnError::protocol("RST_STREAM truncated"))?;
                if let Some(stream) = self.streams.remove(&header.stream_id) {
                    let _ = stream.events.send(StreamEvent::Failed(Error::http_protocol(format!(
                        "HTTP/2 stream reset by peer: {}",
                        error_code::name(code)
                    ))));
                }
                Ok(())
            }
            FrameType::WindowUpdate => {
                let increment = frame::parse_u32(&payload).ok_or_else(|| ConnError::protocol("WINDOW_UPDATE truncated"))? & 0x7fff_ffff;
                if header.stream_id == 0 {
                    if increment == 0 {
                        return Err(ConnError::protocol("zero connection WINDOW_UPDATE"));
                    }
                    self.conn_send_window += i64::from(increment);
                    if self.conn_send_window > i64::from(frame::MAX_WINDOW_SIZE) {
                        return Err(ConnError {
                            code: error_code::FLOW_CONTROL_ERROR,
                            message: "connection send window overflow".into(),
                        });
                    }
                } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                    stream.send_window += i64::from(increment);
                }
                Ok(())
            }
            FrameType::Priority | FrameType::Unknown(_) => Ok(()),
        }
    }

    fn push_enabled(&self) -> bool {
        self.local
            .settings
            .iter()
            .find(|(id, _)| *id == crate::fingerprint::http2::SETTINGS_ENABLE_PUSH)
            .map_or(true, |(_, v)| *v != 0)
    }

    fn begin_block(&mut self, header: FrameHeader, block: Bytes, promised: Option<u32>) -> Result<(), ConnError> {
        let pending = PendingBlock {
            stream_id: header.stream_id,
            block: BytesMut::from(&block[..]),
            end_stream: header.has(flags::END_STREAM),
            promised,
        };
        if header.has(flags::END_HEADERS) {
            self.on_block(pending)
        } else {
            self.pending_block = Some(pending);
            Ok(())
        }
    }

    fn on_block(&mut self, pending: PendingBlock) -> Result<(), ConnError> {
        // Decode even for unknown streams so the dynamic table stays in sync.
        let fields = self.decoder.decode(&pending.block).map_err(|e| ConnError {
            code: error_code::COMPRESSION_ERROR,
            message: format!("HPACK decode failed: {}", e),
        })?;
        if let Some(promised) = pending.promised {
            frame::write_rst_stream(&mut self.write_buf, promised, error_code::REFUSED_STREAM);
            return Ok(());
        }

        let id = pending.stream_id;
        let Some(stream) = self.streams.get(&id) else {
            return Ok(());
        };
        if !stream.has_head {
            let status = fields
                .iter()
                .find(|(n, _)| n == ":status")
                .and_then(|(_, v)| v.parse::<u16>().ok());
            let Some(status) = status else {
                frame::write_rst_stream(&mut self.write_buf, id, error_code::PROTOCOL_ERROR);
                if let Some(stream) = self.streams.remove(&id) {
                    let _ = stream.events.send(StreamEvent::Failed(Error::http_protocol("response without :status")));
                }
                return Ok(());
            };
            if (100..200).contains(&status) && !pending.end_stream {
                trace!("HTTP/2 stream {} informational {}", id, status);
                return Ok(());
            }
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.has_head = true;
            }
            let headers = fields.into_iter().filter(|(n, _)| !n.starts_with(':')).collect();
            self.emit(id, StreamEvent::Head { status, headers });
        }
        if pending.end_stream {
            self.finish(id);
        }
        Ok(())
    }

    fn on_data(&mut self, header: FrameHeader, payload: Bytes) -> Result<(), ConnError> {
        if header.stream_id == 0 {
            return Err(ConnError::protocol("DATA on stream 0"));
        }
        // Flow control counts the whole payload, padding included.
        let len = header.length;
        self.conn_recv_unacked += len;
        if self.conn_recv_unacked >= self.conn_recv_window / 2 {
            frame::write_window_update(&mut self.write_buf, 0, self.conn_recv_unacked);
            self.conn_recv_unacked = 0;
        }

        let data = frame::unpad(&header, payload).map_err(ConnError::protocol)?;
        let id = header.stream_id;
        let end_stream = header.has(flags::END_STREAM);
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if !stream.has_head {
            return Err(ConnError::protocol(format!("DATA before HEADERS on stream {id}")));
        }
        if !end_stream {
            stream.recv_unacked += len;
            if stream.recv_unacked >= self.local.stream_window / 2 {
                frame::write_window_update(&mut self.write_buf, id, stream.recv_unacked);
                stream.recv_unacked = 0;
            }
        }
        if !data.is_empty() {
            self.emit(id, StreamEvent::Data(data));
        }
        if end_stream {
            self.finish(id);
        }
        Ok(())
    }

    fn on_settings(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), ConnError> {
        if header.stream_id != 0 {
            return Err(ConnError::protocol("SETTINGS on a stream"));
        }
        if header.has(flags::ACK) {
            return Ok(());
        }
        let settings = frame::parse_settings(payload).map_err(|m| ConnError {
            code: error_code::FRAME_SIZE_ERROR,
            message: m.into(),
        })?;
        for (id, value) in settings {
            match id {
                0x1 => self.encoder.set_max_table_size(value as usize),
                0x3 => self.peer.max_concurrent_streams = value,
                0x4 => {
                    if value > frame::MAX_WINDOW_SIZE {
                        return Err(ConnError {
                            code: error_code::FLOW_CONTROL_ERROR,
                            message: format!("INITIAL_WINDOW_SIZE {value} too large"),
                        });
                    }
                    let delta = i64::from(value) - i64::from(self.peer.initial_window_size);
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                    self.peer.initial_window_size = value;
                }
                0x5 => {
                    if !(frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(ConnError::protocol(format!("MAX_FRAME_SIZE {value} out of range")));
                    }
                    self.peer.max_frame_size = value;
                }
                _ => {}
            }
        }
        frame::write_settings_ack(&mut self.write_buf);
        Ok(())
    }
}

#[derive(Debug)]
enum DriveError {
    /// The socket failed; nothing more can be sent.
    Io(String),
    Conn(ConnError),
}

impl From<ConnError> for DriveError {
    fn from(e: ConnError) -> Self {
        DriveError::Conn(e)
    }
}
