//! HTTP/2 transport shaped by an [`Http2Fingerprint`].
//!
//! Frames and HPACK are written here rather than by a general-purpose
//! library, so every part of the fingerprint reaches the wire: SETTINGS in
//! the fingerprint's order, the connection WINDOW_UPDATE increment, the
//! HEADERS priority block and the pseudo-header order.

mod connection;
mod frame;
mod hpack;
mod huffman;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use http::Version;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use self::connection::{Connection, LocalConfig, StreamEvent, StreamRequest};
use self::frame::Priority;
use super::{is_connection_header, MaybeHttpsStream, RawRequest, RawResponse, TlsInfo};
use crate::error::{Error, Result};
use crate::fingerprint::http2::{
    SETTINGS_HEADER_TABLE_SIZE, SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_FRAME_SIZE,
};
use crate::fingerprint::Http2Fingerprint;
use crate::timeouts::{within, Timeouts};

/// Multiplexed HTTP/2 connection for one address.
pub struct H2Transport {
    requests: mpsc::Sender<StreamRequest>,
    closed: Arc<AtomicBool>,
    fingerprint: Http2Fingerprint,
    tls: Option<TlsInfo>,
}

impl std::fmt::Debug for H2Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Transport")
            .field("fingerprint", &self.fingerprint.to_string())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("tls", &self.tls)
            .finish()
    }
}

/// Local connection parameters derived from a fingerprint.
///
/// The stream dependency segment becomes the connection WINDOW_UPDATE
/// increment. HEADERS depend on the root stream with the fingerprint's
/// exclusive flag and weight.
fn local_config(fp: &Http2Fingerprint) -> LocalConfig {
    let mut settings = Vec::with_capacity(fp.settings.order.len());
    for id in &fp.settings.order {
        let Some(mut value) = fp.settings.get(*id) else { continue };
        match *id {
            SETTINGS_INITIAL_WINDOW_SIZE if value > frame::MAX_WINDOW_SIZE => {
                warn!("HTTP/2 initial_window_size {} clamped", value);
                value = frame::MAX_WINDOW_SIZE;
            }
            SETTINGS_MAX_FRAME_SIZE
                if !(frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_MAX_FRAME_SIZE).contains(&value) =>
            {
                warn!("HTTP/2 max_frame_size {} out of range, not sent", value);
                continue;
            }
            _ => {}
        }
        settings.push((*id, value));
    }

    let lookup = |id: u16| settings.iter().find(|(k, _)| *k == id).map(|(_, v)| *v);
    let header_table_size = lookup(SETTINGS_HEADER_TABLE_SIZE).unwrap_or(4_096) as usize;
    let stream_window = lookup(SETTINGS_INITIAL_WINDOW_SIZE).unwrap_or(65_535);
    let max_frame_size = lookup(SETTINGS_MAX_FRAME_SIZE).unwrap_or(frame::DEFAULT_MAX_FRAME_SIZE);

    LocalConfig {
        window_increment: fp.stream_dependency.min(frame::MAX_WINDOW_SIZE - 65_535),
        priority: Some(Priority {
            exclusive: fp.exclusive,
            dependency: 0,
            weight: (fp.weight.clamp(1, 256) - 1) as u8,
        }),
        pseudo_order: fp.pseudo_header_order,
        header_table_size,
        stream_window,
        max_frame_size,
        settings,
    }
}

/// Regular request headers: lower-case, without host, pseudo or
/// connection-specific fields.
fn request_headers(req: &RawRequest) -> Vec<(String, String)> {
    req.headers
        .iter()
        .filter(|(k, _)| !(k.eq_ignore_ascii_case("host") || k.starts_with(':') || is_connection_header(k)))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

impl H2Transport {
    /// Run the HTTP/2 preface on a negotiated connection and spawn its driver.
    pub async fn connect(stream: MaybeHttpsStream, fingerprint: Http2Fingerprint) -> Result<Self> {
        let tls = stream.tls_info();
        Self::handshake(stream, fingerprint, tls).await
    }

    pub(crate) async fn handshake<S>(io: S, fingerprint: Http2Fingerprint, tls: Option<TlsInfo>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, closed) = Connection::start(io, local_config(&fingerprint)).await?;
        debug!("HTTP/2 connection up, fingerprint {}", fingerprint);
        Ok(Self {
            requests,
            closed,
            fingerprint,
            tls,
        })
    }

    pub fn fingerprint(&self) -> &Http2Fingerprint {
        &self.fingerprint
    }

    pub async fn send(&self, req: &RawRequest, timeouts: &Timeouts) -> Result<RawResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("HTTP/2 connection is closed".into()));
        }

        let (events, mut rx) = mpsc::unbounded_channel();
        let request = StreamRequest {
            method: req.method.as_str().to_string(),
            scheme: req.url.scheme().to_string(),
            authority: req.authority(),
            path: req.path_and_query(),
            headers: request_headers(req),
            body: req.body.clone(),
            events,
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| Error::ConnectionClosed("HTTP/2 connection is closed".into()))?;

        let (status, headers) = within(
            timeouts.ttfb,
            async {
                match rx.recv().await {
                    Some(StreamEvent::Head { status, headers }) => Ok((status, headers)),
                    Some(StreamEvent::Failed(e)) => Err(e),
                    Some(_) | None => Err(Error::ConnectionClosed(
                        "HTTP/2 stream ended before response headers".into(),
                    )),
                }
            },
            Error::TtfbTimeout,
        )
        .await?;

        let mut body = BytesMut::new();
        loop {
            let event = within(timeouts.read_idle, async { Ok(rx.recv().await) }, Error::ReadIdleTimeout).await?;
            match event {
                Some(StreamEvent::Data(chunk)) => body.extend_from_slice(&chunk),
                Some(StreamEvent::End) => break,
                Some(StreamEvent::Failed(e)) => return Err(e),
                Some(StreamEvent::Head { .. }) => {}
                None => {
                    return Err(Error::ConnectionClosed("HTTP/2 stream dropped mid-body".into()));
                }
            }
        }

        Ok(RawResponse {
            status,
            version: Version::HTTP_2,
            headers,
            body: body.freeze(),
            tls: self.tls.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::frame::{flags, FrameHeader, FrameType};
    use super::hpack::Decoder;
    use super::*;
    use crate::fingerprint::BrowserFamily;
    use bytes::{BufMut, Bytes};
    use http::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use url::Url;

    async fn read_frame(io: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
        let mut head = [0u8; frame::FRAME_HEADER_SIZE];
        io.read_exact(&mut head).await.unwrap();
        let header = FrameHeader::parse(&head).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        io.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    fn raw_frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_uint(payload.len() as u64, 3);
        out.put_u8(kind);
        out.put_u8(flags);
        out.put_u32(stream_id);
        out.put_slice(payload);
        out.to_vec()
    }

    #[test]
    fn test_request_headers_strip_connection_headers() {
        let mut req = RawRequest::new(Method::GET, Url::parse("https://example.com/p?q=1").unwrap());
        req.headers = vec![
            ("Host".into(), "example.com".into()),
            ("Connection".into(), "keep-alive".into()),
            ("User-Agent".into(), "test".into()),
            ("Accept".into(), "*/*".into()),
        ];
        let names: Vec<String> = request_headers(&req).into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["user-agent", "accept"]);
    }

    #[test]
    fn test_local_config_follows_fingerprint() {
        let fp = Http2Fingerprint::for_family(BrowserFamily::Chrome);
        let config = local_config(&fp);
        let ids: Vec<u16> = config.settings.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 4, 6]);
        assert_eq!(config.window_increment, 15_663_105);
        assert_eq!(config.stream_window, 6_291_456);
        assert_eq!(config.header_table_size, 65_536);
        let priority = config.priority.unwrap();
        assert_eq!(priority.weight, 255);
        assert_eq!(priority.dependency, 0);

        // out-of-range frame size is dropped, oversized window clamped
        let odd = Http2Fingerprint::parse("5:1,4:4294967295|0|1|m,a,s,p").unwrap();
        let config = local_config(&odd);
        assert_eq!(config.settings, vec![(4, frame::MAX_WINDOW_SIZE)]);
        assert_eq!(config.max_frame_size, frame::DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.window_increment, 0);
        assert!(config.priority.unwrap().exclusive);
    }

    #[tokio::test]
    async fn test_firefox_fingerprint_on_the_wire() {
        let (client_io, mut server) = tokio::io::duplex(64 * 1024);
        let fp = Http2Fingerprint::for_family(BrowserFamily::Firefox);
        let transport = H2Transport::handshake(client_io, fp, None).await.unwrap();

        let client = tokio::spawn(async move {
            let mut req = RawRequest::new(Method::GET, Url::parse("https://example.com/index?x=1").unwrap());
            req.headers = vec![("User-Agent".into(), "mimic-test".into())];
            transport.send(&req, &Timeouts::new()).await
        });

        let mut preface = [0u8; 24];
        server.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], frame::CONNECTION_PREFACE);

        let (settings, payload) = read_frame(&mut server).await;
        assert_eq!(settings.frame_type, FrameType::Settings);
        let ids: Vec<u16> = frame::parse_settings(&payload).unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);

        let (update, payload) = read_frame(&mut server).await;
        assert_eq!(update.frame_type, FrameType::WindowUpdate);
        assert_eq!(update.stream_id, 0);
        assert_eq!(frame::parse_u32(&payload), Some(12_517_377));

        let (headers, payload) = read_frame(&mut server).await;
        assert_eq!(headers.frame_type, FrameType::Headers);
        assert_eq!(headers.stream_id, 1);
        assert!(headers.has(flags::PRIORITY));
        assert!(headers.has(flags::END_STREAM));
        assert!(headers.has(flags::END_HEADERS));
        assert_eq!(&payload[..5], &[0, 0, 0, 0, 255]);
        let fields = Decoder::new(65_536).decode(&payload[5..]).unwrap();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![":method", ":path", ":authority", ":scheme", "user-agent"]);
        assert_eq!(fields[1].1, "/index?x=1");

        let mut reply = raw_frame(0x4, 0, 0, &[]);
        // :status 200 (static 8), content-type: text/plain (literal, name index 31)
        let mut block = vec![0x88, 0x0f, 0x10, 10];
        block.extend_from_slice(b"text/plain");
        reply.extend(raw_frame(0x1, flags::END_HEADERS, 1, &block));
        reply.extend(raw_frame(0x0, flags::END_STREAM, 1, b"hello"));
        server.write_all(&reply).await.unwrap();

        let response = client.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.version, Version::HTTP_2);
        assert_eq!(response.body, Bytes::from_static(b"hello"));
        assert_eq!(response.headers, vec![("content-type".to_string(), "text/plain".to_string())]);

        // the server's SETTINGS are acknowledged
        let (ack, _) = read_frame(&mut server).await;
        assert_eq!(ack.frame_type, FrameType::Settings);
        assert!(ack.has(flags::ACK));
    }

    #[tokio::test]
    async fn test_request_body_and_reset() {
        let (client_io, mut server) = tokio::io::duplex(64 * 1024);
        let fp = Http2Fingerprint::for_family(BrowserFamily::Chrome);
        let transport = H2Transport::handshake(client_io, fp, None).await.unwrap();

        let client = tokio::spawn(async move {
            let mut req = RawRequest::new(Method::POST, Url::parse("https://example.com/upload").unwrap());
            req.body = Bytes::from_static(b"payload");
            transport.send(&req, &Timeouts::new()).await
        });

        let mut preface = [0u8; 24];
        server.read_exact(&mut preface).await.unwrap();
        let _settings = read_frame(&mut server).await;
        let _update = read_frame(&mut server).await;
        let (headers, _) = read_frame(&mut server).await;
        assert!(!headers.has(flags::END_STREAM));
        let (data, payload) = read_frame(&mut server).await;
        assert_eq!(data.frame_type, FrameType::Data);
        assert!(data.has(flags::END_STREAM));
        assert_eq!(payload, b"payload");

        // RST_STREAM REFUSED_STREAM
        server.write_all(&raw_frame(0x3, 0, 1, &[0, 0, 0, 7])).await.unwrap();
        let err = client.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("REFUSED_STREAM"), "{err}");
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_lost() {
        let (client_io, server) = tokio::io::duplex(64 * 1024);
        let fp = Http2Fingerprint::for_family(BrowserFamily::Chrome);
        let transport = H2Transport::handshake(client_io, fp, None).await.unwrap();
        drop(server);

        let req = RawRequest::new(Method::GET, Url::parse("https://example.com/").unwrap());
        let err = transport.send(&req, &Timeouts::new()).await.unwrap_err();
        assert!(err.is_connection_lost(), "{err}");
    }
}
