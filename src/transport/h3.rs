//! HTTP/3 transport via quiche.
//!
//! Every request gets its own UDP socket and QUIC connection; nothing is
//! cached. A compiled [`QuicSpec`] shapes the TLS context, transport
//! parameters and HTTP/3 SETTINGS. If the fingerprinted context cannot be
//! built the transport falls back to quiche's default TLS with a warning.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use boring::ssl::{SslContextBuilder, SslMethod};
use bytes::Bytes;
use getrandom::fill as getrandom_fill;
use http::Version;
use quiche::h3::NameValue;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use super::connector::apply_spec;
use super::{is_connection_header, RawRequest, RawResponse};
use crate::error::{Error, Result};
use crate::fingerprint::{BrowserFamily, PseudoHeader, QuicSpec};
use crate::timeouts::Timeouts;

/// Maximum datagram size for QUIC.
const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds.
const QUIC_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Initial maximum data for QUIC connection.
const INITIAL_MAX_DATA: u64 = 10_000_000;

const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30);

const H3_SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
const H3_SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x6;
const H3_SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x7;
const H3_SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x8;

#[derive(Debug, Clone, Default)]
pub struct H3Transport {
    spec: Option<QuicSpec>,
    family: BrowserFamily,
    insecure: bool,
}

impl H3Transport {
    pub fn new(spec: Option<QuicSpec>, family: BrowserFamily) -> Self {
        Self {
            spec,
            family,
            insecure: false,
        }
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn is_fingerprinted(&self) -> bool {
        self.spec.is_some()
    }

    fn fingerprinted_config(spec: &QuicSpec) -> Result<quiche::Config> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())
            .map_err(|e| Error::tls(format!("Failed to create SSL context: {}", e)))?;
        apply_spec(&mut ctx, &spec.hello)?;
        quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, ctx)
            .map_err(|e| Error::quic(format!("Failed to create quiche config with TLS fingerprint: {}", e)))
    }

    fn configure_quic(&self) -> Result<quiche::Config> {
        let fingerprinted = match &self.spec {
            Some(spec) => match Self::fingerprinted_config(spec) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("QUIC fingerprint not applied, using default TLS: {}", e);
                    None
                }
            },
            None => None,
        };
        let mut config = match fingerprinted {
            Some(config) => config,
            None => quiche::Config::new(quiche::PROTOCOL_VERSION)
                .map_err(|e| Error::quic(format!("Failed to create quiche config: {}", e)))?,
        };

        config
            .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
            .map_err(|e| Error::quic(format!("Failed to set ALPN: {}", e)))?;
        config.verify_peer(!self.insecure);

        config.set_max_idle_timeout(QUIC_IDLE_TIMEOUT_MS);
        config.set_max_recv_udp_payload_size(65535);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(INITIAL_MAX_DATA);
        config.set_initial_max_stream_data_bidi_local(1_000_000);
        config.set_initial_max_stream_data_bidi_remote(1_000_000);
        config.set_initial_max_stream_data_uni(1_000_000);
        config.set_initial_max_streams_bidi(100);
        config.set_initial_max_streams_uni(100);
        config.set_disable_active_migration(true);

        if let Some(spec) = &self.spec {
            let p = &spec.transport_params;
            if let Some(v) = p.max_idle_timeout {
                config.set_max_idle_timeout(v);
            }
            if let Some(v) = p.max_udp_payload_size {
                config.set_max_recv_udp_payload_size(v as usize);
            }
            if let Some(v) = p.initial_max_data {
                config.set_initial_max_data(v);
            }
            if let Some(v) = p.initial_max_stream_data_bidi_local {
                config.set_initial_max_stream_data_bidi_local(v);
            }
            if let Some(v) = p.initial_max_stream_data_bidi_remote {
                config.set_initial_max_stream_data_bidi_remote(v);
            }
            if let Some(v) = p.initial_max_stream_data_uni {
                config.set_initial_max_stream_data_uni(v);
            }
            if let Some(v) = p.initial_max_streams_bidi {
                config.set_initial_max_streams_bidi(v);
            }
            if let Some(v) = p.initial_max_streams_uni {
                config.set_initial_max_streams_uni(v);
            }
            if let Some(v) = p.active_connection_id_limit {
                config.set_active_connection_id_limit(v);
            }
        }
        Ok(config)
    }

    fn h3_config(&self) -> Result<quiche::h3::Config> {
        let mut config = quiche::h3::Config::new()
            .map_err(|e| Error::quic(format!("Failed to create HTTP/3 config: {}", e)))?;
        if let Some(spec) = &self.spec {
            for (id, value) in &spec.h3_settings {
                match *id {
                    H3_SETTINGS_QPACK_MAX_TABLE_CAPACITY => config.set_qpack_max_table_capacity(*value),
                    H3_SETTINGS_MAX_FIELD_SECTION_SIZE => config.set_max_field_section_size(*value),
                    H3_SETTINGS_QPACK_BLOCKED_STREAMS => config.set_qpack_blocked_streams(*value),
                    H3_SETTINGS_ENABLE_CONNECT_PROTOCOL => config.enable_extended_connect(*value != 0),
                    other => trace!("HTTP/3 setting {:#x} not configurable", other),
                }
            }
        }
        Ok(config)
    }

    /// Request headers in wire order: pseudo-headers per browser family, then the rest.
    fn request_headers(&self, req: &RawRequest) -> Vec<quiche::h3::Header> {
        let path = req.path_and_query();
        let authority = req.authority();
        let mut out: Vec<quiche::h3::Header> = self
            .family
            .pseudo_header_order()
            .iter()
            .map(|p| {
                let value: &[u8] = match p {
                    PseudoHeader::Method => req.method.as_str().as_bytes(),
                    PseudoHeader::Authority => authority.as_bytes(),
                    PseudoHeader::Scheme => b"https",
                    PseudoHeader::Path => path.as_bytes(),
                };
                quiche::h3::Header::new(p.name().as_bytes(), value)
            })
            .collect();

        for (k, v) in &req.headers {
            if k.starts_with(':') || k.eq_ignore_ascii_case("host") || is_connection_header(k) {
                continue;
            }
            out.push(quiche::h3::Header::new(k.to_ascii_lowercase().as_bytes(), v.as_bytes()));
        }
        out
    }

    /// Send an HTTP/3 request on a fresh QUIC connection.
    pub async fn send(&self, req: &RawRequest, timeouts: &Timeouts) -> Result<RawResponse> {
        if req.url.scheme() != "https" {
            return Err(Error::http_protocol(format!(
                "Unsupported scheme: {}, only https:// is supported for HTTP/3",
                req.url.scheme()
            )));
        }
        let host = req
            .url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl("URL must have a host".into()))?
            .to_string();
        let port = req.url.port().unwrap_or(443);
        let address = format!("{}:{}", host, port);

        let peer_addr = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::Dns {
                host: host.clone(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| Error::Dns {
                host: host.clone(),
                message: "no such host".to_string(),
            })?;

        let local_addr: SocketAddr = if peer_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local_addr).await?;

        let scid_bytes = generate_cid()?;
        let scid = quiche::ConnectionId::from_ref(&scid_bytes);
        let mut config = self.configure_quic()?;
        let sni = host.parse::<std::net::IpAddr>().is_err().then_some(host.as_str());
        let mut conn = quiche::connect(sni, &scid, socket.local_addr()?, peer_addr, &mut config)
            .map_err(|e| Error::quic(format!("Failed to create QUIC connection: {}", e)))?;

        debug!("QUIC handshake with {} (fingerprinted: {})", address, self.is_fingerprinted());
        let handshake_limit = timeouts.handshake.unwrap_or(DEFAULT_PHASE_TIMEOUT);
        let handshake_start = Instant::now();
        loop {
            if handshake_start.elapsed() > handshake_limit {
                let stats = conn.stats();
                trace!("QUIC handshake stalled: sent={}, recv={}, lost={}", stats.sent, stats.recv, stats.lost);
                return Err(Error::HandshakeTimeout(handshake_limit));
            }
            flush_egress(&mut conn, &socket, peer_addr).await?;
            if conn.is_established() {
                break;
            }
            if conn.is_closed() {
                return Err(Error::quic(format!(
                    "QUIC connection closed during handshake: {:?}",
                    conn.peer_error()
                )));
            }
            match timeout(Duration::from_millis(100), recv_ingress(&socket, &mut conn)).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(e)) => return Err(e),
            }
            sleep(Duration::from_millis(10)).await;
        }

        let mut h3_conn = quiche::h3::Connection::with_transport(&mut conn, &self.h3_config()?)
            .map_err(|e| Error::quic(format!("Failed to create HTTP/3 connection: {}", e)))?;

        let headers = self.request_headers(req);
        let has_body = !req.body.is_empty();
        let stream_id = h3_conn
            .send_request(&mut conn, &headers, !has_body)
            .map_err(|e| Error::quic(format!("Failed to send HTTP/3 request: {}", e)))?;
        if has_body {
            h3_conn
                .send_body(&mut conn, stream_id, &req.body, true)
                .map_err(|e| Error::quic(format!("Failed to send HTTP/3 body: {}", e)))?;
        }
        flush_egress(&mut conn, &socket, peer_addr).await?;

        let ttfb_limit = timeouts.ttfb.unwrap_or(DEFAULT_PHASE_TIMEOUT);
        let idle_limit = timeouts.read_idle.unwrap_or(DEFAULT_PHASE_TIMEOUT);
        let mut last_progress = Instant::now();
        let mut response = ResponseState::default();

        while !response.finished {
            match response.status {
                None if last_progress.elapsed() > ttfb_limit => return Err(Error::TtfbTimeout(ttfb_limit)),
                Some(_) if last_progress.elapsed() > idle_limit => {
                    return Err(Error::ReadIdleTimeout(idle_limit))
                }
                _ => {}
            }

            while let Ok(Ok(())) = timeout(Duration::from_millis(1), recv_ingress(&socket, &mut conn)).await {}

            loop {
                match h3_conn.poll(&mut conn) {
                    Ok((id, quiche::h3::Event::Headers { list, .. })) if id == stream_id => {
                        for header in list {
                            response.on_header(
                                String::from_utf8_lossy(header.name()).into_owned(),
                                String::from_utf8_lossy(header.value()).into_owned(),
                            );
                        }
                        last_progress = Instant::now();
                    }
                    Ok((id, quiche::h3::Event::Data)) if id == stream_id => {
                        let mut buf = vec![0u8; 65535];
                        while let Ok(n) = h3_conn.recv_body(&mut conn, stream_id, &mut buf) {
                            if n == 0 {
                                break;
                            }
                            response.body.extend_from_slice(&buf[..n]);
                        }
                        last_progress = Instant::now();
                    }
                    Ok((id, quiche::h3::Event::Finished)) if id == stream_id => response.finish()?,
                    Ok((_, quiche::h3::Event::Reset { .. })) => {
                        return Err(Error::http_protocol("HTTP/3 stream reset"));
                    }
                    Ok((_, quiche::h3::Event::GoAway)) => {
                        return Err(Error::ConnectionClosed("HTTP/3 GOAWAY received".into()));
                    }
                    Ok(_) => {}
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(Error::quic(format!("HTTP/3 poll error: {}", e))),
                }
            }

            if conn.is_closed() && !response.finished {
                return Err(Error::ConnectionClosed(format!(
                    "QUIC connection closed: {:?}",
                    conn.peer_error()
                )));
            }
            flush_egress(&mut conn, &socket, peer_addr).await?;
            sleep(Duration::from_millis(10)).await;
        }

        let _ = conn.close(true, 0x100, b"");
        let _ = flush_egress(&mut conn, &socket, peer_addr).await;

        Ok(RawResponse {
            status: response.status.unwrap_or(0),
            version: Version::HTTP_3,
            headers: response.headers,
            body: Bytes::from(response.body),
            tls: None,
        })
    }
}

/// Response assembled from HTTP/3 stream events.
#[derive(Debug, Default)]
struct ResponseState {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    finished: bool,
}

impl ResponseState {
    fn on_header(&mut self, name: String, value: String) {
        if name == ":status" {
            self.status = value.parse().ok();
        } else {
            self.headers.push((name, value));
        }
    }

    /// End of stream. Without a status by now there will never be one.
    fn finish(&mut self) -> Result<()> {
        if self.status.is_none() {
            return Err(Error::http_protocol("HTTP/3 stream finished before response headers"));
        }
        self.finished = true;
        Ok(())
    }
}

/// Generate a random connection ID.
fn generate_cid() -> Result<Vec<u8>> {
    let mut cid = vec![0u8; quiche::MAX_CONN_ID_LEN];
    getrandom_fill(&mut cid).map_err(|e| Error::quic(format!("Failed to generate connection ID: {}", e)))?;
    Ok(cid)
}

/// Flush egress packets from QUIC connection to UDP socket.
async fn flush_egress(conn: &mut quiche::Connection, socket: &UdpSocket, peer: SocketAddr) -> Result<()> {
    let mut out = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        match conn.send(&mut out) {
            Ok((0, _)) | Err(quiche::Error::Done) => break,
            Ok((len, _)) => {
                socket.send_to(&out[..len], peer).await?;
            }
            Err(e) => return Err(Error::quic(format!("Failed to send QUIC packet: {}", e))),
        }
    }
    Ok(())
}

/// Receive one datagram and feed it to the QUIC connection.
async fn recv_ingress(socket: &UdpSocket, conn: &mut quiche::Connection) -> Result<()> {
    let mut buf = vec![0u8; 65535];
    match socket.recv_from(&mut buf).await {
        Ok((len, from)) => {
            let info = quiche::RecvInfo {
                from,
                to: socket.local_addr()?,
            };
            match conn.recv(&mut buf[..len], info) {
                Ok(_) | Err(quiche::Error::Done) => Ok(()),
                Err(e) => Err(Error::quic(format!("Failed to process QUIC packet: {}", e))),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use url::Url;

    #[test]
    fn test_default_config_builds() {
        let t = H3Transport::new(None, BrowserFamily::Chrome);
        assert!(!t.is_fingerprinted());
        assert!(t.configure_quic().is_ok());
        assert!(t.h3_config().is_ok());
    }

    #[test]
    fn test_pseudo_header_order_follows_family() {
        let mut req = RawRequest::new(Method::GET, Url::parse("https://example.com/a").unwrap());
        req.headers.push(("Host".into(), "example.com".into()));
        req.headers.push(("Accept".into(), "*/*".into()));

        let chrome = H3Transport::new(None, BrowserFamily::Chrome).request_headers(&req);
        let names: Vec<String> = chrome
            .iter()
            .map(|h| String::from_utf8_lossy(h.name()).into_owned())
            .collect();
        assert_eq!(names, vec![":method", ":authority", ":scheme", ":path", "accept"]);

        let firefox = H3Transport::new(None, BrowserFamily::Firefox).request_headers(&req);
        assert_eq!(firefox[1].name(), b":path");
    }

    #[test]
    fn test_finish_without_status_fails_fast() {
        let mut state = ResponseState::default();
        state.on_header("server".into(), "test".into());
        let err = state.finish().unwrap_err();
        assert!(matches!(err, Error::HttpProtocol(_)));
        assert!(!state.finished);

        let mut state = ResponseState::default();
        state.on_header(":status".into(), "204".into());
        state.finish().unwrap();
        assert!(state.finished);
        assert_eq!(state.status, Some(204));
        assert!(state.headers.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_plain_http() {
        let t = H3Transport::new(None, BrowserFamily::Other);
        let req = RawRequest::new(Method::GET, Url::parse("http://example.com/").unwrap());
        let err = t.send(&req, &Timeouts::default()).await.unwrap_err();
        assert!(matches!(err, Error::HttpProtocol(_)));
    }
}
