//! HTTP/1.1 transport via hyper.
//!
//! One transport per destination address. It owns a small pool of idle
//! hyper senders; when the pool is empty a fresh connection is obtained
//! from its [`ConnectionSource`], which dials and handshakes with the same
//! ClientHello as the connection that created the transport.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderName, HeaderValue};
use hyper::Request;
use hyper_util::rt::TokioIo;
use http::Version;
use tracing::{debug, trace};

use super::dialer::BoxFuture;
use super::{MaybeHttpsStream, RawRequest, RawResponse, TlsInfo};
use crate::error::{Error, Result};
use crate::timeouts::{within, Timeouts};

/// Idle senders kept per address.
const MAX_IDLE_PER_HOST: usize = 8;

type Sender = http1::SendRequest<Full<Bytes>>;

/// Supplies additional connections to an HTTP/1.1 transport.
pub trait ConnectionSource: Send + Sync {
    fn open<'a>(&'a self, timeouts: &'a Timeouts) -> BoxFuture<'a, Result<MaybeHttpsStream>>;
}

pub struct H1Transport {
    idle: Mutex<Vec<Sender>>,
    source: Box<dyn ConnectionSource>,
    tls: Option<TlsInfo>,
}

impl std::fmt::Debug for H1Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Transport")
            .field("idle", &self.idle_count())
            .field("tls", &self.tls)
            .finish()
    }
}

async fn handshake(stream: MaybeHttpsStream) -> Result<Sender> {
    let (sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::connection(format!("HTTP/1.1 handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("HTTP/1.1 connection ended: {}", e);
        }
    });
    Ok(sender)
}

fn map_hyper_error(e: hyper::Error) -> Error {
    if e.is_canceled() || e.is_closed() || e.is_incomplete_message() {
        Error::ConnectionClosed(e.to_string())
    } else {
        Error::http_protocol(format!("HTTP/1.1 request failed: {}", e))
    }
}

/// Read a body frame by frame; the idle timer restarts on every frame.
pub(crate) async fn collect_incoming(mut body: Incoming, timeouts: &Timeouts) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    loop {
        let frame = within(timeouts.read_idle, async { Ok(body.frame().await) }, Error::ReadIdleTimeout).await?;
        let Some(frame) = frame else { break };
        let frame = frame.map_err(map_hyper_error)?;
        if let Ok(data) = frame.into_data() {
            buf.extend_from_slice(&data);
        }
    }
    Ok(buf.freeze())
}

fn build_request(req: &RawRequest) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(req.method.clone())
        .uri(req.path_and_query())
        .version(Version::HTTP_11);

    let headers = builder
        .headers_mut()
        .ok_or_else(|| Error::http_protocol("invalid request parts"))?;
    if !req.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
        headers.append(
            hyper::header::HOST,
            HeaderValue::from_str(&req.authority())
                .map_err(|e| Error::http_protocol(format!("Invalid host header: {}", e)))?,
        );
    }
    for (key, value) in &req.headers {
        headers.append(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::http_protocol(format!("Invalid header name: {}", e)))?,
            HeaderValue::from_str(value)
                .map_err(|e| Error::http_protocol(format!("Invalid header value: {}", e)))?,
        );
    }

    builder
        .body(Full::new(req.body.clone()))
        .map_err(|e| Error::http_protocol(format!("Failed to build request: {}", e)))
}

impl H1Transport {
    /// Wrap the connection that negotiated HTTP/1.1.
    pub async fn new(stream: MaybeHttpsStream, source: Box<dyn ConnectionSource>) -> Result<Self> {
        let tls = stream.tls_info();
        let sender = handshake(stream).await?;
        Ok(Self {
            idle: Mutex::new(vec![sender]),
            source,
            tls,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn take_idle(&self) -> Option<Sender> {
        let mut idle = self.idle.lock().ok()?;
        while let Some(sender) = idle.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    fn put_idle(&self, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_PER_HOST {
                idle.push(sender);
            }
        }
    }

    async fn checkout(&self, timeouts: &Timeouts) -> Result<Sender> {
        if let Some(mut sender) = self.take_idle() {
            if sender.ready().await.is_ok() {
                trace!("reusing idle HTTP/1.1 connection");
                return Ok(sender);
            }
        }
        debug!("opening additional HTTP/1.1 connection");
        let stream = self.source.open(timeouts).await?;
        handshake(stream).await
    }

    pub async fn send(&self, req: &RawRequest, timeouts: &Timeouts) -> Result<RawResponse> {
        let mut sender = self.checkout(timeouts).await?;
        let request = build_request(req)?;

        let response = within(
            timeouts.ttfb,
            async { sender.send_request(request).await.map_err(map_hyper_error) },
            Error::TtfbTimeout,
        )
        .await?;

        let (parts, body) = response.into_parts();
        let body = collect_incoming(body, timeouts).await?;
        self.put_idle(sender);

        let headers = parts
            .headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();

        Ok(RawResponse {
            status: parts.status.as_u16(),
            version: Version::HTTP_11,
            headers,
            body,
            tls: self.tls.clone(),
        })
    }
}
