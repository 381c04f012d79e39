//! Transport layer: dialers, the BoringSSL adapter, per-protocol transports
//! and the adaptive round-tripper that ties them together.

pub mod connector;
pub mod dialer;
pub mod h1;
pub mod h2;
pub mod h3;
pub mod roundtripper;

use bytes::Bytes;
use http::{Method, Version};
use url::Url;

pub use connector::{AlpnProtocol, BoringConnector, MaybeHttpsStream, TlsInfo};
pub use dialer::{dialer_for_proxy, Dialer, DirectDialer, HttpProxyDialer, SocksDialer, SocksVersion};
pub use roundtripper::{CachedTransport, DialOutcome, DialPurpose, RoundTripper, RoundTripperConfig, Target};

/// Hop-by-hop headers that must not be forwarded on HTTP/2 and HTTP/3.
pub(crate) const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
];

pub(crate) fn is_connection_header(name: &str) -> bool {
    CONNECTION_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// A request as handed to a transport: headers already ordered.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Path plus query, never empty.
    pub fn path_and_query(&self) -> String {
        let mut path = self.url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(q) = self.url.query() {
            path.push('?');
            path.push_str(q);
        }
        path
    }

    /// `host[:port]`, port omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

/// What a transport hands back: status, ordered headers and the full body.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub tls: Option<TlsInfo>,
}
