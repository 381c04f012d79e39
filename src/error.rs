//! Error types for the mimic crate.

use std::io;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while compiling a fingerprint string into a ClientHello spec.
///
/// These never involve the network: a request carrying a bad fingerprint
/// fails before any connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// JA3 string did not have exactly five comma-separated fields.
    #[error("invalid JA3 string: expected 5 comma-separated fields, got {fields}")]
    Ja3FieldCount { fields: usize },

    /// A numeric sub-token could not be parsed.
    #[error("invalid {field} value {token:?} in fingerprint")]
    InvalidNumber { field: &'static str, token: String },

    /// Declared TLS version has no supported version window.
    #[error("unsupported TLS version token {0:?}")]
    InvalidVersion(String),

    /// Extension ID is not present in the extension registry.
    #[error("unsupported extension {id}")]
    UnsupportedExtension { id: String },

    /// JA4 / JA4-raw string is structurally malformed.
    #[error("invalid JA4 fingerprint: {0}")]
    InvalidJa4(String),

    /// QUIC ClientHello capture is malformed.
    #[error("invalid QUIC fingerprint: {0}")]
    InvalidQuic(String),

    /// HTTP/2 fingerprint string is malformed.
    #[error("invalid HTTP/2 fingerprint: {0}")]
    InvalidHttp2(String),
}

/// Errors that can occur during HTTP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fingerprint compilation failed.
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    /// HTTP protocol error.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// Error text carrying an explicit status code.
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Redirect limit exceeded.
    #[error("stopped after {count} redirects")]
    RedirectLimit { count: u32 },

    /// Invalid redirect URL.
    #[error("Invalid redirect URL: {0}")]
    InvalidRedirectUrl(String),

    /// Request URL could not be used.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Cookie parsing error.
    #[error("Cookie parse error: {0}")]
    CookieParse(String),

    /// Decompression error.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Name resolution failed.
    #[error("lookup {host}: {message}")]
    Dns { host: String, message: String },

    /// TCP connect failed at the socket layer.
    #[error("dial tcp {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Proxy negotiation failed or the proxy scheme is unsupported.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Connect timeout (TCP dial).
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// TLS handshake did not finish in time.
    #[error("TLS handshake timeout after {0:?}")]
    HandshakeTimeout(Duration),

    /// TTFB (time-to-first-byte) timeout.
    #[error("TTFB timeout after {0:?} - server did not respond with headers")]
    TtfbTimeout(Duration),

    /// Read idle timeout (no data received within duration).
    #[error("Read idle timeout after {0:?} - stream may be hung")]
    ReadIdleTimeout(Duration),

    /// Total request deadline exceeded.
    #[error("context deadline exceeded after {0:?}")]
    TotalTimeout(Duration),

    /// Generic timeout error.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A cached connection went away (GOAWAY, reset, driver exit).
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC/HTTP3 error.
    #[error("QUIC error: {0}")]
    Quic(String),

    /// Internal invariant of the connection cache was broken.
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariant(String),
}

impl Error {
    /// Create an HTTP status error.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            message: message.into(),
        }
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a QUIC error.
    pub fn quic(message: impl Into<String>) -> Self {
        Self::Quic(message.into())
    }

    /// Create a proxy error.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy(message.into())
    }

    /// True for errors produced before any network I/O (bad fingerprint).
    pub fn is_compilation(&self) -> bool {
        matches!(self, Self::Fingerprint(_))
    }

    /// True for the timeout family.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_)
                | Self::HandshakeTimeout(_)
                | Self::TtfbTimeout(_)
                | Self::ReadIdleTimeout(_)
                | Self::TotalTimeout(_)
                | Self::Timeout(_)
        )
    }

    /// True when the cached transport behind the request is no longer usable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}
