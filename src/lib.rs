//! # Mimic
//!
//! HTTP client that speaks like a browser.
//!
//! A JA3, JA4-raw or QUIC fingerprint string is compiled into a
//! [`ClientHelloSpec`](fingerprint::ClientHelloSpec) before any network I/O.
//! The round-tripper then negotiates HTTP/2 or HTTP/1.1 through ALPN, caches
//! one transport per address, and serialises handshakes per address so a
//! burst of requests performs a single handshake.
//!
//! Failures come back as responses with classified synthetic status codes;
//! only a bad fingerprint is returned as an `Err`.

pub mod classify;
pub mod client;
pub mod config;
pub mod cookie;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod pool;
pub mod response;
pub mod timeouts;
pub mod transport;

pub use classify::{classify, ErrorRecord};
pub use client::{Client, ClientBuilder};
pub use config::RequestOptions;
pub use cookie::{Cookie, CookieJar};
pub use error::{Error, FingerprintError, Result};
pub use fingerprint::{BrowserFamily, ClientHelloSpec, Http2Fingerprint, Ja4Fingerprint};
pub use pool::{Job, JobResult, WorkerPool};
pub use response::Response;
pub use timeouts::Timeouts;
pub use transport::{RoundTripper, RoundTripperConfig};
