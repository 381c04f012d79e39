//! Request options and environment configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cookie::Cookie;

/// Port used by the socket dispatch front end when `WS_PORT` is unset.
pub const DEFAULT_WS_PORT: u16 = 9112;

/// Port for the socket dispatch front end, from `WS_PORT`.
pub fn ws_port() -> u16 {
    ws_port_from(std::env::var("WS_PORT").ok().as_deref())
}

/// Parse a `WS_PORT` value; missing or invalid values give the default.
pub fn ws_port_from(value: Option<&str>) -> u16 {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => DEFAULT_WS_PORT,
        Some(v) => match v.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                warn!("invalid WS_PORT {:?}, using {}", v, DEFAULT_WS_PORT);
                DEFAULT_WS_PORT
            }
        },
    }
}

/// Per-request options, deserialisable from the JSON wire shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    /// Caller tag echoed on the response.
    pub request_id: Option<String>,
    pub ja3: String,
    /// JA4-raw string; used instead of `ja3` when set.
    pub ja4r: String,
    pub http2_fingerprint: String,
    pub quic_fingerprint: String,
    pub user_agent: String,
    pub proxy: String,
    pub headers: HashMap<String, String>,
    pub header_order: Vec<String>,
    pub body: String,
    pub cookies: Vec<Cookie>,
    /// Total deadline in seconds; 0 keeps the client default.
    pub timeout: u64,
    pub disable_redirect: bool,
    #[serde(rename = "forceHTTP1")]
    pub force_http1: bool,
    #[serde(rename = "forceHTTP3")]
    pub force_http3: bool,
    pub insecure_skip_verify: bool,
    pub disable_grease: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The TLS fingerprint to compile: JA4-raw wins over JA3.
    pub fn tls_fingerprint(&self) -> &str {
        if self.ja4r.trim().is_empty() {
            self.ja3.trim()
        } else {
            self.ja4r.trim()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn profile_key(&self) -> ProfileKey {
        ProfileKey {
            tls_fingerprint: self.tls_fingerprint().to_string(),
            user_agent: self.user_agent.clone(),
            http2_fingerprint: self.http2_fingerprint.trim().to_string(),
            quic_fingerprint: self.quic_fingerprint.trim().to_string(),
            proxy: self.proxy.trim().to_string(),
            force_http1: self.force_http1,
            force_http3: self.force_http3,
            insecure_skip_verify: self.insecure_skip_verify,
            disable_grease: self.disable_grease,
        }
    }
}

/// Everything that shapes a connection. Requests with equal keys share a
/// round-tripper and therefore its connection cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    pub tls_fingerprint: String,
    pub user_agent: String,
    pub http2_fingerprint: String,
    pub quic_fingerprint: String,
    pub proxy: String,
    pub force_http1: bool,
    pub force_http3: bool,
    pub insecure_skip_verify: bool,
    pub disable_grease: bool,
}
