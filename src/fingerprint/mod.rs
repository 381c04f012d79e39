//! TLS and HTTP/2 fingerprinting.
//!
//! Fingerprint strings are compiled into a [`ClientHelloSpec`] before any
//! network I/O happens; a bad fingerprint never reaches the dialer.

pub mod browser;
pub mod extensions;
pub mod grease;
pub mod http2;
pub mod ja3;
pub mod ja4;
pub mod ja4r;
pub mod names;
pub mod quic;
pub mod spec;

pub use browser::BrowserFamily;
pub use extensions::{Extension, ExtensionRegistry};
pub use http2::{Http2Fingerprint, Http2Settings, PseudoHeader, PseudoHeaderOrder};
pub use ja3::compile_ja3;
pub use ja4::{Ja4Components, Ja4Fingerprint, Ja4Input};
pub use ja4r::compile_ja4r;
pub use quic::{compile_quic, QuicSpec, QuicTransportParams};
pub use spec::{ClientHelloSpec, TlsVersion};

use crate::error::FingerprintError;

/// Inputs shared by the TLS compilers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions<'a> {
    pub user_agent: &'a str,
    pub force_http1: bool,
    /// Honored by JA4-raw only.
    pub disable_grease: bool,
}

/// Compile a JA3 or JA4-raw string; JA4-raw is recognised by its leading `t`.
pub fn compile(fingerprint: &str, opts: &CompileOptions<'_>) -> Result<ClientHelloSpec, FingerprintError> {
    let fingerprint = fingerprint.trim();
    if fingerprint.starts_with('t') {
        compile_ja4r(fingerprint, opts)
    } else {
        compile_ja3(fingerprint, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_prefix() {
        let opts = CompileOptions {
            user_agent: "Firefox/121",
            ..Default::default()
        };
        let ja3 = compile("771,4865,0-23,29,0", &opts).unwrap();
        assert_eq!(ja3.tls_version_max, TlsVersion::Tls12);
        let ja4 = compile("t13d0102h2_1301_0017", &opts).unwrap();
        assert_eq!(ja4.tls_version_max, TlsVersion::Tls13);
    }
}
