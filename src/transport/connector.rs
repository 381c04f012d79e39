//! BoringSSL adapter: applies a [`ClientHelloSpec`] to the TLS engine.

use boring::ssl::{
    ConnectConfiguration, SslConnector, SslContextBuilder, SslMethod, SslOptions, SslRef,
    SslVerifyMode, SslVersion,
};
use boring::x509::X509;
use std::io;
use std::io::Read;
use std::net::IpAddr;
use std::os::raw::c_int;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;
use tracing::{debug, trace};

use boring_sys::{CRYPTO_BUFFER, SSL, SSL_CTX};

use crate::error::{Error, Result};
use crate::fingerprint::extensions::{CertCompressionAlgorithm, Extension};
use crate::fingerprint::grease::is_grease;
use crate::fingerprint::names;
use crate::fingerprint::{ClientHelloSpec, TlsVersion};

fn into_crypto_buffer(out: *mut *mut CRYPTO_BUFFER, data: &[u8], expected: usize) -> c_int {
    if data.len() != expected {
        return 0;
    }
    // CRYPTO_BUFFER_new copies, so `data` may be dropped afterwards.
    let buffer = unsafe { boring_sys::CRYPTO_BUFFER_new(data.as_ptr(), data.len(), std::ptr::null_mut()) };
    if buffer.is_null() {
        return 0;
    }
    unsafe { *out = buffer };
    1
}

/// Brotli certificate decompression callback.
unsafe extern "C" fn decompress_brotli_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    match brotli::Decompressor::new(compressed, 4096).read_to_end(&mut decompressed) {
        Ok(_) => into_crypto_buffer(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}

/// Zlib certificate decompression callback (RFC 8879 uses zlib framing).
unsafe extern "C" fn decompress_zlib_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    match flate2::read::ZlibDecoder::new(compressed).read_to_end(&mut decompressed) {
        Ok(_) => into_crypto_buffer(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}

/// Zstd certificate decompression callback.
unsafe extern "C" fn decompress_zstd_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    match zstd::bulk::decompress(compressed, uncompressed_len) {
        Ok(decompressed) => into_crypto_buffer(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}

fn ssl_version(v: TlsVersion) -> SslVersion {
    match v {
        TlsVersion::Tls10 => SslVersion::TLS1,
        TlsVersion::Tls11 => SslVersion::TLS1_1,
        TlsVersion::Tls12 => SslVersion::TLS1_2,
        TlsVersion::Tls13 => SslVersion::TLS1_3,
    }
}

/// ALPN protocols in wire format (length-prefixed).
pub fn alpn_wire(protocols: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in protocols {
        if p.is_empty() || p.len() > 255 {
            continue;
        }
        out.push(p.len() as u8);
        out.extend_from_slice(p.as_bytes());
    }
    out
}

/// Apply the context-level parts of a spec. Shared by TCP/TLS and QUIC.
pub fn apply_spec(builder: &mut SslContextBuilder, spec: &ClientHelloSpec) -> Result<()> {
    builder
        .set_min_proto_version(Some(ssl_version(spec.tls_version_min)))
        .map_err(|e| Error::tls(format!("Failed to set min TLS version: {}", e)))?;
    builder
        .set_max_proto_version(Some(ssl_version(spec.tls_version_max)))
        .map_err(|e| Error::tls(format!("Failed to set max TLS version: {}", e)))?;

    // TLS 1.3 suites are fixed by BoringSSL; only the legacy list is configurable.
    let ciphers: Vec<&str> = spec
        .cipher_suites
        .iter()
        .filter(|c| !is_grease(**c) && !names::is_tls13_cipher(**c))
        .filter_map(|c| {
            let name = names::cipher_openssl_name(*c);
            if name.is_none() {
                trace!("cipher {:#06x} has no BoringSSL name, skipped", c);
            }
            name
        })
        .collect();
    if !ciphers.is_empty() {
        builder
            .set_cipher_list(&ciphers.join(":"))
            .map_err(|e| Error::tls(format!("Failed to set cipher list: {}", e)))?;
    }

    let curves: Vec<&str> = spec
        .curves()
        .iter()
        .filter(|c| !is_grease(**c))
        .filter_map(|c| names::curve_name(*c))
        .collect();
    if !curves.is_empty() {
        builder
            .set_curves_list(&curves.join(":"))
            .map_err(|e| Error::tls(format!("Failed to set curves: {}", e)))?;
    }

    let sigalgs: Vec<&str> = spec
        .signature_algorithms()
        .iter()
        .filter_map(|s| names::sigalg_name(*s))
        .collect();
    if !sigalgs.is_empty() {
        builder
            .set_sigalgs_list(&sigalgs.join(":"))
            .map_err(|e| Error::tls(format!("Failed to set signature algorithms: {}", e)))?;
    }

    let alpn = alpn_wire(&spec.alpn());
    if !alpn.is_empty() {
        builder
            .set_alpn_protos(&alpn)
            .map_err(|e| Error::tls(format!("Failed to set ALPN: {}", e)))?;
    }

    if !spec.has_extension(crate::fingerprint::extensions::EXT_SESSION_TICKET) {
        builder.set_options(SslOptions::NO_TICKET);
    }

    unsafe {
        let ctx = builder.as_ptr() as *mut SSL_CTX;
        boring_sys::SSL_CTX_set_grease_enabled(ctx, c_int::from(spec.has_grease()));
        // Extension order is part of the fingerprint.
        boring_sys::SSL_CTX_set_permute_extensions(ctx, 0);

        for ext in &spec.extensions {
            match ext {
                Extension::StatusRequest => boring_sys::SSL_CTX_enable_ocsp_stapling(ctx),
                Extension::SignedCertificateTimestamp => {
                    boring_sys::SSL_CTX_enable_signed_cert_timestamps(ctx)
                }
                Extension::CompressCertificate(algs) => {
                    for alg in algs {
                        let callback = match alg {
                            CertCompressionAlgorithm::Brotli => decompress_brotli_cert,
                            CertCompressionAlgorithm::Zlib => decompress_zlib_cert,
                            CertCompressionAlgorithm::Zstd => decompress_zstd_cert,
                        };
                        boring_sys::SSL_CTX_add_cert_compression_alg(
                            ctx,
                            *alg as u16,
                            None,
                            Some(callback),
                        );
                    }
                }
                Extension::ServerName
                | Extension::SupportedGroups(_)
                | Extension::PointFormats(_)
                | Extension::SignatureAlgorithms(_)
                | Extension::Alpn(_)
                | Extension::SessionTicket
                | Extension::SupportedVersions(_)
                | Extension::KeyShare(_)
                | Extension::ApplicationSettings { .. }
                | Extension::EncryptedClientHello
                | Extension::Grease => {}
                other => trace!("extension {} has no engine knob", other.id()),
            }
        }
    }
    Ok(())
}

/// Apply the per-connection parts of a spec (ALPS, ECH GREASE).
fn configure_connection(ssl: &mut SslRef, spec: &ClientHelloSpec) {
    for ext in &spec.extensions {
        match ext {
            Extension::ApplicationSettings { protocols, .. } => {
                for proto in protocols {
                    let rc = unsafe {
                        boring_sys::SSL_add_application_settings(
                            ssl.as_ptr(),
                            proto.as_ptr(),
                            proto.len(),
                            std::ptr::null(),
                            0,
                        )
                    };
                    if rc != 1 {
                        trace!("ALPS for {} not accepted", proto);
                    }
                }
            }
            Extension::EncryptedClientHello => unsafe {
                boring_sys::SSL_set_enable_ech_grease(ssl.as_ptr(), 1);
            },
            _ => {}
        }
    }
}

/// Negotiated TLS parameters of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    pub version: Option<TlsVersion>,
    pub cipher: Option<u16>,
    pub alpn: Option<String>,
}

/// BoringSSL-based TLS connector.
#[derive(Clone, Default)]
pub struct BoringConnector {
    insecure: bool,
    root_certs: Vec<Vec<u8>>,
}

impl BoringConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip certificate and hostname verification.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Add custom root certificates (DER or PEM).
    pub fn with_root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    fn configure_ssl(&self, spec: &ClientHelloSpec) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::tls(format!("Failed to create SSL connector: {}", e)))?;

        for cert_bytes in &self.root_certs {
            let cert = X509::from_der(cert_bytes).or_else(|_| X509::from_pem(cert_bytes));
            match cert {
                Ok(cert) => {
                    if let Err(e) = builder.cert_store_mut().add_cert(cert) {
                        debug!("root certificate rejected: {}", e);
                    }
                }
                Err(e) => debug!("root certificate not parseable: {}", e),
            }
        }

        apply_spec(&mut builder, spec)?;
        if self.insecure {
            builder.set_verify(SslVerifyMode::NONE);
        }
        Ok(builder.build())
    }

    fn connect_configuration(&self, spec: &ClientHelloSpec, host: &str) -> Result<ConnectConfiguration> {
        let connector = self.configure_ssl(spec)?;
        let mut config = connector
            .configure()
            .map_err(|e| Error::tls(format!("Failed to configure SSL: {}", e)))?;

        let sni = spec.has_extension(crate::fingerprint::extensions::EXT_SERVER_NAME)
            && host.parse::<IpAddr>().is_err();
        config.set_use_server_name_indication(sni);
        if self.insecure {
            config.set_verify_hostname(false);
        }
        configure_connection(&mut config, spec);
        Ok(config)
    }

    /// Drive a TLS handshake on an established TCP stream.
    pub async fn handshake(
        &self,
        spec: &ClientHelloSpec,
        host: &str,
        tcp: TcpStream,
    ) -> Result<SslStream<TcpStream>> {
        let config = self.connect_configuration(spec, host)?;
        trace!("TLS handshake with {}", host);
        tokio_boring::connect(config, host, tcp)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))
    }
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    H2,
    Http1,
    /// No ALPN negotiated or unknown protocol
    Unknown,
}

impl AlpnProtocol {
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2)
    }
}

/// Stream that can be either HTTP (plain TCP) or HTTPS (TLS).
#[derive(Debug)]
pub enum MaybeHttpsStream {
    Http(TcpStream),
    Https(SslStream<TcpStream>),
}

impl MaybeHttpsStream {
    /// Protocol selected during the handshake. Plain TCP has no ALPN.
    pub fn alpn_protocol(&self) -> AlpnProtocol {
        match self {
            MaybeHttpsStream::Http(_) => AlpnProtocol::Unknown,
            MaybeHttpsStream::Https(stream) => match stream.ssl().selected_alpn_protocol() {
                Some(b"h2") => AlpnProtocol::H2,
                Some(b"http/1.1") => AlpnProtocol::Http1,
                _ => AlpnProtocol::Unknown,
            },
        }
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        let MaybeHttpsStream::Https(stream) = self else {
            return None;
        };
        let ssl = stream.ssl();
        Some(TlsInfo {
            version: names::version_from_str(ssl.version_str()).and_then(TlsVersion::from_wire),
            cipher: ssl.current_cipher().and_then(|c| names::cipher_id(c.name())),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        })
    }
}

impl AsyncRead for MaybeHttpsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeHttpsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_flush(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{compile_ja3, CompileOptions};

    #[test]
    fn test_alpn_wire() {
        let wire = alpn_wire(&["h2".to_string(), "http/1.1".to_string()]);
        assert_eq!(wire, b"\x02h2\x08http/1.1".to_vec());
        assert!(alpn_wire(&[]).is_empty());
    }

    #[test]
    fn test_apply_chrome_spec() {
        let spec = compile_ja3(
            "771,4865-4866-4867-49195-49199-52393,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-21,29-23-24,0",
            &CompileOptions {
                user_agent: "Chrome/120",
                ..Default::default()
            },
        )
        .unwrap();
        let connector = BoringConnector::new();
        assert!(connector.configure_ssl(&spec).is_ok());
        assert!(connector.connect_configuration(&spec, "127.0.0.1").is_ok());
    }

    /// Extension ids of the ClientHello the connector puts on the wire.
    async fn wire_extension_ids(spec: &ClientHelloSpec) -> Vec<u16> {
        use tls_parser::{parse_tls_extensions, parse_tls_plaintext, TlsExtensionType, TlsMessage, TlsMessageHandshake};
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let capture = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut record = vec![0u8; 5];
            sock.read_exact(&mut record).await.unwrap();
            let len = u16::from_be_bytes([record[3], record[4]]) as usize;
            record.resize(5 + len, 0);
            sock.read_exact(&mut record[5..]).await.unwrap();
            record
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = BoringConnector::new().insecure(true);
        let (record, _) = tokio::join!(capture, connector.handshake(spec, "example.com", tcp));
        let record = record.unwrap();

        let (_, plaintext) = parse_tls_plaintext(&record).unwrap();
        let hello = plaintext
            .msg
            .iter()
            .find_map(|m| match m {
                TlsMessage::Handshake(TlsMessageHandshake::ClientHello(ch)) => Some(ch),
                _ => None,
            })
            .unwrap();
        let (_, extensions) = parse_tls_extensions(hello.ext.unwrap()).unwrap();
        extensions.iter().map(|e| u16::from(TlsExtensionType::from(e))).collect()
    }

    #[tokio::test]
    async fn test_chrome_grease_precedes_padding_on_the_wire() {
        use crate::fingerprint::extensions::{EXT_PADDING, EXT_PRE_SHARED_KEY};

        let spec = compile_ja3(
            "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0",
            &CompileOptions {
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
                ..Default::default()
            },
        )
        .unwrap();
        let padding = spec.extensions.iter().position(|e| e.id() == EXT_PADDING).unwrap();
        assert_eq!(spec.extensions[padding - 1], Extension::Grease);

        let ids = wire_extension_ids(&spec).await;
        assert!(is_grease(ids[0]), "{ids:?}");
        let last_grease = ids.iter().rposition(|id| is_grease(*id)).unwrap();
        assert!(last_grease > 0, "{ids:?}");
        assert!(
            ids[last_grease + 1..].iter().all(|id| *id == EXT_PADDING || *id == EXT_PRE_SHARED_KEY),
            "{ids:?}"
        );
        if let Some(p) = ids.iter().position(|id| *id == EXT_PADDING) {
            assert_eq!(p, last_grease + 1, "{ids:?}");
        }
    }
}
