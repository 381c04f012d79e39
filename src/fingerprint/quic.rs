//! QUIC fingerprint compiler.
//!
//! Input is `<hex ClientHello>@@<trailer>`: the hex part is the TLS
//! handshake message carried in the QUIC Initial CRYPTO frame, and the
//! trailer holds the HTTP/3 SETTINGS as `id:value` pairs separated by
//! commas. The captured extension order is kept verbatim, GREASE included.

use tls_parser::nom::combinator::{all_consuming, complete, map};
use tls_parser::nom::multi::{length_data, many0};
use tls_parser::nom::number::complete::{be_u16, be_u8};
use tls_parser::nom::sequence::pair;
use tls_parser::nom::IResult;
use tls_parser::{
    parse_tls_extensions, parse_tls_message_handshake, QuicTransportParam, TlsExtension,
    TlsExtensionType, TlsMessage, TlsMessageHandshake,
};

use super::browser::BrowserFamily;
use super::extensions::{
    CertCompressionAlgorithm, Extension, ExtensionRegistry, KeyShareEntry,
    EXT_APPLICATION_SETTINGS, EXT_APPLICATION_SETTINGS_OLD, EXT_COMPRESS_CERTIFICATE,
};
use super::grease::is_grease;
use super::spec::{ClientHelloSpec, TlsVersion};
use crate::error::FingerprintError;

/// Smallest handshake message that can hold a ClientHello with at least
/// one cipher suite and one extension header.
pub const MIN_CLIENT_HELLO_LEN: usize = 47;

/// QUIC transport parameters the HTTP/3 transport can apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicTransportParams {
    pub max_idle_timeout: Option<u64>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub active_connection_id_limit: Option<u64>,
    /// Parameter ids in capture order, including ones not applied.
    pub order: Vec<u64>,
}

impl QuicTransportParams {
    fn from_parsed(params: &[QuicTransportParam<'_>]) -> Self {
        let mut out = Self::default();
        for param in params {
            let id = match param {
                QuicTransportParam::OriginalDestinationConnectionId(_) => 0x00,
                QuicTransportParam::MaxIdleTimeout(v) => {
                    out.max_idle_timeout = Some(*v);
                    0x01
                }
                QuicTransportParam::StatelessResetToken(_) => 0x02,
                QuicTransportParam::MaxUdpPayloadSize(v) => {
                    out.max_udp_payload_size = Some(*v);
                    0x03
                }
                QuicTransportParam::InitialMaxData(v) => {
                    out.initial_max_data = Some(*v);
                    0x04
                }
                QuicTransportParam::InitialMaxStreamDataBidiLocal(v) => {
                    out.initial_max_stream_data_bidi_local = Some(*v);
                    0x05
                }
                QuicTransportParam::InitialMaxStreamDataBidiRemote(v) => {
                    out.initial_max_stream_data_bidi_remote = Some(*v);
                    0x06
                }
                QuicTransportParam::InitialMaxStreamDataUni(v) => {
                    out.initial_max_stream_data_uni = Some(*v);
                    0x07
                }
                QuicTransportParam::InitialMaxStreamsBidi(v) => {
                    out.initial_max_streams_bidi = Some(*v);
                    0x08
                }
                QuicTransportParam::InitialMaxStreamsUni(v) => {
                    out.initial_max_streams_uni = Some(*v);
                    0x09
                }
                QuicTransportParam::AckDelayExponent(_) => 0x0a,
                QuicTransportParam::MaxAckDelay(_) => 0x0b,
                QuicTransportParam::DisableActiveMigration => 0x0c,
                QuicTransportParam::PreferredAddress(_) => 0x0d,
                QuicTransportParam::ActiveConnectionIdLimit(v) => {
                    out.active_connection_id_limit = Some(*v);
                    0x0e
                }
                QuicTransportParam::InitialSourceConnectionId(_) => 0x0f,
                QuicTransportParam::RetrySourceConnectionId(_) => 0x10,
                QuicTransportParam::Unknown(id, _) => *id,
            };
            out.order.push(id);
        }
        out
    }
}

/// Compiled QUIC fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicSpec {
    pub hello: ClientHelloSpec,
    /// HTTP/3 SETTINGS in trailer order.
    pub h3_settings: Vec<(u64, u64)>,
    pub transport_params: QuicTransportParams,
}

impl QuicSpec {
    pub fn h3_setting(&self, id: u64) -> Option<u64> {
        self.h3_settings.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
    }
}

fn key_share_groups(data: &[u8]) -> IResult<&[u8], Vec<KeyShareEntry>> {
    let (rest, list) = length_data(be_u16)(data)?;
    let entry = map(pair(be_u16, length_data(be_u16)), |(group, _)| KeyShareEntry { group });
    let (_, entries) = all_consuming(many0(complete(entry)))(list)?;
    Ok((rest, entries))
}

fn protocol_list(data: &[u8]) -> IResult<&[u8], Vec<String>> {
    let (rest, list) = length_data(be_u16)(data)?;
    let name = map(length_data(be_u8), |p: &[u8]| String::from_utf8_lossy(p).into_owned());
    let (_, names) = all_consuming(many0(complete(name)))(list)?;
    Ok((rest, names))
}

fn compression_algorithms(data: &[u8]) -> IResult<&[u8], Vec<CertCompressionAlgorithm>> {
    let (rest, list) = length_data(be_u8)(data)?;
    let (_, ids) = all_consuming(many0(complete(be_u16)))(list)?;
    Ok((rest, ids.into_iter().filter_map(CertCompressionAlgorithm::from_id).collect()))
}

/// Map a parsed extension to its spec form. Transport parameters found on
/// the way are stored in `params`.
fn convert_extension(
    ext: &TlsExtension<'_>,
    params: &mut Option<QuicTransportParams>,
) -> Result<Extension, FingerprintError> {
    let id: u16 = TlsExtensionType::from(ext).into();
    if is_grease(id) {
        return Ok(Extension::Grease);
    }
    let malformed = |e: tls_parser::nom::Err<tls_parser::nom::error::Error<&[u8]>>| {
        FingerprintError::InvalidQuic(format!("malformed extension {id}: {e}"))
    };

    let converted = match ext {
        TlsExtension::EllipticCurves(groups) => Extension::SupportedGroups(groups.iter().map(|g| g.0).collect()),
        TlsExtension::EcPointFormats(formats) => Extension::PointFormats(formats.to_vec()),
        TlsExtension::SignatureAlgorithms(algs) => Extension::SignatureAlgorithms(algs.clone()),
        TlsExtension::ALPN(protocols) => Extension::Alpn(
            protocols.iter().map(|p| String::from_utf8_lossy(p).into_owned()).collect(),
        ),
        TlsExtension::RecordSizeLimit(limit) => Extension::RecordSizeLimit(*limit),
        TlsExtension::SupportedVersions(versions) => {
            Extension::SupportedVersions(versions.iter().map(|v| v.0).collect())
        }
        TlsExtension::PskExchangeModes(modes) => Extension::PskKeyExchangeModes(modes.clone()),
        TlsExtension::KeyShare(raw) => Extension::KeyShare(key_share_groups(raw).map_err(malformed)?.1),
        TlsExtension::QuicTransportParameters(parsed) => {
            *params = Some(QuicTransportParams::from_parsed(parsed));
            Extension::QuicTransportParameters
        }
        TlsExtension::Unknown(_, data) => match id {
            EXT_COMPRESS_CERTIFICATE => {
                Extension::CompressCertificate(compression_algorithms(data).map_err(malformed)?.1)
            }
            EXT_APPLICATION_SETTINGS | EXT_APPLICATION_SETTINGS_OLD => Extension::ApplicationSettings {
                codepoint: id,
                protocols: protocol_list(data).map_err(malformed)?.1,
            },
            _ => ExtensionRegistry::global()
                .resolve(&id.to_string())
                .unwrap_or_else(|_| Extension::Generic { id, data: data.to_vec() }),
        },
        _ => ExtensionRegistry::global()
            .resolve(&id.to_string())
            .unwrap_or(Extension::Generic { id, data: Vec::new() }),
    };
    Ok(converted)
}

fn parse_trailer(trailer: &str) -> Result<Vec<(u64, u64)>, FingerprintError> {
    let trailer = trailer.trim();
    if trailer.is_empty() {
        return Ok(Vec::new());
    }
    trailer
        .split(|c| c == ',' || c == ';')
        .map(|pair| {
            let (k, v) = pair
                .split_once(':')
                .ok_or_else(|| FingerprintError::InvalidQuic(format!("malformed setting {pair:?}")))?;
            let k = k.trim().parse::<u64>();
            let v = v.trim().parse::<u64>();
            match (k, v) {
                (Ok(k), Ok(v)) => Ok((k, v)),
                _ => Err(FingerprintError::InvalidQuic(format!("malformed setting {pair:?}"))),
            }
        })
        .collect()
}

/// Compile a QUIC fingerprint.
pub fn compile_quic(fingerprint: &str, user_agent: &str) -> Result<QuicSpec, FingerprintError> {
    let (hex_part, trailer) = fingerprint
        .split_once("@@")
        .ok_or_else(|| FingerprintError::InvalidQuic("missing @@ marker".to_string()))?;
    let hex_part = hex_part.trim();
    if hex_part.is_empty() {
        return Err(FingerprintError::InvalidQuic("empty ClientHello payload".to_string()));
    }
    let bytes = hex::decode(hex_part)
        .map_err(|e| FingerprintError::InvalidQuic(format!("invalid hex: {e}")))?;
    if bytes.len() < MIN_CLIENT_HELLO_LEN {
        return Err(FingerprintError::InvalidQuic(format!(
            "ClientHello is {} bytes, need at least {}",
            bytes.len(),
            MIN_CLIENT_HELLO_LEN
        )));
    }

    let (_, message) = parse_tls_message_handshake(&bytes)
        .map_err(|e| FingerprintError::InvalidQuic(format!("unreadable handshake message: {e}")))?;
    let TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) = message else {
        return Err(FingerprintError::InvalidQuic("not a ClientHello handshake message".to_string()));
    };
    let ciphers: Vec<u16> = hello.ciphers.iter().map(|c| c.0).collect();

    let (_, parsed) = parse_tls_extensions(hello.ext.unwrap_or_default())
        .map_err(|e| FingerprintError::InvalidQuic(format!("unreadable extensions: {e}")))?;
    let mut transport_params = None;
    let mut extensions = Vec::with_capacity(parsed.len());
    for ext in &parsed {
        extensions.push(convert_extension(ext, &mut transport_params)?);
    }
    let transport_params = transport_params.ok_or_else(|| {
        FingerprintError::InvalidQuic("missing quic_transport_parameters extension".to_string())
    })?;

    let h3 = vec!["h3".to_string()];
    match extensions.iter_mut().find(|e| matches!(e, Extension::Alpn(_))) {
        Some(alpn) => *alpn = Extension::Alpn(h3),
        None => extensions.push(Extension::Alpn(h3)),
    }

    Ok(QuicSpec {
        hello: ClientHelloSpec {
            tls_version_min: TlsVersion::Tls13,
            tls_version_max: TlsVersion::Tls13,
            cipher_suites: ciphers,
            // QUIC forbids anything but null compression.
            compression_methods: vec![0],
            extensions,
            family: BrowserFamily::from_user_agent(user_agent),
        },
        h3_settings: parse_trailer(trailer)?,
        transport_params,
    })
}
