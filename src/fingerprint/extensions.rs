//! TLS extension model and the extension registry.
//!
//! The registry maps decimal extension ids (as they appear in JA3 strings)
//! to constructors producing default-populated extensions. Supported groups,
//! point formats and supported versions are registered too, but the
//! compilers always replace their payload with fingerprint-specific values.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::grease::GREASE_PLACEHOLDER;
use crate::error::FingerprintError;

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_STATUS_REQUEST: u16 = 5;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_EC_POINT_FORMATS: u16 = 11;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_STATUS_REQUEST_V2: u16 = 17;
pub const EXT_SCT: u16 = 18;
pub const EXT_PADDING: u16 = 21;
pub const EXT_ENCRYPT_THEN_MAC: u16 = 22;
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 23;
pub const EXT_COMPRESS_CERTIFICATE: u16 = 27;
pub const EXT_RECORD_SIZE_LIMIT: u16 = 28;
pub const EXT_DELEGATED_CREDENTIALS: u16 = 34;
pub const EXT_SESSION_TICKET: u16 = 35;
pub const EXT_PRE_SHARED_KEY: u16 = 41;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_COOKIE: u16 = 44;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 45;
pub const EXT_POST_HANDSHAKE_AUTH: u16 = 49;
pub const EXT_SIGNATURE_ALGORITHMS_CERT: u16 = 50;
pub const EXT_KEY_SHARE: u16 = 51;
pub const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 57;
pub const EXT_NPN: u16 = 13172;
pub const EXT_APPLICATION_SETTINGS_OLD: u16 = 17513;
pub const EXT_APPLICATION_SETTINGS: u16 = 17613;
pub const EXT_CHANNEL_ID_OLD: u16 = 30031;
pub const EXT_CHANNEL_ID: u16 = 30032;
pub const EXT_ENCRYPTED_CLIENT_HELLO: u16 = 65037;
pub const EXT_RENEGOTIATION_INFO: u16 = 65281;

/// Chrome's signature_algorithms list.
pub const DEFAULT_SIGNATURE_ALGORITHMS: &[u16] =
    &[0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601];

/// Certificate compression algorithm (RFC 8879).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertCompressionAlgorithm {
    Zlib = 1,
    Brotli = 2,
    Zstd = 3,
}

impl CertCompressionAlgorithm {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Zlib),
            2 => Some(Self::Brotli),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// One key_share entry. Only the group is fingerprint-relevant; key
/// material is generated by the TLS engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: u16,
}

/// A single ClientHello extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// Host name is filled in at dial time.
    ServerName,
    StatusRequest,
    SupportedGroups(Vec<u16>),
    PointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<u16>),
    Alpn(Vec<String>),
    StatusRequestV2,
    SignedCertificateTimestamp,
    Padding,
    EncryptThenMac,
    ExtendedMasterSecret,
    CompressCertificate(Vec<CertCompressionAlgorithm>),
    RecordSizeLimit(u16),
    DelegatedCredentials(Vec<u16>),
    SessionTicket,
    PreSharedKey,
    SupportedVersions(Vec<u16>),
    Cookie,
    PskKeyExchangeModes(Vec<u8>),
    PostHandshakeAuth,
    SignatureAlgorithmsCert(Vec<u16>),
    KeyShare(Vec<KeyShareEntry>),
    /// Values live in `QuicSpec::transport_params`; the QUIC stack writes the block.
    QuicTransportParameters,
    NextProtocolNegotiation,
    ApplicationSettings { codepoint: u16, protocols: Vec<String> },
    ChannelId { old: bool },
    /// Sent as GREASE ECH by the engine.
    EncryptedClientHello,
    RenegotiationInfo,
    Grease,
    /// Captured extension the registry does not model (QUIC captures only).
    Generic { id: u16, data: Vec<u8> },
}

impl Extension {
    /// The wire id of this extension. GREASE reports the placeholder.
    pub fn id(&self) -> u16 {
        match self {
            Self::ServerName => EXT_SERVER_NAME,
            Self::StatusRequest => EXT_STATUS_REQUEST,
            Self::SupportedGroups(_) => EXT_SUPPORTED_GROUPS,
            Self::PointFormats(_) => EXT_EC_POINT_FORMATS,
            Self::SignatureAlgorithms(_) => EXT_SIGNATURE_ALGORITHMS,
            Self::Alpn(_) => EXT_ALPN,
            Self::StatusRequestV2 => EXT_STATUS_REQUEST_V2,
            Self::SignedCertificateTimestamp => EXT_SCT,
            Self::Padding => EXT_PADDING,
            Self::EncryptThenMac => EXT_ENCRYPT_THEN_MAC,
            Self::ExtendedMasterSecret => EXT_EXTENDED_MASTER_SECRET,
            Self::CompressCertificate(_) => EXT_COMPRESS_CERTIFICATE,
            Self::RecordSizeLimit(_) => EXT_RECORD_SIZE_LIMIT,
            Self::DelegatedCredentials(_) => EXT_DELEGATED_CREDENTIALS,
            Self::SessionTicket => EXT_SESSION_TICKET,
            Self::PreSharedKey => EXT_PRE_SHARED_KEY,
            Self::SupportedVersions(_) => EXT_SUPPORTED_VERSIONS,
            Self::Cookie => EXT_COOKIE,
            Self::PskKeyExchangeModes(_) => EXT_PSK_KEY_EXCHANGE_MODES,
            Self::PostHandshakeAuth => EXT_POST_HANDSHAKE_AUTH,
            Self::SignatureAlgorithmsCert(_) => EXT_SIGNATURE_ALGORITHMS_CERT,
            Self::KeyShare(_) => EXT_KEY_SHARE,
            Self::QuicTransportParameters => EXT_QUIC_TRANSPORT_PARAMETERS,
            Self::NextProtocolNegotiation => EXT_NPN,
            Self::ApplicationSettings { codepoint, .. } => *codepoint,
            Self::ChannelId { old: true } => EXT_CHANNEL_ID_OLD,
            Self::ChannelId { old: false } => EXT_CHANNEL_ID,
            Self::EncryptedClientHello => EXT_ENCRYPTED_CLIENT_HELLO,
            Self::RenegotiationInfo => EXT_RENEGOTIATION_INFO,
            Self::Grease => GREASE_PLACEHOLDER,
            Self::Generic { id, .. } => *id,
        }
    }

    pub fn is_grease(&self) -> bool {
        matches!(self, Self::Grease)
    }
}

type Constructor = fn() -> Extension;

/// Immutable id → constructor table.
pub struct ExtensionRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

static REGISTRY: OnceLock<ExtensionRegistry> = OnceLock::new();

impl ExtensionRegistry {
    /// The process-wide registry, built on first use.
    pub fn global() -> &'static ExtensionRegistry {
        REGISTRY.get_or_init(Self::build)
    }

    fn build() -> Self {
        let entries: [(&'static str, Constructor); 30] = [
            ("0", || Extension::ServerName),
            ("5", || Extension::StatusRequest),
            ("10", || Extension::SupportedGroups(vec![29, 23, 24])),
            ("11", || Extension::PointFormats(vec![0])),
            ("13", || {
                Extension::SignatureAlgorithms(DEFAULT_SIGNATURE_ALGORITHMS.to_vec())
            }),
            ("16", || {
                Extension::Alpn(vec!["h2".to_string(), "http/1.1".to_string()])
            }),
            ("17", || Extension::StatusRequestV2),
            ("18", || Extension::SignedCertificateTimestamp),
            ("21", || Extension::Padding),
            ("22", || Extension::EncryptThenMac),
            ("23", || Extension::ExtendedMasterSecret),
            ("27", || {
                Extension::CompressCertificate(vec![CertCompressionAlgorithm::Brotli])
            }),
            ("28", || Extension::RecordSizeLimit(0x4001)),
            ("34", || Extension::DelegatedCredentials(vec![0x0403, 0x0503, 0x0603, 0x0203])),
            ("35", || Extension::SessionTicket),
            ("41", || Extension::PreSharedKey),
            ("43", || Extension::SupportedVersions(vec![0x0304, 0x0303])),
            ("44", || Extension::Cookie),
            ("45", || Extension::PskKeyExchangeModes(vec![1])),
            ("49", || Extension::PostHandshakeAuth),
            ("50", || {
                Extension::SignatureAlgorithmsCert(DEFAULT_SIGNATURE_ALGORITHMS.to_vec())
            }),
            ("51", || Extension::KeyShare(vec![KeyShareEntry { group: 29 }])),
            ("57", || Extension::QuicTransportParameters),
            ("13172", || Extension::NextProtocolNegotiation),
            ("17513", || Extension::ApplicationSettings {
                codepoint: EXT_APPLICATION_SETTINGS_OLD,
                protocols: vec!["h2".to_string()],
            }),
            ("17613", || Extension::ApplicationSettings {
                codepoint: EXT_APPLICATION_SETTINGS,
                protocols: vec!["h2".to_string()],
            }),
            ("30031", || Extension::ChannelId { old: true }),
            ("30032", || Extension::ChannelId { old: false }),
            ("65037", || Extension::EncryptedClientHello),
            ("65281", || Extension::RenegotiationInfo),
        ];
        Self {
            constructors: entries.into_iter().collect(),
        }
    }

    /// Construct the default extension for a decimal id.
    pub fn resolve(&self, id: &str) -> Result<Extension, FingerprintError> {
        self.constructors
            .get(id)
            .map(|ctor| ctor())
            .ok_or_else(|| FingerprintError::UnsupportedExtension { id: id.to_string() })
    }

    pub fn contains(&self, id: u16) -> bool {
        self.constructors.contains_key(id.to_string().as_str())
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_match_variants() {
        let registry = ExtensionRegistry::global();
        for id in [0u16, 5, 10, 11, 13, 16, 21, 23, 27, 43, 45, 51, 17513, 65037, 65281] {
            let ext = registry.resolve(&id.to_string()).unwrap();
            assert_eq!(ext.id(), id);
        }
    }

    #[test]
    fn test_unknown_extension_names_id() {
        let err = ExtensionRegistry::global().resolve("111111").unwrap_err();
        assert_eq!(
            err,
            FingerprintError::UnsupportedExtension {
                id: "111111".to_string()
            }
        );
        assert!(err.to_string().contains("111111"));
    }

    #[test]
    fn test_registry_is_shared() {
        let a = ExtensionRegistry::global() as *const _;
        let b = ExtensionRegistry::global() as *const _;
        assert_eq!(a, b);
        assert_eq!(ExtensionRegistry::global().len(), 30);
    }

    #[test]
    fn test_alps_codepoints() {
        let registry = ExtensionRegistry::global();
        assert!(registry.contains(17513));
        assert!(registry.contains(17613));
        assert!(!registry.contains(12345));
    }
}
