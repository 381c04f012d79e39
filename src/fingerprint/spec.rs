//! Compiled ClientHello description.

use sha2::{Digest, Sha256};

use super::browser::BrowserFamily;
use super::extensions::{Extension, KeyShareEntry};
use super::grease::{filter_grease, is_grease};
use crate::error::FingerprintError;

/// TLS protocol version (wire value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum TlsVersion {
    Tls10 = 0x0301,
    Tls11 = 0x0302,
    Tls12 = 0x0303,
    Tls13 = 0x0304,
}

impl TlsVersion {
    pub fn wire(self) -> u16 {
        self as u16
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            0x0301 => Some(Self::Tls10),
            0x0302 => Some(Self::Tls11),
            0x0303 => Some(Self::Tls12),
            0x0304 => Some(Self::Tls13),
            _ => None,
        }
    }

    /// Two-character JA4 token ("13").
    pub fn ja4_token(self) -> &'static str {
        match self {
            Self::Tls10 => "10",
            Self::Tls11 => "11",
            Self::Tls12 => "12",
            Self::Tls13 => "13",
        }
    }
}

/// Supported-version window for a JA3 version token.
///
/// A window always has a floor below its ceiling; a bare single version is
/// never advertised.
pub(crate) fn version_window(token: &str) -> Result<(TlsVersion, TlsVersion), FingerprintError> {
    match token.trim() {
        "770" => Ok((TlsVersion::Tls10, TlsVersion::Tls11)),
        "771" => Ok((TlsVersion::Tls11, TlsVersion::Tls12)),
        "772" => Ok((TlsVersion::Tls12, TlsVersion::Tls13)),
        other => Err(FingerprintError::InvalidVersion(other.to_string())),
    }
}

/// Ordered, GREASE-aware description of a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    pub tls_version_min: TlsVersion,
    pub tls_version_max: TlsVersion,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
    pub family: BrowserFamily,
}

impl ClientHelloSpec {
    /// Supported groups in ClientHello order, GREASE included.
    pub fn curves(&self) -> &[u16] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SupportedGroups(g) => Some(g.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn point_formats(&self) -> &[u8] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::PointFormats(p) => Some(p.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn key_shares(&self) -> &[KeyShareEntry] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::KeyShare(k) => Some(k.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn supported_versions(&self) -> &[u16] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SupportedVersions(v) => Some(v.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn signature_algorithms(&self) -> &[u16] {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::SignatureAlgorithms(s) => Some(s.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Advertised ALPN protocols; empty when the extension is absent.
    pub fn alpn(&self) -> Vec<String> {
        self.extensions
            .iter()
            .find_map(|e| match e {
                Extension::Alpn(p) => Some(p.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn extension_ids(&self) -> Vec<u16> {
        self.extensions.iter().map(Extension::id).collect()
    }

    pub fn has_extension(&self, id: u16) -> bool {
        self.extensions.iter().any(|e| e.id() == id)
    }

    /// Whether any GREASE value appears in the hello.
    pub fn has_grease(&self) -> bool {
        self.cipher_suites.iter().any(|c| is_grease(*c))
            || self.extensions.iter().any(Extension::is_grease)
            || self.curves().iter().any(|c| is_grease(*c))
    }

    /// Re-serialize to JA3 text with GREASE removed.
    ///
    /// The version field is the declared ceiling, matching how a hello is
    /// compiled from a JA3 version token.
    pub fn to_ja3(&self) -> String {
        let version = match self.tls_version_max {
            TlsVersion::Tls13 => 772,
            TlsVersion::Tls12 => 771,
            TlsVersion::Tls11 | TlsVersion::Tls10 => 770,
        };
        let ext_ids: Vec<u16> = self.extension_ids();
        format!(
            "{},{},{},{},{}",
            version,
            join_dash(&filter_grease(&self.cipher_suites)),
            join_dash(&filter_grease(&ext_ids)),
            join_dash(&filter_grease(self.curves())),
            self.point_formats()
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join("-"),
        )
    }

    /// Deterministic 32-byte session id derived from a session ticket.
    pub fn session_id(ticket: &[u8]) -> [u8; 32] {
        Sha256::digest(ticket).into()
    }
}

fn join_dash(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}
