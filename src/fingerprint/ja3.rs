//! JA3 → ClientHelloSpec compiler.
//!
//! Also hosts the assembly step shared with the JA4-raw compiler: both
//! front ends reduce their input to a [`RawHello`] and let [`assemble`]
//! apply GREASE placement, key-share augmentation and the recomputed
//! extensions.

use std::str::FromStr;

use tracing::debug;

use super::browser::BrowserFamily;
use super::extensions::{Extension, ExtensionRegistry, KeyShareEntry, EXT_PADDING};
use super::grease::{is_grease, GREASE_PLACEHOLDER};
use super::spec::{version_window, ClientHelloSpec, TlsVersion};
use super::CompileOptions;
use crate::error::FingerprintError;

const X25519: u16 = 29;
const P256: u16 = 23;

/// Fingerprint values before policy is applied.
#[derive(Debug, Clone)]
pub(crate) struct RawHello {
    pub min: TlsVersion,
    pub max: TlsVersion,
    pub ciphers: Vec<u16>,
    /// Decimal extension ids in ClientHello order.
    pub extensions: Vec<String>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
    pub signature_algorithms: Option<Vec<u16>>,
    /// Protocols for the ALPN extension; `None` uses the default pair.
    pub alpn: Option<Vec<String>>,
}

/// Compile a JA3 string.
///
/// Tokens: `version,ciphers,extensions,curves,point_formats` with
/// dash-separated decimal sub-tokens. Empty sub-lists are allowed.
pub fn compile_ja3(ja3: &str, opts: &CompileOptions<'_>) -> Result<ClientHelloSpec, FingerprintError> {
    let fields: Vec<&str> = ja3.trim().split(',').collect();
    if fields.len() != 5 {
        return Err(FingerprintError::Ja3FieldCount {
            fields: fields.len(),
        });
    }

    let (min, max) = version_window(fields[0])?;
    let raw = RawHello {
        min,
        max,
        ciphers: parse_list("cipher", fields[1])?,
        extensions: parse_extension_ids(fields[2])?,
        curves: parse_list("curve", fields[3])?,
        point_formats: parse_list("point format", fields[4])?,
        signature_algorithms: None,
        alpn: None,
    };

    // JA3 has no GREASE switch; family alone decides.
    let opts = CompileOptions {
        disable_grease: false,
        ..*opts
    };
    assemble(raw, &opts)
}

pub(crate) fn parse_list<T: FromStr>(field: &'static str, s: &str) -> Result<Vec<T>, FingerprintError> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split('-')
        .map(|t| {
            t.trim().parse::<T>().map_err(|_| FingerprintError::InvalidNumber {
                field,
                token: t.to_string(),
            })
        })
        .collect()
}

/// Extension ids stay textual: a token that is not a u16 surfaces as
/// "unsupported extension" carrying the caller's exact token.
fn parse_extension_ids(s: &str) -> Result<Vec<String>, FingerprintError> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split('-')
        .map(|t| {
            let t = t.trim();
            t.parse::<u16>()
                .map(|id| id.to_string())
                .map_err(|_| FingerprintError::UnsupportedExtension { id: t.to_string() })
        })
        .collect()
}

/// Apply family policy and build the final spec.
pub(crate) fn assemble(raw: RawHello, opts: &CompileOptions<'_>) -> Result<ClientHelloSpec, FingerprintError> {
    let family = BrowserFamily::from_user_agent(opts.user_agent);
    let grease = family.uses_grease() && !opts.disable_grease;

    // GREASE position is policy-owned: drop any captured GREASE and re-add
    // it in front when the family calls for it.
    let mut ciphers: Vec<u16> = raw.ciphers.iter().copied().filter(|c| !is_grease(*c)).collect();
    let mut curves: Vec<u16> = raw.curves.iter().copied().filter(|c| !is_grease(*c)).collect();
    let key_group = curves.first().copied().unwrap_or(X25519);
    if grease {
        ciphers.insert(0, GREASE_PLACEHOLDER);
        curves.insert(0, GREASE_PLACEHOLDER);
    }

    let mut key_shares = vec![KeyShareEntry { group: key_group }];
    if grease {
        key_shares.insert(0, KeyShareEntry { group: GREASE_PLACEHOLDER });
    } else if family != BrowserFamily::Chrome && key_group != P256 {
        key_shares.push(KeyShareEntry { group: P256 });
    }

    let mut versions = vec![raw.max.wire(), raw.min.wire()];
    if grease {
        versions.insert(0, GREASE_PLACEHOLDER);
    }

    let alpn = if opts.force_http1 {
        vec!["http/1.1".to_string()]
    } else {
        raw.alpn
            .clone()
            .unwrap_or_else(|| vec!["h2".to_string(), "http/1.1".to_string()])
    };

    let registry = ExtensionRegistry::global();
    let mut extensions = Vec::with_capacity(raw.extensions.len() + 2);
    if grease {
        extensions.push(Extension::Grease);
    }
    for id in &raw.extensions {
        if id.parse::<u16>().map(is_grease).unwrap_or(false) {
            continue;
        }
        let ext = match registry.resolve(id)? {
            Extension::SupportedGroups(_) => Extension::SupportedGroups(curves.clone()),
            Extension::PointFormats(_) => Extension::PointFormats(raw.point_formats.clone()),
            Extension::SupportedVersions(_) => Extension::SupportedVersions(versions.clone()),
            Extension::Alpn(_) => Extension::Alpn(alpn.clone()),
            Extension::KeyShare(_) => Extension::KeyShare(key_shares.clone()),
            Extension::SignatureAlgorithms(defaults) => Extension::SignatureAlgorithms(
                raw.signature_algorithms.clone().unwrap_or(defaults),
            ),
            other => other,
        };
        if grease && ext.id() == EXT_PADDING {
            extensions.push(Extension::Grease);
        }
        extensions.push(ext);
    }

    let spec = ClientHelloSpec {
        tls_version_min: raw.min,
        tls_version_max: raw.max,
        cipher_suites: ciphers,
        compression_methods: vec![0],
        extensions,
        family,
    };
    debug!(
        family = family.as_str(),
        ciphers = spec.cipher_suites.len(),
        extensions = spec.extensions.len(),
        max = ?spec.tls_version_max,
        "compiled ClientHello spec"
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/100.0.4896.75 Safari/537.36";
    const FIREFOX_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const CHROME_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0";

    fn opts(ua: &str) -> CompileOptions<'_> {
        CompileOptions {
            user_agent: ua,
            ..Default::default()
        }
    }

    #[test]
    fn test_chrome_scenario() {
        let spec = compile_ja3("771,4865-4866-4867,0-23-65281,29-23-24,0", &opts(CHROME_UA)).unwrap();
        assert_eq!(spec.cipher_suites, vec![GREASE_PLACEHOLDER, 4865, 4866, 4867]);
        assert_eq!(spec.tls_version_max, TlsVersion::Tls12);
        assert_eq!(spec.tls_version_min, TlsVersion::Tls11);
        assert_eq!(
            spec.extensions,
            vec![
                Extension::Grease,
                Extension::ServerName,
                Extension::ExtendedMasterSecret,
                Extension::RenegotiationInfo,
            ]
        );
        assert_eq!(spec.compression_methods, vec![0]);
    }

    #[test]
    fn test_chrome_grease_positions() {
        let spec = compile_ja3(CHROME_JA3, &opts(CHROME_UA)).unwrap();
        assert_eq!(spec.cipher_suites[0], GREASE_PLACEHOLDER);
        assert_eq!(spec.curves()[0], GREASE_PLACEHOLDER);
        assert_eq!(spec.key_shares()[0].group, GREASE_PLACEHOLDER);
        assert_eq!(spec.key_shares()[1].group, 29);
        assert_eq!(spec.supported_versions()[0], GREASE_PLACEHOLDER);
        assert_eq!(spec.extensions[0], Extension::Grease);

        // GREASE sits directly before padding.
        let padding = spec.extensions.iter().position(|e| e.id() == EXT_PADDING).unwrap();
        assert_eq!(spec.extensions[padding - 1], Extension::Grease);
    }

    #[test]
    fn test_firefox_has_no_grease() {
        let spec = compile_ja3(CHROME_JA3, &opts(FIREFOX_UA)).unwrap();
        assert!(!spec.has_grease());
        assert_eq!(spec.cipher_suites[0], 4865);
        assert_eq!(spec.curves()[0], 29);
        // Baseline P-256 share is appended for non-chrome families.
        let groups: Vec<u16> = spec.key_shares().iter().map(|k| k.group).collect();
        assert_eq!(groups, vec![29, 23]);
    }

    #[test]
    fn test_ordering_round_trips() {
        for ua in [CHROME_UA, FIREFOX_UA, "curl/8.0"] {
            let spec = compile_ja3(CHROME_JA3, &opts(ua)).unwrap();
            assert_eq!(spec.to_ja3(), CHROME_JA3);
        }
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = compile_ja3("771,4865,0-111111-23,29,0", &opts(CHROME_UA)).unwrap_err();
        assert_eq!(
            err,
            FingerprintError::UnsupportedExtension {
                id: "111111".to_string()
            }
        );
    }

    #[test]
    fn test_field_count() {
        assert_eq!(
            compile_ja3("771,4865,0", &opts(CHROME_UA)).unwrap_err(),
            FingerprintError::Ja3FieldCount { fields: 3 }
        );
        assert!(compile_ja3("771,4865,0,29,0,1", &opts(CHROME_UA)).is_err());
    }

    #[test]
    fn test_bad_tokens() {
        assert!(matches!(
            compile_ja3("771,48x5,0,29,0", &opts(CHROME_UA)),
            Err(FingerprintError::InvalidNumber { field: "cipher", .. })
        ));
        assert!(matches!(
            compile_ja3("700,4865,0,29,0", &opts(CHROME_UA)),
            Err(FingerprintError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_bad_extension_tokens_name_the_token() {
        for token in ["abc", "70000", "1.5"] {
            let ja3 = format!("771,4865,0-{token},29,0");
            let err = compile_ja3(&ja3, &opts(CHROME_UA)).unwrap_err();
            assert_eq!(err, FingerprintError::UnsupportedExtension { id: token.to_string() });
        }
    }

    #[test]
    fn test_empty_sublists() {
        let spec = compile_ja3("772,4865,,,", &opts(FIREFOX_UA)).unwrap();
        assert!(spec.extensions.is_empty());
        assert_eq!(spec.to_ja3(), "772,4865,,,");
    }

    #[test]
    fn test_alpn_override() {
        let spec = compile_ja3(CHROME_JA3, &opts(CHROME_UA)).unwrap();
        assert_eq!(spec.alpn(), vec!["h2", "http/1.1"]);

        let forced = CompileOptions {
            user_agent: CHROME_UA,
            force_http1: true,
            ..Default::default()
        };
        let spec = compile_ja3(CHROME_JA3, &forced).unwrap();
        assert_eq!(spec.alpn(), vec!["http/1.1"]);
    }

    #[test]
    fn test_recomputed_extensions_follow_input() {
        let a = compile_ja3("772,4865,10-43,29-23,0", &opts(FIREFOX_UA)).unwrap();
        let b = compile_ja3("771,4865,10-43,24,0", &opts(FIREFOX_UA)).unwrap();
        assert_eq!(a.curves(), &[29, 23]);
        assert_eq!(b.curves(), &[24]);
        assert_eq!(a.supported_versions(), &[0x0304, 0x0303]);
        assert_eq!(b.supported_versions(), &[0x0303, 0x0302]);
    }
}
