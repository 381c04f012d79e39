//! JA4-raw → ClientHelloSpec compiler.
//!
//! Accepted input: `t13d1516h2_<ciphers>_<extensions>[_<sigalgs>]` where each
//! list is comma-separated 4-hex ids. A 12-hex segment is a hashed JA4
//! component; since hashes are not reversible it is replaced by a canonical
//! per-version set. The result is a best-effort approximation of the
//! original ClientHello, not a bit-for-bit reconstruction.
//!
//! JA4 sorts ciphers and extensions, so the compiled order is numeric.
//! SNI and ALPN, which JA4 strips from the extension list, are re-added
//! from the `d`/`i` flag and the ALPN token.

use super::extensions::{EXT_ALPN, EXT_SERVER_NAME};
use super::ja3::{assemble, RawHello};
use super::spec::{ClientHelloSpec, TlsVersion};
use super::CompileOptions;
use crate::error::FingerprintError;

const CANONICAL_CIPHERS_13: &[u16] = &[
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
    0x009c, 0x009d, 0x002f, 0x0035,
];
const CANONICAL_CIPHERS_12: &[u16] = &[
    0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f,
    0x0035,
];
const CANONICAL_CIPHERS_LEGACY: &[u16] = &[0xc013, 0xc014, 0x002f, 0x0035, 0x000a];

const CANONICAL_EXTENSIONS_13: &[u16] = &[5, 10, 11, 13, 18, 23, 27, 35, 43, 45, 51, 65281];
const CANONICAL_EXTENSIONS_12: &[u16] = &[5, 10, 11, 13, 23, 35, 65281];
const CANONICAL_EXTENSIONS_LEGACY: &[u16] = &[10, 11, 35, 65281];

const DEFAULT_CURVES: &[u16] = &[29, 23, 24];

/// Parsed first segment (`t13d1516h2`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    version: TlsVersion,
    sni: bool,
    alpn: Option<Vec<String>>,
}

fn parse_header(a: &str) -> Result<Header, FingerprintError> {
    if a.len() != 10 || !a.is_ascii() {
        return Err(FingerprintError::InvalidJa4(format!("malformed prefix {a:?}")));
    }
    if !a.starts_with('t') {
        return Err(FingerprintError::InvalidJa4(format!(
            "unsupported transport in {a:?}, only TCP (t) is accepted"
        )));
    }
    let version = match &a[1..3] {
        "13" => TlsVersion::Tls13,
        "12" => TlsVersion::Tls12,
        "11" => TlsVersion::Tls11,
        "10" => TlsVersion::Tls10,
        other => return Err(FingerprintError::InvalidVersion(format!("t{other}"))),
    };
    let sni = match &a[3..4] {
        "d" => true,
        "i" => false,
        other => {
            return Err(FingerprintError::InvalidJa4(format!("unknown SNI flag {other:?}")));
        }
    };
    if !a[4..8].bytes().all(|b| b.is_ascii_digit()) {
        return Err(FingerprintError::InvalidJa4(format!("non-numeric counts in {a:?}")));
    }
    let alpn = match &a[8..10] {
        "00" => None,
        "h2" => Some(vec!["h2".to_string(), "http/1.1".to_string()]),
        "h1" => Some(vec!["http/1.1".to_string()]),
        "h3" => Some(vec!["h3".to_string()]),
        other => {
            return Err(FingerprintError::InvalidJa4(format!("unknown ALPN token {other:?}")));
        }
    };
    Ok(Header { version, sni, alpn })
}

fn is_hash_segment(s: &str) -> bool {
    s.len() == 12 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_hex_list(field: &'static str, s: &str) -> Result<Vec<u16>, FingerprintError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|t| {
            u16::from_str_radix(t.trim(), 16).map_err(|_| FingerprintError::InvalidNumber {
                field,
                token: t.to_string(),
            })
        })
        .collect()
}

/// Compile a JA4-raw string. `opts.disable_grease` is honored.
pub fn compile_ja4r(ja4r: &str, opts: &CompileOptions<'_>) -> Result<ClientHelloSpec, FingerprintError> {
    let parts: Vec<&str> = ja4r.trim().split('_').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(FingerprintError::InvalidJa4(format!(
            "expected 3 or 4 '_'-separated segments, got {}",
            parts.len()
        )));
    }
    let header = parse_header(parts[0])?;

    let ciphers = if is_hash_segment(parts[1]) {
        match header.version {
            _ if parts[1] == "000000000000" => Vec::new(),
            TlsVersion::Tls13 => CANONICAL_CIPHERS_13.to_vec(),
            TlsVersion::Tls12 => CANONICAL_CIPHERS_12.to_vec(),
            TlsVersion::Tls11 | TlsVersion::Tls10 => CANONICAL_CIPHERS_LEGACY.to_vec(),
        }
    } else {
        let mut c = parse_hex_list("cipher", parts[1])?;
        c.sort_unstable();
        c
    };

    let mut extensions = if is_hash_segment(parts[2]) {
        match header.version {
            _ if parts[2] == "000000000000" => Vec::new(),
            TlsVersion::Tls13 => CANONICAL_EXTENSIONS_13.to_vec(),
            TlsVersion::Tls12 => CANONICAL_EXTENSIONS_12.to_vec(),
            TlsVersion::Tls11 | TlsVersion::Tls10 => CANONICAL_EXTENSIONS_LEGACY.to_vec(),
        }
    } else {
        parse_hex_list("extension", parts[2])?
    };
    if header.sni && !extensions.contains(&EXT_SERVER_NAME) {
        extensions.push(EXT_SERVER_NAME);
    }
    if header.alpn.is_some() && !extensions.contains(&EXT_ALPN) {
        extensions.push(EXT_ALPN);
    }
    extensions.sort_unstable();
    extensions.dedup();

    let signature_algorithms = match parts.get(3) {
        Some(s) => Some(parse_hex_list("signature algorithm", s)?),
        None => None,
    };

    let (min, max) = match header.version {
        TlsVersion::Tls13 => (TlsVersion::Tls12, TlsVersion::Tls13),
        TlsVersion::Tls12 => (TlsVersion::Tls11, TlsVersion::Tls12),
        TlsVersion::Tls11 | TlsVersion::Tls10 => (TlsVersion::Tls10, TlsVersion::Tls11),
    };

    let raw = RawHello {
        min,
        max,
        ciphers,
        extensions: extensions.iter().map(|id| id.to_string()).collect(),
        curves: DEFAULT_CURVES.to_vec(),
        point_formats: vec![0],
        signature_algorithms,
        alpn: header.alpn,
    };
    assemble(raw, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::extensions::Extension;
    use crate::fingerprint::grease::GREASE_PLACEHOLDER;

    const CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const RAW: &str = "t13d1516h2_002f,0035,009c,009d,1301,1302,1303,c013,c014,c02b,c02c,c02f,c030,cca8,cca9_0005,000a,000b,000d,0012,0017,001b,0023,002b,002d,0033,4469,ff01_0403,0804,0401,0503,0805,0501,0806,0601";

    fn opts(ua: &str, disable_grease: bool) -> CompileOptions<'_> {
        CompileOptions {
            user_agent: ua,
            force_http1: false,
            disable_grease,
        }
    }

    #[test]
    fn test_explicit_lists() {
        let spec = compile_ja4r(RAW, &opts(CHROME_UA, false)).unwrap();
        assert_eq!(spec.tls_version_max, TlsVersion::Tls13);
        assert_eq!(spec.cipher_suites[0], GREASE_PLACEHOLDER);
        assert_eq!(spec.cipher_suites[1], 0x002f);
        assert_eq!(spec.cipher_suites.len(), 16);
        assert!(spec.has_extension(EXT_SERVER_NAME));
        assert!(spec.has_extension(EXT_ALPN));
        assert_eq!(spec.signature_algorithms()[0], 0x0403);
        assert_eq!(spec.alpn(), vec!["h2", "http/1.1"]);
    }

    #[test]
    fn test_disable_grease() {
        let spec = compile_ja4r(RAW, &opts(CHROME_UA, true)).unwrap();
        assert!(!spec.has_grease());
        assert_eq!(spec.cipher_suites[0], 0x002f);
    }

    #[test]
    fn test_hashed_segments_use_canonical_sets() {
        let spec = compile_ja4r("t13d1516h2_8daaf6152771_e5627efa2ab1", &opts("curl/8", false)).unwrap();
        assert_eq!(spec.cipher_suites, CANONICAL_CIPHERS_13.to_vec());
        assert!(spec.has_extension(43));
        assert!(spec.has_extension(EXT_SERVER_NAME));

        let spec = compile_ja4r("t12i0907h1_8daaf6152771_e5627efa2ab1", &opts("curl/8", false)).unwrap();
        assert_eq!(spec.cipher_suites, CANONICAL_CIPHERS_12.to_vec());
        assert!(!spec.has_extension(EXT_SERVER_NAME));
        assert!(!spec.has_extension(43));
        assert_eq!(spec.alpn(), vec!["http/1.1"]);
    }

    #[test]
    fn test_no_alpn_token() {
        let spec = compile_ja4r("t13d151500_8daaf6152771_e5627efa2ab1", &opts("curl/8", false)).unwrap();
        assert!(!spec.has_extension(EXT_ALPN));
        assert!(spec.extensions.iter().all(|e| !matches!(e, Extension::Alpn(_))));
    }

    #[test]
    fn test_rejects_bad_input() {
        let o = opts(CHROME_UA, false);
        assert!(matches!(
            compile_ja4r("q13d1516h3_8daaf6152771_e5627efa2ab1", &o),
            Err(FingerprintError::InvalidJa4(_))
        ));
        assert!(matches!(
            compile_ja4r("t14d1516h2_8daaf6152771_e5627efa2ab1", &o),
            Err(FingerprintError::InvalidVersion(_))
        ));
        assert!(compile_ja4r("t13d1516h2", &o).is_err());
        assert!(compile_ja4r("t13d1516h2_zz_0005", &o).is_err());
        assert!(matches!(
            compile_ja4r("t13d1516h2_1301_0005,dead", &o),
            Err(FingerprintError::UnsupportedExtension { .. })
        ));
    }
}
