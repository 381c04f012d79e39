//! JA4 emitter: observational fingerprints of a completed exchange.
//!
//! Output shape is `t<NN><d|i>_<cipher>_<ext hash>_<header hash>`, where the
//! cipher is the negotiated suite as 4 hex digits and each hash is the first
//! 4 hex digits of a SHA-256. The HTTP-level `ja4h` follows the FoxIO JA4H
//! layout.

use sha2::{Digest, Sha256};

use super::grease::is_grease;
use super::spec::TlsVersion;
use crate::error::FingerprintError;

/// Inputs observed on one request.
#[derive(Debug, Clone, Copy)]
pub struct Ja4Input<'a> {
    pub tls_version: TlsVersion,
    pub cipher: u16,
    /// Extension ids as sent, GREASE included.
    pub extensions: &'a [u16],
    pub sni: bool,
    pub method: &'a str,
    /// "10", "11", "20" or "30".
    pub http_version: &'a str,
    /// Request headers in wire order.
    pub headers: &'a [(String, String)],
}

/// JA4-family strings for one request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ja4Fingerprint {
    pub ja4: String,
    pub ja4h: String,
    pub user_agent_hash: String,
}

fn hash_prefix(input: &str, len: usize) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..len].to_string()
}

fn hash_or_zero(input: &str, len: usize) -> String {
    if input.is_empty() {
        "0".repeat(len)
    } else {
        hash_prefix(input, len)
    }
}

impl Ja4Fingerprint {
    pub fn observe(input: &Ja4Input<'_>) -> Self {
        let mut exts: Vec<u16> = input
            .extensions
            .iter()
            .copied()
            .filter(|e| !is_grease(*e))
            .collect();
        exts.sort_unstable();
        exts.dedup();
        let ext_list = exts
            .iter()
            .map(|e| format!("{e:04x}"))
            .collect::<Vec<_>>()
            .join(",");

        let names = input
            .headers
            .iter()
            .map(|(k, _)| k.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(",");

        let ja4 = format!(
            "t{}{}_{:04x}_{}_{}",
            input.tls_version.ja4_token(),
            if input.sni { 'd' } else { 'i' },
            input.cipher,
            hash_or_zero(&ext_list, 4),
            hash_or_zero(&names, 4),
        );

        let user_agent = input
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .map(|(_, v)| v.as_str())
            .unwrap_or("");

        Self {
            ja4,
            ja4h: ja4h(input),
            user_agent_hash: hash_or_zero(user_agent, 4),
        }
    }

    pub fn components(&self) -> Result<Ja4Components, FingerprintError> {
        let mut c = Ja4Components::parse(&self.ja4)?;
        c.user_agent_hash = Some(self.user_agent_hash.clone());
        Ok(c)
    }
}

/// FoxIO JA4H: `{method}{version}{c|n}{r|n}{count}{lang}_{names}_{cookies}_{values}`.
fn ja4h(input: &Ja4Input<'_>) -> String {
    let method: String = input
        .method
        .to_ascii_lowercase()
        .chars()
        .chain(std::iter::repeat('0'))
        .take(2)
        .collect();

    let mut cookie_pairs: Vec<(String, String)> = Vec::new();
    let mut has_referer = false;
    let mut lang = String::from("0000");
    let mut names = Vec::new();
    for (name, value) in input.headers {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "cookie" => {
                for pair in value.split(';') {
                    let (k, v) = pair.trim().split_once('=').unwrap_or((pair.trim(), ""));
                    if !k.is_empty() {
                        cookie_pairs.push((k.to_string(), v.to_string()));
                    }
                }
                continue;
            }
            "referer" => {
                has_referer = true;
                continue;
            }
            "accept-language" => {
                let first = value.split([',', ';']).next().unwrap_or("");
                let cleaned: String = first
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .map(|c| c.to_ascii_lowercase())
                    .collect();
                lang = cleaned.chars().chain(std::iter::repeat('0')).take(4).collect();
            }
            _ => {}
        }
        names.push(name.clone());
    }
    cookie_pairs.sort();

    let cookie_names = cookie_pairs
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let cookie_values = cookie_pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "{}{}{}{}{:02}{}_{}_{}_{}",
        method,
        input.http_version,
        if cookie_pairs.is_empty() { 'n' } else { 'c' },
        if has_referer { 'r' } else { 'n' },
        names.len().min(99),
        lang,
        hash_or_zero(&names.join(","), 12),
        hash_or_zero(&cookie_names, 12),
        hash_or_zero(&cookie_values, 12),
    )
}

/// Parsed view of an observational JA4 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja4Components {
    /// `t13d`: transport, version and SNI flag.
    pub tls_version_token: String,
    /// Negotiated cipher, 4 hex digits.
    pub cipher_hash_char: String,
    pub extensions_hash: String,
    pub headers_hash: String,
    pub user_agent_hash: Option<String>,
}

impl Ja4Components {
    /// Parse `t13d_c02f_1a2b_3c4d` with an optional 5th user-agent hash.
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let parts: Vec<&str> = s.trim().split('_').collect();
        if !(4..=5).contains(&parts.len()) {
            return Err(FingerprintError::InvalidJa4(format!(
                "expected 4 or 5 '_'-separated segments, got {}",
                parts.len()
            )));
        }

        let token = parts[0].as_bytes();
        let token_ok = token.len() == 4
            && matches!(token[0], b't' | b'q')
            && token[1].is_ascii_digit()
            && token[2].is_ascii_digit()
            && matches!(token[3], b'd' | b'i');
        if !token_ok {
            return Err(FingerprintError::InvalidJa4(format!(
                "invalid version token {:?}",
                parts[0]
            )));
        }
        for seg in &parts[1..] {
            if seg.len() != 4 || !seg.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(FingerprintError::InvalidJa4(format!(
                    "segment {seg:?} is not 4 hex digits"
                )));
            }
        }

        Ok(Self {
            tls_version_token: parts[0].to_string(),
            cipher_hash_char: parts[1].to_string(),
            extensions_hash: parts[2].to_string(),
            headers_hash: parts[3].to_string(),
            user_agent_hash: parts.get(4).map(|s| s.to_string()),
        })
    }

    pub fn has_sni(&self) -> bool {
        self.tls_version_token.ends_with('d')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<(String, String)> {
        vec![
            ("Host".to_string(), "example.com".to_string()),
            ("User-Agent".to_string(), "Mozilla/5.0 Chrome/120".to_string()),
            ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
            ("Cookie".to_string(), "b=2; a=1".to_string()),
            ("Referer".to_string(), "https://example.com/".to_string()),
        ]
    }

    fn input<'a>(exts: &'a [u16], headers: &'a [(String, String)]) -> Ja4Input<'a> {
        Ja4Input {
            tls_version: TlsVersion::Tls13,
            cipher: 0x1301,
            extensions: exts,
            sni: true,
            method: "GET",
            http_version: "20",
            headers,
        }
    }

    #[test]
    fn test_ja4_shape() {
        let h = headers();
        let fp = Ja4Fingerprint::observe(&input(&[0x0a0a, 0, 16, 43, 51], &h));
        let c = Ja4Components::parse(&fp.ja4).unwrap();
        assert_eq!(c.tls_version_token, "t13d");
        assert_eq!(c.cipher_hash_char, "1301");
        assert!(c.has_sni());
        assert_eq!(fp.user_agent_hash.len(), 4);
    }

    #[test]
    fn test_extension_hash_ignores_grease_and_order() {
        let h = headers();
        let a = Ja4Fingerprint::observe(&input(&[0x0a0a, 0, 16, 43, 51], &h));
        let b = Ja4Fingerprint::observe(&input(&[51, 43, 0xfafa, 16, 0], &h));
        assert_eq!(a.ja4, b.ja4);
    }

    #[test]
    fn test_header_hash_depends_on_order() {
        let h = headers();
        let mut reversed = h.clone();
        reversed.reverse();
        let a = Ja4Fingerprint::observe(&input(&[0], &h));
        let b = Ja4Fingerprint::observe(&input(&[0], &reversed));
        assert_ne!(a.ja4, b.ja4);
    }

    #[test]
    fn test_ja4h_prefix() {
        let h = headers();
        let fp = Ja4Fingerprint::observe(&input(&[0], &h));
        // host, user-agent, accept-language counted; cookie and referer are not.
        assert!(fp.ja4h.starts_with("ge20cr03enus_"), "{}", fp.ja4h);
        assert_eq!(fp.ja4h.split('_').count(), 4);
    }

    #[test]
    fn test_components_parse() {
        let c = Ja4Components::parse("t12i_c02f_ab12_cd34_ef56").unwrap();
        assert_eq!(c.user_agent_hash.as_deref(), Some("ef56"));
        assert!(!c.has_sni());

        assert!(Ja4Components::parse("t12i_c02f_ab12").is_err());
        assert!(Ja4Components::parse("x12i_c02f_ab12_cd34").is_err());
        assert!(Ja4Components::parse("t12i_c02f_ab12_zzzz").is_err());
        assert!(Ja4Components::parse("t12i_c02f_ab12_cd34_ef56_0000").is_err());
    }
}
