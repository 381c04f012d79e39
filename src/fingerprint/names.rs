//! IANA code point ↔ BoringSSL name tables.
//!
//! BoringSSL is configured through colon-separated name lists, while
//! fingerprints carry numeric code points.

/// (IANA id, OpenSSL/BoringSSL name, IANA name)
const CIPHERS: &[(u16, &str, &str)] = &[
    (0x1301, "TLS_AES_128_GCM_SHA256", "TLS_AES_128_GCM_SHA256"),
    (0x1302, "TLS_AES_256_GCM_SHA384", "TLS_AES_256_GCM_SHA384"),
    (0x1303, "TLS_CHACHA20_POLY1305_SHA256", "TLS_CHACHA20_POLY1305_SHA256"),
    (0xc02b, "ECDHE-ECDSA-AES128-GCM-SHA256", "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    (0xc02f, "ECDHE-RSA-AES128-GCM-SHA256", "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    (0xc02c, "ECDHE-ECDSA-AES256-GCM-SHA384", "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    (0xc030, "ECDHE-RSA-AES256-GCM-SHA384", "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    (0xcca9, "ECDHE-ECDSA-CHACHA20-POLY1305", "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    (0xcca8, "ECDHE-RSA-CHACHA20-POLY1305", "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
    (0xc009, "ECDHE-ECDSA-AES128-SHA", "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA"),
    (0xc00a, "ECDHE-ECDSA-AES256-SHA", "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA"),
    (0xc013, "ECDHE-RSA-AES128-SHA", "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA"),
    (0xc014, "ECDHE-RSA-AES256-SHA", "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA"),
    (0xc023, "ECDHE-ECDSA-AES128-SHA256", "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256"),
    (0xc027, "ECDHE-RSA-AES128-SHA256", "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256"),
    (0x009c, "AES128-GCM-SHA256", "TLS_RSA_WITH_AES_128_GCM_SHA256"),
    (0x009d, "AES256-GCM-SHA384", "TLS_RSA_WITH_AES_256_GCM_SHA384"),
    (0x003c, "AES128-SHA256", "TLS_RSA_WITH_AES_128_CBC_SHA256"),
    (0x002f, "AES128-SHA", "TLS_RSA_WITH_AES_128_CBC_SHA"),
    (0x0035, "AES256-SHA", "TLS_RSA_WITH_AES_256_CBC_SHA"),
    (0x000a, "DES-CBC3-SHA", "TLS_RSA_WITH_3DES_EDE_CBC_SHA"),
];

const CURVES: &[(u16, &str)] = &[
    (23, "P-256"),
    (24, "P-384"),
    (25, "P-521"),
    (29, "X25519"),
    (4588, "X25519MLKEM768"),
    (25497, "X25519Kyber768Draft00"),
];

const SIGALGS: &[(u16, &str)] = &[
    (0x0401, "rsa_pkcs1_sha256"),
    (0x0501, "rsa_pkcs1_sha384"),
    (0x0601, "rsa_pkcs1_sha512"),
    (0x0201, "rsa_pkcs1_sha1"),
    (0x0403, "ecdsa_secp256r1_sha256"),
    (0x0503, "ecdsa_secp384r1_sha384"),
    (0x0603, "ecdsa_secp521r1_sha512"),
    (0x0203, "ecdsa_sha1"),
    (0x0804, "rsa_pss_rsae_sha256"),
    (0x0805, "rsa_pss_rsae_sha384"),
    (0x0806, "rsa_pss_rsae_sha512"),
    (0x0807, "ed25519"),
];

/// TLS 1.3 suites are fixed by BoringSSL and cannot be set through the cipher list.
pub fn is_tls13_cipher(id: u16) -> bool {
    (0x1301..=0x1303).contains(&id)
}

/// BoringSSL cipher-list name for an IANA id.
pub fn cipher_openssl_name(id: u16) -> Option<&'static str> {
    CIPHERS.iter().find(|(i, _, _)| *i == id).map(|(_, n, _)| *n)
}

/// Map a negotiated cipher name (either spelling) back to its IANA id.
pub fn cipher_id(name: &str) -> Option<u16> {
    CIPHERS
        .iter()
        .find(|(_, openssl, iana)| *openssl == name || *iana == name)
        .map(|(id, _, _)| *id)
}

pub fn curve_name(id: u16) -> Option<&'static str> {
    CURVES.iter().find(|(i, _)| *i == id).map(|(_, n)| *n)
}

pub fn sigalg_name(id: u16) -> Option<&'static str> {
    SIGALGS.iter().find(|(i, _)| *i == id).map(|(_, n)| *n)
}

/// Wire version for a BoringSSL version string ("TLSv1.3").
pub fn version_from_str(name: &str) -> Option<u16> {
    match name {
        "TLSv1.3" => Some(0x0304),
        "TLSv1.2" => Some(0x0303),
        "TLSv1.1" => Some(0x0302),
        "TLSv1" | "TLSv1.0" => Some(0x0301),
        _ => None,
    }
}
