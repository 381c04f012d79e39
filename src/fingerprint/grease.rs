//! GREASE values (RFC 8701).

/// Placeholder written into compiled specs wherever a GREASE value belongs.
///
/// The TLS engine substitutes a per-connection random GREASE value at
/// handshake time; the placeholder only marks the position.
pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

/// All sixteen reserved GREASE values.
pub const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// Check if a u16 value is a GREASE value.
///
/// GREASE values follow the pattern 0x?A?A where both bytes are identical.
pub fn is_grease(val: u16) -> bool {
    let hi = (val >> 8) as u8;
    let lo = val as u8;
    hi == lo && (hi & 0x0F) == 0x0A
}

/// Filter GREASE values from a slice of u16 values.
pub fn filter_grease(values: &[u16]) -> Vec<u16> {
    values.iter().copied().filter(|v| !is_grease(*v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_grease_values_detected() {
        for v in GREASE_VALUES {
            assert!(is_grease(v), "{:#06x} should be GREASE", v);
        }
        assert!(is_grease(GREASE_PLACEHOLDER));
    }

    #[test]
    fn test_real_values_not_grease() {
        for v in [0x1301u16, 0xc02b, 0x0000, 0x0a0b, 0xff01, 0x001d] {
            assert!(!is_grease(v));
        }
    }

    #[test]
    fn test_filter_grease() {
        assert_eq!(filter_grease(&[0x0a0a, 0x1301, 0xfafa, 0x1302]), vec![0x1301, 0x1302]);
    }
}
