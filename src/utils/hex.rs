use alloy::primitives::{B256, U256};

/// Clean a hex string by removing "0x" prefix and whitespace
pub fn clean_hex(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Parse an RPC quantity or storage word (`0x`-prefixed or bare hex) into a U256.
///
/// `0x` and the empty string are rejected: nodes return them for pruned or
/// not-yet-indexed state, and callers treat that as "retry later", not as zero.
pub fn parse_word(s: &str) -> Option<U256> {
    let hex = clean_hex(s);
    if hex.is_empty() || hex.len() > 64 {
        return None;
    }
    U256::from_str_radix(hex, 16).ok()
}

/// Convert a string (hex or decimal) to U256
pub fn to_u256(s: &str) -> Option<U256> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.starts_with("0x") || s.starts_with("0X") {
        return parse_word(s);
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return U256::from_str_radix(s, 10).ok();
    }
    None
}

/// Cache representation of a sample: lower-case hex without `0x`, no leading zeros.
pub fn word_to_cache_hex(value: U256) -> String {
    format!("{value:x}")
}

/// Lossy float view of a word; only for presentation values.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .enumerate()
        .map(|(idx, limb)| (*limb as f64) * 2f64.powi(64 * idx as i32))
        .sum()
}

/// 18-decimal fixed point to float.
pub fn wad_to_f64(value: U256) -> f64 {
    u256_to_f64(value) / 1e18
}

pub fn b256_from_hex(s: &str) -> Option<B256> {
    let raw = hex::decode(clean_hex(s)).ok()?;
    (raw.len() == 32).then(|| B256::from_slice(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_word_rejects_empty_responses() {
        assert_eq!(parse_word("0x"), None);
        assert_eq!(parse_word(""), None);
        assert_eq!(parse_word("0xzz"), None);
        assert_eq!(parse_word("0x01"), Some(U256::from(1)));
        assert_eq!(parse_word("ff"), Some(U256::from(255)));
    }

    #[test]
    fn test_parse_word_rejects_oversized_words() {
        let too_long = format!("0x{}", "1".repeat(65));
        assert_eq!(parse_word(&too_long), None);
    }

    #[test]
    fn test_cache_hex_round_trip_preserves_value() {
        let value = U256::from(0xdead_beef_u64) << 100;
        let encoded = word_to_cache_hex(value);
        assert!(!encoded.starts_with("0x"));
        assert_eq!(parse_word(&encoded), Some(value));
    }

    #[test]
    fn test_to_u256_accepts_decimal() {
        assert_eq!(to_u256("1000"), Some(U256::from(1000)));
        assert_eq!(to_u256("12ab"), None);
    }

    #[test]
    fn test_float_views() {
        assert_eq!(u256_to_f64(U256::from(1u64) << 64), 18_446_744_073_709_551_616.0);
        assert!((wad_to_f64(U256::from(2_500_000_000_000_000_000u128)) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_b256_from_hex_requires_32_bytes() {
        assert!(b256_from_hex(&format!("0x{}", "ab".repeat(32))).is_some());
        assert!(b256_from_hex("0xabcd").is_none());
    }
}
