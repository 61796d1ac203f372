//! Starknet event selector computation.
//!
//! The selector of an event is `starknet_keccak` of its fully-qualified ABI
//! name: keccak256 of the name with the top 6 bits cleared so the result fits
//! a field element (value mod 2^250), e.g.:
//!   starknet_keccak("Transfer")
//!   → 0x99cd8bde557814842a3121e8ddfd433a539b8c9f14bf31ebf108d12e6196e9
//!
//! For raw events, `keys[0]` IS the selector — it is never recomputed from
//! payload bytes, only from subscription names at registry build time.

use tiny_keccak::{Hasher, Keccak};

/// Compute the `starknet_keccak` selector of an event name.
///
/// Returns the normalized `0x…` hex form (lowercase, no leading zeros).
pub fn event_selector(name: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(name.as_bytes());
    hasher.finalize(&mut output);
    // Truncate to 250 bits so the selector is a valid field element.
    output[0] &= 0x03;
    normalize_hex(&format!("0x{}", hex::encode(output)))
}

/// Normalize a hex felt to its canonical form: lowercase, `0x` prefix, no
/// leading zero digits (`0x0` for zero).
///
/// Selectors and addresses arrive from nodes and ABIs in mixed casing and
/// padding; every map key in the registry goes through this first.
pub fn normalize_hex(value: &str) -> String {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let trimmed = stripped.trim_start_matches('0');
    if trimmed.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{}", trimmed.to_ascii_lowercase())
    }
}
